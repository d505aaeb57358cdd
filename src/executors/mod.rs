//! Host-supplied task callbacks
//!
//! The execution core never moves bytes or talks to a job cluster itself; it
//! calls a [`TaskCallbacks`] implementation. [`HostCallbacks`] is the one the
//! CLI wires up: local processes for transfer/query tasks and a REST client
//! for the external job system.

pub mod http;
pub mod shell;

use crate::models::{ExternalStatus, ExternalStepHandle, StepDefinition, TaskParams, MAX_OUTPUT_SIZE};
use async_trait::async_trait;
pub use http::HttpJobClient;
pub use shell::ShellCallbacks;

/// Per-kind callbacks invoked by the scheduler
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TaskCallbacks: Send + Sync {
    /// Move data between systems (extract, stage, upload)
    async fn data_transfer(&self, params: &TaskParams) -> anyhow::Result<()>;

    /// Run a query against an external warehouse or database
    async fn external_query(&self, params: &TaskParams) -> anyhow::Result<()>;

    /// Submit a step definition to the external job system.
    ///
    /// `request_key` is stable for one attempt of one task in one run, so the
    /// job system can drop a resent request.
    async fn external_job_submit(
        &self,
        params: &TaskParams,
        steps: &StepDefinition,
        request_key: &str,
    ) -> anyhow::Result<ExternalStepHandle>;

    /// Query the status of the step addressed by `handle`
    async fn external_job_poll(&self, handle: &ExternalStepHandle)
        -> anyhow::Result<ExternalStatus>;
}

/// Callbacks used by the CLI
#[derive(Debug, Clone)]
pub struct HostCallbacks {
    shell: ShellCallbacks,
    jobs: Option<HttpJobClient>,
}

impl HostCallbacks {
    pub fn new(shell: ShellCallbacks, jobs: Option<HttpJobClient>) -> Self {
        Self { shell, jobs }
    }

    fn jobs(&self) -> anyhow::Result<&HttpJobClient> {
        self.jobs.as_ref().ok_or_else(|| {
            anyhow::anyhow!("no job API configured (set job_api_url / PIPEWRIGHT_JOB_API_URL)")
        })
    }
}

#[async_trait]
impl TaskCallbacks for HostCallbacks {
    async fn data_transfer(&self, params: &TaskParams) -> anyhow::Result<()> {
        self.shell.run(params).await
    }

    async fn external_query(&self, params: &TaskParams) -> anyhow::Result<()> {
        self.shell.run(params).await
    }

    async fn external_job_submit(
        &self,
        params: &TaskParams,
        steps: &StepDefinition,
        request_key: &str,
    ) -> anyhow::Result<ExternalStepHandle> {
        self.jobs()?.submit(params, steps, request_key).await
    }

    async fn external_job_poll(
        &self,
        handle: &ExternalStepHandle,
    ) -> anyhow::Result<ExternalStatus> {
        self.jobs()?.poll(handle).await
    }
}

/// Truncate byte output to MAX_OUTPUT_SIZE
///
/// Returns (truncated_string, was_truncated)
pub(crate) fn truncate_output_bytes(data: &[u8]) -> (String, bool) {
    let truncated = data.len() > MAX_OUTPUT_SIZE;
    let bytes = if truncated {
        &data[..MAX_OUTPUT_SIZE]
    } else {
        data
    };

    (String::from_utf8_lossy(bytes).to_string(), truncated)
}
