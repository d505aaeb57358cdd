//! REST client for the external job system
//!
//! The job system is addressed by a base URL plus the `job_flow_id` task
//! parameter:
//!
//! - `POST {base}/job-flows/{job_flow_id}/steps` with body
//!   `{"steps": <step document>}` returns `{"step_ids": ["s-1", ...]}`.
//!   The last returned step is the one watched for completion.
//! - `GET {base}/job-flows/{job_flow_id}/steps/{step_id}` returns
//!   `{"state": "RUNNING", "message": null}`.
//!
//! Each submission carries the caller's request key as its `Idempotency-Key`
//! header. Resending an attempt reuses the key; a retry attempt brings a new
//! one.
//!
//! # Example
//!
//! ```no_run
//! use pipewright::executors::http::HttpJobClient;
//! use pipewright::models::{StepDefinition, TaskParams};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let client = HttpJobClient::new("https://jobs.internal.example.com/api/")?;
//! let mut params = TaskParams::new();
//! params.insert("job_flow_id".to_string(), "j-2AXXXXXXGAPLF".to_string());
//! let steps = StepDefinition(serde_json::json!([{"Name": "clean_movie_review_data"}]));
//!
//! let handle = client
//!     .submit(&params, &steps, "user_behaviour@2022-01-11T00:00:00Z/add_steps/1")
//!     .await?;
//! let status = client.poll(&handle).await?;
//! println!("{} is {}", handle.step_id, status);
//! # Ok(())
//! # }
//! ```

use crate::models::{ExternalStatus, ExternalStepHandle, StepDefinition, TaskParams, MAX_OUTPUT_SIZE};
use anyhow::Context;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    step_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct StepStatusResponse {
    state: String,
    #[serde(default)]
    message: Option<String>,
}

/// Client for the job system's step API
#[derive(Debug, Clone)]
pub struct HttpJobClient {
    client: Client,
    base_url: Url,
}

impl HttpJobClient {
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        let mut base_url =
            Url::parse(base_url).with_context(|| format!("invalid job API URL '{}'", base_url))?;

        let scheme = base_url.scheme();
        if scheme != "http" && scheme != "https" {
            anyhow::bail!(
                "invalid job API URL scheme '{}': only http and https are allowed",
                scheme
            );
        }
        // Url::join replaces the last segment unless the path ends with '/'
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let client = Client::builder()
            .user_agent(format!("pipewright/{}", env!("CARGO_PKG_VERSION")))
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to create HTTP client")?;

        Ok(Self { client, base_url })
    }

    fn steps_url(&self, job_flow_id: &str) -> anyhow::Result<Url> {
        if job_flow_id.is_empty() || job_flow_id.contains('/') {
            anyhow::bail!("invalid job_flow_id '{}'", job_flow_id);
        }
        Ok(self
            .base_url
            .join(&format!("job-flows/{}/steps", job_flow_id))?)
    }

    /// Submit a step document to the job flow named by `params["job_flow_id"]`
    pub async fn submit(
        &self,
        params: &TaskParams,
        steps: &StepDefinition,
        request_key: &str,
    ) -> anyhow::Result<ExternalStepHandle> {
        let job_flow_id = params
            .get("job_flow_id")
            .ok_or_else(|| anyhow::anyhow!("missing 'job_flow_id' parameter"))?;
        let url = self.steps_url(job_flow_id)?;

        info!(
            "Submitting {} step(s) to job flow {}",
            steps.step_count(),
            job_flow_id
        );

        let response = self
            .client
            .post(url)
            .header("Idempotency-Key", request_key)
            .json(&serde_json::json!({ "steps": steps.0 }))
            .send()
            .await
            .map_err(classify)?;

        let status = response.status();
        if !status.is_success() {
            let body = read_body(response).await;
            anyhow::bail!("step submission failed with status {}: {}", status.as_u16(), body);
        }

        let submitted: SubmitResponse = response
            .json()
            .await
            .context("invalid step submission response")?;
        let step_id = submitted
            .step_ids
            .last()
            .ok_or_else(|| anyhow::anyhow!("job system returned no step ids"))?;

        debug!("Job flow {} accepted steps {:?}", job_flow_id, submitted.step_ids);
        Ok(ExternalStepHandle::new(
            job_flow_id.clone(),
            step_id.clone(),
            steps.step_count(),
        ))
    }

    /// Fetch the current status of the step behind `handle`
    pub async fn poll(&self, handle: &ExternalStepHandle) -> anyhow::Result<ExternalStatus> {
        let url = self
            .steps_url(&handle.job_id)?
            .join(&format!("steps/{}", handle.step_id))?;

        let response = self.client.get(url).send().await.map_err(classify)?;
        let status = response.status();
        if !status.is_success() {
            let body = read_body(response).await;
            anyhow::bail!("step status request failed with status {}: {}", status.as_u16(), body);
        }

        let body: StepStatusResponse = response
            .json()
            .await
            .context("invalid step status response")?;
        debug!("Step {} reported {}", handle.step_id, body.state);

        map_state(&body.state, body.message)
    }
}

/// Map a job-system state string to [`ExternalStatus`]
fn map_state(state: &str, message: Option<String>) -> anyhow::Result<ExternalStatus> {
    match state.to_ascii_uppercase().as_str() {
        "PENDING" => Ok(ExternalStatus::Pending),
        "RUNNING" | "CANCEL_PENDING" => Ok(ExternalStatus::Running),
        "COMPLETED" => Ok(ExternalStatus::Completed),
        "FAILED" => Ok(ExternalStatus::Failed(message)),
        "CANCELLED" | "INTERRUPTED" => Ok(ExternalStatus::Cancelled),
        other => anyhow::bail!("unknown step state '{}'", other),
    }
}

fn classify(e: reqwest::Error) -> anyhow::Error {
    if e.is_timeout() {
        anyhow::anyhow!("request timed out after {} seconds", REQUEST_TIMEOUT.as_secs())
    } else if e.is_connect() {
        anyhow::anyhow!("connection failed: {}", e)
    } else {
        anyhow::anyhow!("request failed: {}", e)
    }
}

async fn read_body(response: reqwest::Response) -> String {
    match response.bytes().await {
        Ok(bytes) => {
            let end = bytes.len().min(MAX_OUTPUT_SIZE);
            String::from_utf8_lossy(&bytes[..end]).trim().to_string()
        }
        Err(e) => format!("<unreadable body: {}>", e),
    }
}
