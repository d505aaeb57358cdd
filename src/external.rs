//! External step submission and completion polling

use crate::error::{PipewrightError, Result};
use crate::executors::TaskCallbacks;
use crate::models::{
    ExternalStatus, ExternalStepHandle, MonitorState, StepDefinition, TaskParams,
};
use crate::signal::CancelSignal;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Request key for one submission attempt.
///
/// The same (run, task, attempt) always yields the same key, so a resent
/// request is recognisable; every retry attempt gets a new one.
pub fn submission_key(run_id: &str, task_id: &str, attempt: u32) -> String {
    let name = format!("{}/{}/{}", run_id, task_id, attempt);
    Uuid::new_v5(&Uuid::NAMESPACE_URL, name.as_bytes()).to_string()
}

/// How a wait on an external step ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorOutcome {
    Completed,
    ExternalFailed(String),
    TimedOut,
    Cancelled,
}

impl MonitorOutcome {
    /// Convert to the task-level result of a wait attempt
    pub fn into_result(self, task_id: &str, handle: &ExternalStepHandle, timeout: Duration) -> Result<()> {
        match self {
            MonitorOutcome::Completed => Ok(()),
            MonitorOutcome::ExternalFailed(message) => Err(PipewrightError::ExternalJob {
                task: task_id.to_string(),
                step_id: handle.step_id.clone(),
                message,
            }),
            MonitorOutcome::TimedOut => Err(PipewrightError::ExternalTimeout {
                task: task_id.to_string(),
                step_id: handle.step_id.clone(),
                timeout_secs: timeout.as_secs(),
            }),
            MonitorOutcome::Cancelled => Err(PipewrightError::Cancelled {
                task: task_id.to_string(),
            }),
        }
    }
}

enum PollStep {
    Polled(std::result::Result<anyhow::Result<ExternalStatus>, tokio::time::error::Elapsed>),
    Cancelled,
}

/// Submits step documents and waits on their completion
#[derive(Clone)]
pub struct ExternalStepMonitor {
    callbacks: Arc<dyn TaskCallbacks>,
}

impl ExternalStepMonitor {
    pub fn new(callbacks: Arc<dyn TaskCallbacks>) -> Self {
        Self { callbacks }
    }

    /// Submit `steps`; a callback failure is a retryable task error.
    pub async fn submit(
        &self,
        task_id: &str,
        params: &TaskParams,
        steps: &StepDefinition,
        request_key: &str,
    ) -> Result<ExternalStepHandle> {
        let handle = self
            .callbacks
            .external_job_submit(params, steps, request_key)
            .await
            .map_err(|e| PipewrightError::TaskExecution {
                task: task_id.to_string(),
                message: format!("step submission failed: {:#}", e),
            })?;

        info!(
            "Task '{}' submitted {} step(s) to job {}, watching step {}",
            task_id, handle.submitted_steps, handle.job_id, handle.step_id
        );
        Ok(handle)
    }

    /// Poll the step behind `handle` until it is terminal, the timeout
    /// elapses, or `cancel` fires.
    ///
    /// `handle.state` and `handle.last_status` track what was observed. A
    /// poll error aborts the wait with a retryable `TaskExecution` error.
    pub async fn await_completion(
        &self,
        task_id: &str,
        handle: &mut ExternalStepHandle,
        poll_interval: Duration,
        timeout: Duration,
        cancel: &mut CancelSignal,
    ) -> Result<MonitorOutcome> {
        let deadline = Instant::now() + timeout;
        handle.state = MonitorState::Polling;

        loop {
            if cancel.is_cancelled() {
                handle.state = MonitorState::Cancelled;
                return Ok(MonitorOutcome::Cancelled);
            }
            if Instant::now() >= deadline {
                return Ok(self.timed_out(task_id, handle, timeout));
            }

            let target = handle.clone();
            let step = tokio::select! {
                polled = tokio::time::timeout_at(deadline, self.callbacks.external_job_poll(&target)) => {
                    PollStep::Polled(polled)
                }
                _ = cancel.cancelled() => PollStep::Cancelled,
            };

            let status = match step {
                PollStep::Cancelled => {
                    handle.state = MonitorState::Cancelled;
                    return Ok(MonitorOutcome::Cancelled);
                }
                PollStep::Polled(Err(_)) => return Ok(self.timed_out(task_id, handle, timeout)),
                PollStep::Polled(Ok(Err(e))) => {
                    return Err(PipewrightError::TaskExecution {
                        task: task_id.to_string(),
                        message: format!("polling step {} failed: {:#}", handle.step_id, e),
                    });
                }
                PollStep::Polled(Ok(Ok(status))) => status,
            };

            debug!("Task '{}': step {} is {}", task_id, handle.step_id, status);
            handle.last_status = Some(status.clone());

            match status {
                ExternalStatus::Completed => {
                    handle.state = MonitorState::Completed;
                    info!("Task '{}': step {} completed", task_id, handle.step_id);
                    return Ok(MonitorOutcome::Completed);
                }
                ExternalStatus::Failed(message) => {
                    handle.state = MonitorState::ExternalFailed;
                    let message = message.unwrap_or_else(|| "step failed".to_string());
                    warn!("Task '{}': step {} failed: {}", task_id, handle.step_id, message);
                    return Ok(MonitorOutcome::ExternalFailed(message));
                }
                ExternalStatus::Cancelled => {
                    handle.state = MonitorState::ExternalFailed;
                    warn!("Task '{}': step {} was cancelled externally", task_id, handle.step_id);
                    return Ok(MonitorOutcome::ExternalFailed(
                        "step cancelled by the job system".to_string(),
                    ));
                }
                ExternalStatus::Pending | ExternalStatus::Running => {}
            }

            let wake = std::cmp::min(Instant::now() + poll_interval, deadline);
            tokio::select! {
                _ = tokio::time::sleep_until(wake) => {}
                _ = cancel.cancelled() => {
                    handle.state = MonitorState::Cancelled;
                    return Ok(MonitorOutcome::Cancelled);
                }
            }
        }
    }

    fn timed_out(&self, task_id: &str, handle: &mut ExternalStepHandle, timeout: Duration) -> MonitorOutcome {
        handle.state = MonitorState::TimedOut;
        warn!(
            "Task '{}': step {} not terminal after {}s",
            task_id,
            handle.step_id,
            timeout.as_secs()
        );
        MonitorOutcome::TimedOut
    }
}
