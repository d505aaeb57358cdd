//! Retry policy and the retry manager that wraps task attempts
//!
//! A [`RetryPolicy`] bounds how many times a task is re-run and how long to
//! wait in between. [`RetryManager::attempt`] drives one task instance through
//! `Running -> Retrying -> Running ... -> Success | Failed`, recording every
//! attempt on the instance.
//!
//! # Example
//!
//! ```
//! use pipewright::retry::{RetryPolicy, RetryState};
//! use std::time::Duration;
//!
//! let policy = RetryPolicy::exponential(3, Duration::from_secs(1), Duration::from_secs(60));
//! let mut state = RetryState::new();
//!
//! assert!(state.should_retry(&policy));
//! assert_eq!(state.calculate_delay(&policy), Duration::from_secs(1));
//! state.record_retry();
//! assert_eq!(state.calculate_delay(&policy), Duration::from_secs(2));
//! ```

use crate::error::{PipewrightError, Result};
use crate::models::{
    AttemptOutcome, AttemptRecord, ExternalStepHandle, TaskInstance, TaskState,
};
use crate::signal::CancelSignal;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Delay growth between attempts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    #[default]
    Fixed,
    Exponential,
}

/// Retry policy for task execution
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts (not including initial attempt)
    pub max_retries: u32,
    pub backoff: Backoff,
    /// Fixed delay, or the first delay for exponential backoff
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Whether an external step timeout is retried.
    ///
    /// A wait task with its own `steps` submits again on the retry. A wait
    /// task polling an upstream `submit_task` handle re-polls that same step;
    /// a fresh submission needs the submit task itself to run again.
    pub retry_on_timeout: bool,
}

impl RetryPolicy {
    /// Fixed delay between attempts
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            backoff: Backoff::Fixed,
            base_delay: delay,
            max_delay: delay,
            retry_on_timeout: false,
        }
    }

    /// Exponential backoff: `base_delay * 2^retry`, capped at `max_delay`
    pub fn exponential(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            backoff: Backoff::Exponential,
            base_delay,
            max_delay,
            retry_on_timeout: false,
        }
    }

    /// Single attempt, never retried
    pub fn no_retry() -> Self {
        Self::fixed(0, Duration::ZERO)
    }

    pub fn with_retry_on_timeout(mut self, retry: bool) -> Self {
        self.retry_on_timeout = retry;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Whether `err` may be followed by another attempt
    pub fn is_retryable(&self, err: &PipewrightError) -> bool {
        match err {
            PipewrightError::ExternalJob { .. } | PipewrightError::Cancelled { .. } => false,
            PipewrightError::ExternalTimeout { .. } => self.retry_on_timeout,
            _ => true,
        }
    }
}

impl Default for RetryPolicy {
    /// Two retries, one minute apart
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff: Backoff::Fixed,
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(3600),
            retry_on_timeout: false,
        }
    }
}

/// Retry state tracking for a specific task execution
#[derive(Debug, Clone)]
pub struct RetryState {
    /// Current attempt number (starts at 1 for first attempt)
    pub attempt: u32,
    /// Number of retries performed (0 for first attempt)
    pub retry_count: u32,
}

impl RetryState {
    pub fn new() -> Self {
        Self {
            attempt: 1,
            retry_count: 0,
        }
    }

    /// Returns `true` if we haven't exceeded max retries
    pub fn should_retry(&self, policy: &RetryPolicy) -> bool {
        self.retry_count < policy.max_retries
    }

    /// Delay before the next attempt
    pub fn calculate_delay(&self, policy: &RetryPolicy) -> Duration {
        let base_ms = u64::try_from(policy.base_delay.as_millis()).unwrap_or(u64::MAX);
        let max_ms = u64::try_from(policy.max_delay.as_millis()).unwrap_or(u64::MAX);

        let delay_ms = match policy.backoff {
            Backoff::Fixed => base_ms,
            Backoff::Exponential => {
                base_ms.saturating_mul(2u64.saturating_pow(self.retry_count))
            }
        };
        let capped = delay_ms.min(max_ms);

        debug!(
            "Calculated backoff delay: {}ms (attempt {}, retry {})",
            capped, self.attempt, self.retry_count
        );

        Duration::from_millis(capped)
    }

    pub fn record_retry(&mut self) {
        self.retry_count += 1;
        self.attempt += 1;
    }
}

impl Default for RetryState {
    fn default() -> Self {
        Self::new()
    }
}

/// What one attempt produced
#[derive(Debug)]
pub struct AttemptResult {
    pub result: Result<()>,
    /// External step touched by the attempt, kept even when it failed
    pub external: Option<ExternalStepHandle>,
}

impl AttemptResult {
    pub fn ok() -> Self {
        Self {
            result: Ok(()),
            external: None,
        }
    }

    pub fn err(err: PipewrightError) -> Self {
        Self {
            result: Err(err),
            external: None,
        }
    }

    pub fn with_external(mut self, handle: ExternalStepHandle) -> Self {
        self.external = Some(handle);
        self
    }
}

/// Runs task attempts under a [`RetryPolicy`]
#[derive(Debug, Clone, Default)]
pub struct RetryManager;

impl RetryManager {
    pub fn new() -> Self {
        Self
    }

    /// Drive `instance` to `Success` or `Failed`.
    ///
    /// The instance must be `Ready` or `Running`. `execute` receives the
    /// attempt number and is expected to observe cancellation itself; the
    /// manager only checks `cancel` between attempts.
    pub async fn attempt<F, Fut>(
        &self,
        policy: &RetryPolicy,
        instance: &mut TaskInstance,
        cancel: &mut CancelSignal,
        mut execute: F,
    ) -> Result<TaskState>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = AttemptResult>,
    {
        if instance.state == TaskState::Ready {
            instance.transition(TaskState::Running)?;
        }

        let mut retry = RetryState::new();

        loop {
            if cancel.is_cancelled() {
                return fail_cancelled(instance);
            }

            instance.attempts += 1;
            let attempt = instance.attempts;
            let started_at = Utc::now();

            info!(
                "Executing task '{}' (attempt {}, try {}/{})",
                instance.task_id,
                attempt,
                retry.attempt,
                policy.max_attempts()
            );

            let AttemptResult { result, external } = execute(attempt).await;
            if let Some(handle) = external {
                instance.external = Some(handle);
            }

            let err = match result {
                Ok(()) => {
                    instance.last_error = None;
                    push_record(instance, attempt, AttemptOutcome::Success, None, started_at);
                    instance.transition(TaskState::Success)?;
                    info!("Task '{}' completed successfully", instance.task_id);
                    return Ok(TaskState::Success);
                }
                Err(err) => err,
            };

            let message = err.to_string();
            instance.last_error = Some(message.clone());

            let retryable = policy.is_retryable(&err);
            if retryable && retry.should_retry(policy) {
                push_record(
                    instance,
                    attempt,
                    AttemptOutcome::TransientFailure,
                    Some(message.clone()),
                    started_at,
                );
                instance.transition(TaskState::Retrying)?;

                let delay = retry.calculate_delay(policy);
                retry.record_retry();
                warn!(
                    "Task '{}' failed: {}; retrying in {:?} ({}/{})",
                    instance.task_id,
                    message,
                    delay,
                    retry.attempt,
                    policy.max_attempts()
                );

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => {
                        return fail_cancelled(instance);
                    }
                }

                instance.transition(TaskState::Running)?;
                continue;
            }

            let outcome = match err {
                PipewrightError::Cancelled { .. } => AttemptOutcome::Cancelled,
                _ if retryable => AttemptOutcome::Exhausted,
                _ => AttemptOutcome::Fatal,
            };
            push_record(instance, attempt, outcome, Some(message.clone()), started_at);
            instance.transition(TaskState::Failed)?;

            error!(
                "Task '{}' failed after {} attempt(s): {}",
                instance.task_id, instance.attempts, message
            );
            return Ok(TaskState::Failed);
        }
    }
}

fn push_record(
    instance: &mut TaskInstance,
    attempt: u32,
    outcome: AttemptOutcome,
    error: Option<String>,
    started_at: chrono::DateTime<Utc>,
) {
    instance.history.push(AttemptRecord {
        attempt,
        outcome,
        error,
        started_at,
        finished_at: Utc::now(),
    });
}

fn fail_cancelled(instance: &mut TaskInstance) -> Result<TaskState> {
    let err = PipewrightError::Cancelled {
        task: instance.task_id.clone(),
    };
    instance.last_error = Some(err.to_string());
    instance.transition(TaskState::Failed)?;
    warn!("Task '{}' cancelled", instance.task_id);
    Ok(TaskState::Failed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::CancelHandle;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn running_instance(id: &str) -> TaskInstance {
        let mut instance = TaskInstance::new(id);
        instance.transition(TaskState::Ready).unwrap();
        instance
    }

    fn exec_error(msg: &str) -> PipewrightError {
        PipewrightError::TaskExecution {
            task: "t".to_string(),
            message: msg.to_string(),
        }
    }

    #[test]
    fn test_retry_policy_default() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 2);
        assert_eq!(policy.max_attempts(), 3);
        assert_eq!(policy.backoff, Backoff::Fixed);
        assert_eq!(policy.base_delay, Duration::from_secs(60));
        assert!(!policy.retry_on_timeout);
    }

    #[test]
    fn test_should_retry() {
        let policy = RetryPolicy::fixed(3, Duration::from_secs(1));
        let mut state = RetryState::new();

        assert!(state.should_retry(&policy));
        state.record_retry();
        assert!(state.should_retry(&policy));
        state.record_retry();
        assert!(state.should_retry(&policy));
        state.record_retry();
        assert!(!state.should_retry(&policy));
    }

    #[test]
    fn test_fixed_delay() {
        let policy = RetryPolicy::fixed(5, Duration::from_secs(60));
        let mut state = RetryState::new();
        for _ in 0..4 {
            assert_eq!(state.calculate_delay(&policy), Duration::from_secs(60));
            state.record_retry();
        }
    }

    #[test]
    fn test_exponential_delay() {
        let policy =
            RetryPolicy::exponential(10, Duration::from_secs(1), Duration::from_secs(60));
        let mut state = RetryState::new();

        let mut delays = Vec::new();
        for _ in 0..8 {
            delays.push(state.calculate_delay(&policy).as_secs());
            state.record_retry();
        }
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 60, 60]);
    }

    #[test]
    fn test_overflow_protection() {
        let policy =
            RetryPolicy::exponential(100, Duration::from_secs(1), Duration::from_secs(3600));
        let mut state = RetryState::new();
        state.retry_count = 100;

        assert_eq!(state.calculate_delay(&policy), Duration::from_secs(3600));
    }

    #[test]
    fn test_retryable_classification() {
        let policy = RetryPolicy::default();
        assert!(policy.is_retryable(&exec_error("boom")));
        assert!(!policy.is_retryable(&PipewrightError::ExternalJob {
            task: "t".into(),
            step_id: "s".into(),
            message: "failed".into(),
        }));

        let timeout = PipewrightError::ExternalTimeout {
            task: "t".into(),
            step_id: "s".into(),
            timeout_secs: 1,
        };
        assert!(!policy.is_retryable(&timeout));
        assert!(policy.clone().with_retry_on_timeout(true).is_retryable(&timeout));
    }

    #[tokio::test]
    async fn test_exhausts_after_three_attempts_and_keeps_last_error() {
        let manager = RetryManager::new();
        let policy = RetryPolicy::fixed(2, Duration::ZERO);
        let mut instance = running_instance("flaky");
        let mut cancel = CancelSignal::never();
        let calls = Arc::new(AtomicU32::new(0));

        let counter = calls.clone();
        let state = manager
            .attempt(&policy, &mut instance, &mut cancel, |attempt| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move { AttemptResult::err(exec_error(&format!("failure #{}", attempt))) }
            })
            .await
            .unwrap();

        assert_eq!(state, TaskState::Failed);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(instance.attempts, 3);
        assert!(instance.last_error.as_deref().unwrap().contains("failure #3"));

        let outcomes: Vec<_> = instance.history.iter().map(|r| r.outcome).collect();
        assert_eq!(
            outcomes,
            vec![
                AttemptOutcome::TransientFailure,
                AttemptOutcome::TransientFailure,
                AttemptOutcome::Exhausted
            ]
        );
    }

    #[tokio::test]
    async fn test_succeeds_on_second_attempt() {
        let manager = RetryManager::new();
        let policy = RetryPolicy::fixed(2, Duration::ZERO);
        let mut instance = running_instance("flaky");
        let mut cancel = CancelSignal::never();

        let state = manager
            .attempt(&policy, &mut instance, &mut cancel, |attempt| async move {
                if attempt == 1 {
                    AttemptResult::err(exec_error("transient"))
                } else {
                    AttemptResult::ok()
                }
            })
            .await
            .unwrap();

        assert_eq!(state, TaskState::Success);
        assert_eq!(instance.attempts, 2);
        assert!(instance.last_error.is_none());
        assert_eq!(instance.history.len(), 2);
    }

    #[tokio::test]
    async fn test_external_failure_is_not_retried() {
        let manager = RetryManager::new();
        let policy = RetryPolicy::fixed(5, Duration::ZERO);
        let mut instance = running_instance("wait");
        let mut cancel = CancelSignal::never();

        let state = manager
            .attempt(&policy, &mut instance, &mut cancel, |_| async {
                AttemptResult::err(PipewrightError::ExternalJob {
                    task: "wait".into(),
                    step_id: "s-1".into(),
                    message: "step failed".into(),
                })
                .with_external(ExternalStepHandle::new("j-1", "s-1", 1))
            })
            .await
            .unwrap();

        assert_eq!(state, TaskState::Failed);
        assert_eq!(instance.attempts, 1);
        assert_eq!(instance.history[0].outcome, AttemptOutcome::Fatal);
        assert_eq!(instance.external.as_ref().unwrap().step_id, "s-1");
    }

    #[tokio::test]
    async fn test_cancel_during_backoff_fails_task() {
        let manager = RetryManager::new();
        let policy = RetryPolicy::fixed(3, Duration::from_secs(30));
        let mut instance = running_instance("slow");
        let handle = CancelHandle::new();
        let mut cancel = handle.signal();

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            handle.cancel();
        });

        let state = tokio::time::timeout(
            Duration::from_secs(5),
            manager.attempt(&policy, &mut instance, &mut cancel, |_| async {
                AttemptResult::err(exec_error("boom"))
            }),
        )
        .await
        .unwrap()
        .unwrap();
        canceller.await.unwrap();

        assert_eq!(state, TaskState::Failed);
        assert_eq!(instance.attempts, 1);
        assert!(instance.last_error.as_deref().unwrap().contains("cancelled"));
    }
}
