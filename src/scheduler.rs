//! Event-driven scheduler loop for one run
//!
//! Each tick the loop propagates upstream failures, releases tasks whose
//! predecessors all succeeded, dispatches ready tasks onto workers and then
//! sleeps until a worker finishes or the run is cancelled.
//!
//! `max_parallel` bounds how many host callbacks run at once. A worker holds
//! a pool permit only while a callback executes, so a wait task sleeping
//! between polls or a task in retry backoff leaves its slot to other work.
//!
//! Workers own a clone of their task instance for the duration of one
//! dispatch and hand it back through the `JoinSet`; only the loop writes to
//! the run's instance map.

use crate::dag::TaskGraph;
use crate::error::{PipewrightError, Result};
use crate::executors::TaskCallbacks;
use crate::external::{self, ExternalStepMonitor};
use crate::metrics::Metrics;
use crate::models::{
    AttemptOutcome, AttemptRecord, ExternalStatus, ExternalStepHandle, Run, RunReport, RunStatus,
    StepDefinition, Task, TaskId, TaskInstance, TaskKind, TaskParams, TaskState, WaitSource,
};
use crate::params;
use crate::retry::{AttemptResult, RetryManager, RetryPolicy};
use crate::signal::{CancelHandle, CancelSignal};
use crate::state::StateManager;
use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

pub const DEFAULT_MAX_PARALLEL: usize = 4;

/// Drives runs of a task graph to a terminal status
#[derive(Clone)]
pub struct TaskScheduler {
    callbacks: Arc<dyn TaskCallbacks>,
    retry: RetryManager,
    state: Option<Arc<StateManager>>,
    metrics: Option<Metrics>,
    max_parallel: usize,
    fail_fast: bool,
    default_retry: RetryPolicy,
}

impl TaskScheduler {
    pub fn new(callbacks: Arc<dyn TaskCallbacks>) -> Self {
        Self {
            callbacks,
            retry: RetryManager::new(),
            state: None,
            metrics: None,
            max_parallel: DEFAULT_MAX_PARALLEL,
            fail_fast: false,
            default_retry: RetryPolicy::default(),
        }
    }

    /// Persist run and instance state after every completion
    pub fn with_state(mut self, state: Arc<StateManager>) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel.max(1);
        self
    }

    /// Stop dispatching and cancel in-flight work after the first permanent failure
    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    /// Policy for tasks without their own retry override
    pub fn with_default_retry(mut self, policy: RetryPolicy) -> Self {
        self.default_retry = policy;
        self
    }

    /// Execute `run` until every instance is terminal.
    ///
    /// Task failures never make this return `Err`; they end up in the
    /// report. Errors are reserved for invalid input and persistence
    /// failures.
    pub async fn execute_run(
        &self,
        graph: Arc<TaskGraph>,
        run: Run,
        cancel: CancelSignal,
    ) -> Result<RunReport> {
        if let Some(metrics) = &self.metrics {
            metrics.inc_active_runs();
        }

        let result = self.drive(graph, run, cancel).await;

        if let Some(metrics) = &self.metrics {
            metrics.dec_active_runs();
            if let Ok(report) = &result {
                metrics.record_run(&report.handle.graph_id, &report.status.to_string());
            }
        }
        result
    }

    async fn drive(
        &self,
        graph: Arc<TaskGraph>,
        mut run: Run,
        mut cancel: CancelSignal,
    ) -> Result<RunReport> {
        if run.handle.graph_id != graph.id() {
            return Err(PipewrightError::Validation(format!(
                "Run {} does not belong to graph '{}'",
                run.handle,
                graph.id()
            )));
        }

        // Placeholders are rendered once, before anything is dispatched.
        let mut rendered: HashMap<TaskId, Arc<TaskParams>> = HashMap::new();
        for task in graph.all_tasks() {
            let params = params::render_params(&task.params, run.handle.logical_ts)?;
            rendered.insert(task.id.clone(), Arc::new(params));
            run.instances
                .entry(task.id.clone())
                .or_insert_with(|| TaskInstance::new(task.id.clone()));
        }

        info!(
            "Starting run {} ({} tasks, max_parallel={})",
            run.handle,
            graph.len(),
            self.max_parallel
        );
        run.status = RunStatus::Running;
        if let Some(state) = &self.state {
            state.save_run(&run)?;
        }

        let callbacks: Arc<dyn TaskCallbacks> =
            Arc::new(PooledCallbacks::new(self.callbacks.clone(), self.max_parallel));
        let context = RunContext {
            run_id: run.handle.run_id(),
            params: rendered,
            monitor: ExternalStepMonitor::new(callbacks.clone()),
            callbacks,
        };
        let worker_cancel = CancelHandle::new();
        let mut workers: JoinSet<(TaskInstance, Duration)> = JoinSet::new();
        let mut cancelled = false;
        let mut halting = false;

        loop {
            if !halting {
                self.propagate_failures(&graph, &mut run)?;
                self.mark_ready(&graph, &mut run)?;
                self.dispatch_ready(&graph, &mut run, &context, &worker_cancel, &mut workers)?;
            }

            if workers.is_empty() {
                if halting {
                    self.skip_remaining(&graph, &mut run)?;
                }
                if run.all_terminal() {
                    break;
                }
                return Err(PipewrightError::Other(format!(
                    "Run {} stalled with no runnable tasks",
                    run.handle
                )));
            }

            let joined = tokio::select! {
                joined = workers.join_next() => joined,
                _ = cancel.cancelled(), if !cancelled => {
                    warn!("Run {} cancelled, stopping in-flight tasks", run.handle);
                    cancelled = true;
                    halting = true;
                    worker_cancel.cancel();
                    continue;
                }
            };

            let (instance, elapsed) = match joined {
                Some(Ok(done)) => done,
                Some(Err(e)) => {
                    return Err(PipewrightError::Other(format!(
                        "Worker for run {} aborted: {}",
                        run.handle, e
                    )));
                }
                None => continue,
            };

            self.apply_completion(&mut run, instance, elapsed)?;

            let failed = run
                .instances
                .values()
                .any(|i| i.state == TaskState::Failed);
            if self.fail_fast && failed && !halting {
                warn!(
                    "Run {}: fail_fast set, cancelling in-flight tasks after first failure",
                    run.handle
                );
                halting = true;
                worker_cancel.cancel();
            }
        }

        run.status = if cancelled {
            RunStatus::Cancelled
        } else if run.instances.values().all(|i| i.state == TaskState::Success) {
            RunStatus::Success
        } else {
            RunStatus::Failed
        };

        if let Some(state) = &self.state {
            state.save_run(&run)?;
        }

        let report = build_report(&graph, run);
        match report.status {
            RunStatus::Success => info!(
                "Run {} succeeded ({} tasks)",
                report.handle,
                report.success_count()
            ),
            status => {
                for task_id in &report.failed_tasks {
                    if let Some(instance) = report.instance(task_id) {
                        error!(
                            "Task '{}' failed after {} attempt(s): {}",
                            task_id,
                            instance.attempts,
                            instance.last_error.as_deref().unwrap_or("unknown error")
                        );
                    }
                }
                error!(
                    "Run {} finished {} (root causes: {:?})",
                    report.handle, status, report.failed_tasks
                );
            }
        }

        Ok(report)
    }

    /// Mark `UpstreamFailed` every pending task whose predecessors are all
    /// terminal with at least one blocking. Walking in topological order makes
    /// the propagation transitive in one pass.
    fn propagate_failures(&self, graph: &TaskGraph, run: &mut Run) -> Result<()> {
        for task_id in graph.topological_order() {
            if run.state_of(task_id) != Some(TaskState::Pending) {
                continue;
            }

            let preds = graph.predecessors(task_id);
            let all_terminal = preds
                .iter()
                .all(|p| run.state_of(p).is_some_and(TaskState::is_terminal));
            let blocking = preds
                .iter()
                .find(|p| run.state_of(p).is_some_and(TaskState::blocks_downstream));

            if let (true, Some(upstream)) = (all_terminal, blocking) {
                let reason = PipewrightError::UpstreamFailure {
                    task: task_id.clone(),
                    upstream: upstream.clone(),
                };
                warn!("{}", reason);
                if let Some(instance) = run.instances.get_mut(task_id) {
                    instance.transition(TaskState::UpstreamFailed)?;
                    instance.last_error = Some(reason.to_string());
                }
                self.persist_instance(run, task_id)?;
            }
        }
        Ok(())
    }

    /// Release pending tasks whose predecessors have all succeeded
    fn mark_ready(&self, graph: &TaskGraph, run: &mut Run) -> Result<()> {
        let mut released = Vec::new();
        for task in graph.all_tasks() {
            if run.state_of(&task.id) != Some(TaskState::Pending) {
                continue;
            }
            let ready = graph
                .predecessors(&task.id)
                .iter()
                .all(|p| run.state_of(p) == Some(TaskState::Success));
            if ready {
                if let Some(instance) = run.instances.get_mut(&task.id) {
                    instance.transition(TaskState::Ready)?;
                }
                released.push(task.id.as_str());
            }
        }

        if !released.is_empty() {
            debug!("Run {}: ready {:?}", run.handle, released);
        }
        Ok(())
    }

    /// Hand ready tasks to workers in insertion order
    fn dispatch_ready(
        &self,
        graph: &TaskGraph,
        run: &mut Run,
        context: &RunContext,
        worker_cancel: &CancelHandle,
        workers: &mut JoinSet<(TaskInstance, Duration)>,
    ) -> Result<()> {
        for task in graph.all_tasks() {
            if run.state_of(&task.id) != Some(TaskState::Ready) {
                continue;
            }

            let upstream_handle = match &task.kind {
                TaskKind::ExternalJobWait {
                    source: WaitSource::Upstream(submit_id),
                    ..
                } => run.instance(submit_id).and_then(|i| i.external.clone()),
                _ => None,
            };

            let Some(instance) = run.instances.get_mut(&task.id) else {
                continue;
            };
            instance.transition(TaskState::Running)?;
            let instance = instance.clone();

            let job = Arc::new(TaskJob {
                task: task.clone(),
                run_id: context.run_id.clone(),
                params: context
                    .params
                    .get(&task.id)
                    .cloned()
                    .unwrap_or_default(),
                callbacks: context.callbacks.clone(),
                monitor: context.monitor.clone(),
                upstream_handle,
            });
            let policy = task
                .retry
                .clone()
                .unwrap_or_else(|| self.default_retry.clone());
            let retry = self.retry.clone();
            let cancel = worker_cancel.signal();

            if let Some(metrics) = &self.metrics {
                metrics.inc_active_tasks();
            }
            info!("Run {}: dispatching '{}' ({})", run.handle, task.id, task.kind.name());

            workers.spawn(async move {
                let started = Instant::now();
                let fallback = instance.clone();

                let worked = AssertUnwindSafe(run_task(job, retry, policy, instance, cancel))
                    .catch_unwind()
                    .await;
                let instance = match worked {
                    Ok(instance) => instance,
                    Err(panic) => fatal(
                        fallback,
                        format!("task panicked: {}", panic_message(panic.as_ref())),
                    ),
                };
                (instance, started.elapsed())
            });
        }
        Ok(())
    }

    fn apply_completion(&self, run: &mut Run, instance: TaskInstance, elapsed: Duration) -> Result<()> {
        let task_id = instance.task_id.clone();
        let seen = run
            .instance(&task_id)
            .map(|i| i.history.len())
            .unwrap_or_default();

        if let Some(metrics) = &self.metrics {
            metrics.dec_active_tasks();
            metrics.observe_task_duration(&run.handle.graph_id, &task_id, elapsed.as_secs_f64());
            for record in instance.history.iter().skip(seen) {
                metrics.record_attempt(&run.handle.graph_id, &task_id, &record.outcome.to_string());
            }
        }

        debug!(
            "Run {}: '{}' finished {} after {:?}",
            run.handle, task_id, instance.state, elapsed
        );
        run.instances.insert(task_id.clone(), instance);
        self.persist_instance(run, &task_id)
    }

    /// Skip everything that never started
    fn skip_remaining(&self, graph: &TaskGraph, run: &mut Run) -> Result<()> {
        for task in graph.all_tasks() {
            let Some(instance) = run.instances.get_mut(&task.id) else {
                continue;
            };
            if matches!(instance.state, TaskState::Pending | TaskState::Ready) {
                instance.transition(TaskState::Skipped)?;
                debug!("Run {}: skipped '{}'", run.handle, task.id);
            }
        }
        Ok(())
    }

    fn persist_instance(&self, run: &Run, task_id: &str) -> Result<()> {
        if let (Some(state), Some(instance)) = (&self.state, run.instance(task_id)) {
            state.save_instance(&run.handle, instance)?;
        }
        Ok(())
    }
}

/// Per-run dispatch inputs shared by every worker of the run
struct RunContext {
    run_id: String,
    params: HashMap<TaskId, Arc<TaskParams>>,
    callbacks: Arc<dyn TaskCallbacks>,
    monitor: ExternalStepMonitor,
}

/// Host callbacks behind the run's `max_parallel` permits.
///
/// A permit is held for the duration of one callback only.
struct PooledCallbacks {
    inner: Arc<dyn TaskCallbacks>,
    permits: Semaphore,
}

impl PooledCallbacks {
    fn new(inner: Arc<dyn TaskCallbacks>, max_parallel: usize) -> Self {
        Self {
            inner,
            permits: Semaphore::new(max_parallel),
        }
    }

    async fn permit(&self) -> anyhow::Result<SemaphorePermit<'_>> {
        self.permits
            .acquire()
            .await
            .map_err(|_| anyhow::anyhow!("worker pool closed"))
    }
}

#[async_trait]
impl TaskCallbacks for PooledCallbacks {
    async fn data_transfer(&self, params: &TaskParams) -> anyhow::Result<()> {
        let _permit = self.permit().await?;
        self.inner.data_transfer(params).await
    }

    async fn external_query(&self, params: &TaskParams) -> anyhow::Result<()> {
        let _permit = self.permit().await?;
        self.inner.external_query(params).await
    }

    async fn external_job_submit(
        &self,
        params: &TaskParams,
        steps: &StepDefinition,
        request_key: &str,
    ) -> anyhow::Result<ExternalStepHandle> {
        let _permit = self.permit().await?;
        self.inner.external_job_submit(params, steps, request_key).await
    }

    async fn external_job_poll(
        &self,
        handle: &ExternalStepHandle,
    ) -> anyhow::Result<ExternalStatus> {
        let _permit = self.permit().await?;
        self.inner.external_job_poll(handle).await
    }
}

/// Everything one dispatch needs, owned by the worker
struct TaskJob {
    task: Task,
    run_id: String,
    params: Arc<TaskParams>,
    callbacks: Arc<dyn TaskCallbacks>,
    monitor: ExternalStepMonitor,
    upstream_handle: Option<ExternalStepHandle>,
}

impl TaskJob {
    /// The single dispatch point over task kinds
    async fn execute(&self, attempt: u32, mut cancel: CancelSignal) -> AttemptResult {
        let task_id = self.task.id.as_str();
        debug!("Task '{}' attempt {} ({})", task_id, attempt, self.task.kind.name());

        match &self.task.kind {
            TaskKind::NoOp => AttemptResult::ok(),
            TaskKind::DataTransfer => {
                self.local(self.callbacks.data_transfer(&self.params), &mut cancel)
                    .await
            }
            TaskKind::ExternalQuery => {
                self.local(self.callbacks.external_query(&self.params), &mut cancel)
                    .await
            }
            TaskKind::ExternalJobSubmit { steps } => {
                match self.submit(steps, attempt, &mut cancel).await {
                    Ok(handle) => AttemptResult::ok().with_external(handle),
                    Err(err) => AttemptResult::err(err),
                }
            }
            TaskKind::ExternalJobWait {
                source,
                poll_interval,
                timeout,
            } => {
                let mut handle = match source {
                    WaitSource::Upstream(submit_id) => match &self.upstream_handle {
                        Some(handle) => handle.clone(),
                        None => {
                            return AttemptResult::err(PipewrightError::TaskExecution {
                                task: task_id.to_string(),
                                message: format!("no step handle recorded by '{}'", submit_id),
                            })
                        }
                    },
                    WaitSource::Submit(steps) => match self.submit(steps, attempt, &mut cancel).await {
                        Ok(handle) => handle,
                        Err(err) => return AttemptResult::err(err),
                    },
                };

                let result = self
                    .monitor
                    .await_completion(task_id, &mut handle, *poll_interval, *timeout, &mut cancel)
                    .await
                    .and_then(|outcome| outcome.into_result(task_id, &handle, *timeout));
                AttemptResult {
                    result,
                    external: Some(handle),
                }
            }
        }
    }

    async fn submit(
        &self,
        steps: &StepDefinition,
        attempt: u32,
        cancel: &mut CancelSignal,
    ) -> Result<ExternalStepHandle> {
        let request_key = external::submission_key(&self.run_id, &self.task.id, attempt);
        tokio::select! {
            submitted = self.monitor.submit(&self.task.id, &self.params, steps, &request_key) => submitted,
            _ = cancel.cancelled() => Err(PipewrightError::Cancelled { task: self.task.id.clone() }),
        }
    }

    /// Run a host callback, dropping it if the run is cancelled
    async fn local<F>(&self, call: F, cancel: &mut CancelSignal) -> AttemptResult
    where
        F: Future<Output = anyhow::Result<()>>,
    {
        tokio::select! {
            result = call => match result {
                Ok(()) => AttemptResult::ok(),
                Err(e) => AttemptResult::err(PipewrightError::TaskExecution {
                    task: self.task.id.clone(),
                    message: format!("{:#}", e),
                }),
            },
            _ = cancel.cancelled() => AttemptResult::err(PipewrightError::Cancelled {
                task: self.task.id.clone(),
            }),
        }
    }
}

async fn run_task(
    job: Arc<TaskJob>,
    retry: RetryManager,
    policy: RetryPolicy,
    mut instance: TaskInstance,
    mut cancel: CancelSignal,
) -> TaskInstance {
    let attempt_cancel = cancel.clone();
    let result = retry
        .attempt(&policy, &mut instance, &mut cancel, |attempt| {
            let job = job.clone();
            let cancel = attempt_cancel.clone();
            async move { job.execute(attempt, cancel).await }
        })
        .await;

    match result {
        Err(e) if !instance.state.is_terminal() => {
            fatal(instance, format!("left in an invalid state: {}", e))
        }
        Err(e) => {
            error!("Task '{}' left in an invalid state: {}", instance.task_id, e);
            instance
        }
        Ok(_) => instance,
    }
}

/// Record a dispatch that ended outside the retry manager as a fatal failure
fn fatal(mut instance: TaskInstance, error: String) -> TaskInstance {
    error!("Task '{}' {}", instance.task_id, error);

    let now = Utc::now();
    instance.attempts += 1;
    instance.history.push(AttemptRecord {
        attempt: instance.attempts,
        outcome: AttemptOutcome::Fatal,
        error: Some(error.clone()),
        started_at: now,
        finished_at: now,
    });
    instance.last_error = Some(error);
    instance.state = TaskState::Failed;
    instance
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Snapshot `run` in graph insertion order with its root-cause failures.
///
/// Tasks the run stopped (fail-fast or cancel) are `Failed` but not listed.
pub(crate) fn build_report(graph: &TaskGraph, mut run: Run) -> RunReport {
    let instances: Vec<TaskInstance> = graph
        .all_tasks()
        .iter()
        .filter_map(|task| run.instances.remove(&task.id))
        .collect();
    let failed_tasks = instances
        .iter()
        .filter(|i| i.is_root_failure())
        .map(|i| i.task_id.clone())
        .collect();

    RunReport {
        handle: run.handle,
        status: run.status,
        failed_tasks,
        instances,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::Edge;
    use crate::executors::MockTaskCallbacks;
    use crate::models::RunHandle;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn handle(graph: &str) -> RunHandle {
        RunHandle::new(graph, Utc.with_ymd_and_hms(2022, 1, 11, 0, 0, 0).unwrap())
    }

    fn transfer(id: &str) -> Task {
        Task::new(id, TaskKind::DataTransfer).with_param("name", id)
    }

    fn fast_retry(max_retries: u32) -> RetryPolicy {
        RetryPolicy::fixed(max_retries, Duration::from_millis(1))
    }

    async fn execute(scheduler: &TaskScheduler, graph: TaskGraph) -> RunReport {
        let graph = Arc::new(graph);
        let run = Run::new(handle(graph.id()), graph.all_tasks().iter().map(|t| t.id.as_str()));
        scheduler
            .execute_run(graph, run, CancelSignal::never())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_linear_chain_in_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let seen = order.clone();
        let mut mock = MockTaskCallbacks::new();
        mock.expect_data_transfer().returning(move |params| {
            seen.lock().unwrap().push(params["name"].clone());
            Ok(())
        });

        let graph = TaskGraph::build(
            "chain",
            vec![transfer("a"), transfer("b"), transfer("c")],
            &[Edge::new("a", "b"), Edge::new("b", "c")],
        )
        .unwrap();

        let report = execute(&TaskScheduler::new(Arc::new(mock)), graph).await;
        assert_eq!(report.status, RunStatus::Success);
        assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);
        assert!(report.failed_tasks.is_empty());
    }

    #[tokio::test]
    async fn test_failure_propagates_upstream_failed() {
        let mut mock = MockTaskCallbacks::new();
        mock.expect_data_transfer().returning(|params| {
            if params["name"] == "d" {
                Err(anyhow::anyhow!("disk full"))
            } else {
                Ok(())
            }
        });

        let graph = TaskGraph::build(
            "join",
            vec![transfer("a"), transfer("b"), transfer("c"), transfer("d"), transfer("e")],
            &[
                Edge::new("a", "b"),
                Edge::new("b", "c"),
                Edge::new("c", "e"),
                Edge::new("d", "e"),
            ],
        )
        .unwrap();

        let scheduler = TaskScheduler::new(Arc::new(mock)).with_default_retry(fast_retry(1));
        let report = execute(&scheduler, graph).await;

        assert_eq!(report.status, RunStatus::Failed);
        assert_eq!(report.failed_tasks, vec!["d".to_string()]);
        assert_eq!(report.instance("c").unwrap().state, TaskState::Success);
        assert_eq!(report.instance("d").unwrap().attempts, 2);
        assert_eq!(report.instance("e").unwrap().state, TaskState::UpstreamFailed);
        assert!(report
            .instance("d")
            .unwrap()
            .last_error
            .as_deref()
            .unwrap()
            .contains("disk full"));
    }

    #[tokio::test]
    async fn test_max_parallel_bounds_concurrency() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        struct Slow {
            running: Arc<AtomicUsize>,
            peak: Arc<AtomicUsize>,
        }

        #[async_trait::async_trait]
        impl TaskCallbacks for Slow {
            async fn data_transfer(&self, _params: &TaskParams) -> anyhow::Result<()> {
                let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                self.running.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
            async fn external_query(&self, _params: &TaskParams) -> anyhow::Result<()> {
                Ok(())
            }
            async fn external_job_submit(
                &self,
                _params: &TaskParams,
                _steps: &StepDefinition,
                _request_key: &str,
            ) -> anyhow::Result<ExternalStepHandle> {
                anyhow::bail!("unused")
            }
            async fn external_job_poll(
                &self,
                _handle: &ExternalStepHandle,
            ) -> anyhow::Result<ExternalStatus> {
                anyhow::bail!("unused")
            }
        }

        let tasks = (0..6).map(|i| transfer(&format!("t{}", i))).collect();
        let graph = TaskGraph::build("wide", tasks, &[]).unwrap();
        let scheduler = TaskScheduler::new(Arc::new(Slow {
            running: running.clone(),
            peak: peak.clone(),
        }))
        .with_max_parallel(2);

        let report = execute(&scheduler, graph).await;
        assert_eq!(report.status, RunStatus::Success);
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_submit_handle_flows_to_wait_task() {
        let mut mock = MockTaskCallbacks::new();
        mock.expect_external_job_submit()
            .times(1)
            .returning(|params, steps, _| {
                assert_eq!(params["key"], "movie_review/2022-01-11");
                Ok(ExternalStepHandle::new("j-1", "s-3", steps.step_count()))
            });
        mock.expect_external_job_poll().returning(|handle| {
            assert_eq!(handle.step_id, "s-3");
            Ok(ExternalStatus::Completed)
        });

        let steps = StepDefinition(serde_json::json!([{"Name": "one"}, {"Name": "two"}, {"Name": "three"}]));
        let graph = TaskGraph::build(
            "emr",
            vec![
                Task::new("add_steps", TaskKind::ExternalJobSubmit { steps })
                    .with_param("key", "movie_review/{{ ds }}"),
                Task::new(
                    "watch_last_step",
                    TaskKind::ExternalJobWait {
                        source: WaitSource::Upstream("add_steps".to_string()),
                        poll_interval: Duration::from_millis(5),
                        timeout: Duration::from_secs(5),
                    },
                ),
            ],
            &[Edge::new("add_steps", "watch_last_step")],
        )
        .unwrap();

        let report = execute(&TaskScheduler::new(Arc::new(mock)), graph).await;
        assert_eq!(report.status, RunStatus::Success);

        let wait = report.instance("watch_last_step").unwrap();
        let external = wait.external.as_ref().unwrap();
        assert_eq!(external.submitted_steps, 3);
        assert_eq!(external.last_status, Some(ExternalStatus::Completed));
    }

    /// Transfers panic for one task name and succeed otherwise
    struct PanicOn(&'static str);

    #[async_trait::async_trait]
    impl TaskCallbacks for PanicOn {
        async fn data_transfer(&self, params: &TaskParams) -> anyhow::Result<()> {
            if params["name"] == self.0 {
                panic!("callback exploded");
            }
            Ok(())
        }
        async fn external_query(&self, _params: &TaskParams) -> anyhow::Result<()> {
            Ok(())
        }
        async fn external_job_submit(
            &self,
            _params: &TaskParams,
            _steps: &StepDefinition,
            _request_key: &str,
        ) -> anyhow::Result<ExternalStepHandle> {
            anyhow::bail!("unused")
        }
        async fn external_job_poll(
            &self,
            _handle: &ExternalStepHandle,
        ) -> anyhow::Result<ExternalStatus> {
            anyhow::bail!("unused")
        }
    }

    #[tokio::test]
    async fn test_panicking_task_is_contained() {
        let graph = TaskGraph::build(
            "panics",
            vec![transfer("boom"), transfer("fine")],
            &[],
        )
        .unwrap();

        let report = execute(&TaskScheduler::new(Arc::new(PanicOn("boom"))), graph).await;
        assert_eq!(report.status, RunStatus::Failed);
        assert_eq!(report.failed_tasks, vec!["boom".to_string()]);
        assert!(report
            .instance("boom")
            .unwrap()
            .last_error
            .as_deref()
            .unwrap()
            .contains("callback exploded"));
        assert_eq!(report.instance("fine").unwrap().state, TaskState::Success);
    }

    #[tokio::test]
    async fn test_cancel_fails_in_flight_and_skips_rest() {
        let mut mock = MockTaskCallbacks::new();
        mock.expect_external_job_submit()
            .returning(|_, _, _| Ok(ExternalStepHandle::new("j-1", "s-1", 1)));
        mock.expect_external_job_poll()
            .returning(|_| Ok(ExternalStatus::Running));

        let graph = TaskGraph::build(
            "cancel",
            vec![
                Task::new(
                    "wait",
                    TaskKind::ExternalJobWait {
                        source: WaitSource::Submit(StepDefinition(serde_json::json!([{}]))),
                        poll_interval: Duration::from_millis(5),
                        timeout: Duration::from_secs(60),
                    },
                ),
                Task::no_op("after"),
            ],
            &[Edge::new("wait", "after")],
        )
        .unwrap();
        let graph = Arc::new(graph);
        let run = Run::new(handle("cancel"), ["wait", "after"]);

        let cancel = CancelHandle::new();
        let signal = cancel.signal();
        let scheduler = TaskScheduler::new(Arc::new(mock));
        let running = tokio::spawn(async move { scheduler.execute_run(graph, run, signal).await });

        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
        let report = running.await.unwrap().unwrap();

        assert_eq!(report.status, RunStatus::Cancelled);
        let wait = report.instance("wait").unwrap();
        assert_eq!(wait.state, TaskState::Failed);
        assert_eq!(wait.history.last().unwrap().outcome, AttemptOutcome::Cancelled);
        assert_eq!(report.instance("after").unwrap().state, TaskState::Skipped);
    }

    /// Transfers named `bad` fail at once; every other transfer sleeps
    struct SlowUnlessBad(Duration);

    #[async_trait::async_trait]
    impl TaskCallbacks for SlowUnlessBad {
        async fn data_transfer(&self, params: &TaskParams) -> anyhow::Result<()> {
            if params["name"] == "bad" {
                anyhow::bail!("bad credentials");
            }
            tokio::time::sleep(self.0).await;
            Ok(())
        }
        async fn external_query(&self, _params: &TaskParams) -> anyhow::Result<()> {
            Ok(())
        }
        async fn external_job_submit(
            &self,
            _params: &TaskParams,
            _steps: &StepDefinition,
            _request_key: &str,
        ) -> anyhow::Result<ExternalStepHandle> {
            anyhow::bail!("unused")
        }
        async fn external_job_poll(
            &self,
            _handle: &ExternalStepHandle,
        ) -> anyhow::Result<ExternalStatus> {
            anyhow::bail!("unused")
        }
    }

    #[tokio::test]
    async fn test_fail_fast_reports_only_the_original_failure() {
        let graph = TaskGraph::build(
            "fail_fast",
            vec![transfer("slow"), transfer("bad"), transfer("after_slow")],
            &[Edge::new("slow", "after_slow")],
        )
        .unwrap();
        let scheduler = TaskScheduler::new(Arc::new(SlowUnlessBad(Duration::from_millis(500))))
            .with_fail_fast(true)
            .with_default_retry(RetryPolicy::no_retry());

        let report = execute(&scheduler, graph).await;
        assert_eq!(report.status, RunStatus::Failed);
        assert_eq!(report.failed_tasks, vec!["bad".to_string()]);

        let slow = report.instance("slow").unwrap();
        assert_eq!(slow.state, TaskState::Failed);
        assert_eq!(slow.history.last().unwrap().outcome, AttemptOutcome::Cancelled);
        assert_eq!(report.instance("after_slow").unwrap().state, TaskState::Skipped);
    }

    #[tokio::test]
    async fn test_cancelled_run_has_no_root_cause() {
        let graph = Arc::new(
            TaskGraph::build("cancel_slow", vec![transfer("slow")], &[]).unwrap(),
        );
        let run = Run::new(handle("cancel_slow"), ["slow"]);
        let cancel = CancelHandle::new();
        let signal = cancel.signal();
        let scheduler = TaskScheduler::new(Arc::new(SlowUnlessBad(Duration::from_secs(30))));
        let running = tokio::spawn(async move { scheduler.execute_run(graph, run, signal).await });

        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
        let report = running.await.unwrap().unwrap();

        assert_eq!(report.status, RunStatus::Cancelled);
        assert!(report.failed_tasks.is_empty());
    }

    #[tokio::test]
    async fn test_polling_wait_leaves_pool_slot_free() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let polls = Arc::new(AtomicUsize::new(0));

        let mut mock = MockTaskCallbacks::new();
        mock.expect_external_job_submit()
            .returning(|_, _, _| Ok(ExternalStepHandle::new("j-1", "s-1", 1)));
        let (seen, counter) = (events.clone(), polls.clone());
        mock.expect_external_job_poll().returning(move |_| {
            seen.lock().unwrap().push("poll");
            if counter.fetch_add(1, Ordering::SeqCst) < 9 {
                Ok(ExternalStatus::Running)
            } else {
                Ok(ExternalStatus::Completed)
            }
        });
        let seen = events.clone();
        mock.expect_data_transfer().returning(move |_| {
            seen.lock().unwrap().push("transfer");
            Ok(())
        });

        let graph = TaskGraph::build(
            "shared_pool",
            vec![
                Task::new(
                    "wait",
                    TaskKind::ExternalJobWait {
                        source: WaitSource::Submit(StepDefinition(serde_json::json!([{}]))),
                        poll_interval: Duration::from_millis(10),
                        timeout: Duration::from_secs(5),
                    },
                ),
                transfer("load"),
            ],
            &[],
        )
        .unwrap();
        let scheduler = TaskScheduler::new(Arc::new(mock)).with_max_parallel(1);

        let report = execute(&scheduler, graph).await;
        assert_eq!(report.status, RunStatus::Success);
        assert_eq!(polls.load(Ordering::SeqCst), 10);

        let events = events.lock().unwrap();
        let transfer_at = events.iter().position(|e| *e == "transfer").unwrap();
        assert!(
            transfer_at < events.len() - 1,
            "transfer only ran after the wait finished: {:?}",
            *events
        );
    }

    #[tokio::test]
    async fn test_submit_uses_attempt_request_key() {
        let mut mock = MockTaskCallbacks::new();
        mock.expect_external_job_submit()
            .times(1)
            .returning(|_, _, request_key| {
                assert_eq!(
                    request_key,
                    external::submission_key("keys@2022-01-11T00:00:00Z", "add_steps", 1)
                );
                Ok(ExternalStepHandle::new("j-1", "s-1", 1))
            });

        let steps = StepDefinition(serde_json::json!([{"Name": "one"}]));
        let graph = TaskGraph::build(
            "keys",
            vec![Task::new("add_steps", TaskKind::ExternalJobSubmit { steps })],
            &[],
        )
        .unwrap();

        let report = execute(&TaskScheduler::new(Arc::new(mock)), graph).await;
        assert_eq!(report.status, RunStatus::Success);
    }

    #[tokio::test]
    async fn test_persists_final_state() {
        let state = Arc::new(StateManager::in_memory().unwrap());
        let mut mock = MockTaskCallbacks::new();
        mock.expect_external_query().returning(|_| Ok(()));

        let graph = TaskGraph::build(
            "persisted",
            vec![Task::new("query", TaskKind::ExternalQuery)],
            &[],
        )
        .unwrap();
        let scheduler = TaskScheduler::new(Arc::new(mock))
            .with_state(state.clone())
            .with_metrics(Metrics::new().unwrap());

        let report = execute(&scheduler, graph).await;
        let stored = state.load_run(&report.handle).unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Success);
        assert_eq!(stored.state_of("query"), Some(TaskState::Success));
        assert_eq!(state.get_attempts(&report.handle.run_id()).unwrap().len(), 1);
    }
}
