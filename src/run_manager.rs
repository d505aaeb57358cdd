//! Run lifecycle: triggering, queueing, resuming and awaiting runs
//!
//! A run is identified by `(pipeline, logical timestamp)`. Triggering the
//! same pair twice never executes it twice: a known run is returned as is, a
//! finished persisted run is reported without re-execution, and an
//! interrupted persisted run is resumed with its completed tasks kept.
//!
//! At most one run per pipeline executes at a time. Later triggers wait in a
//! queue ordered by logical timestamp, or are rejected when the pipeline's
//! concurrency policy is `reject`.

use crate::dag::TaskGraph;
use crate::error::{PipewrightError, Result};
use crate::models::{ConcurrencyPolicy, Run, RunHandle, RunReport, RunStatus, TaskState};
use crate::scheduler::{build_report, TaskScheduler};
use crate::signal::CancelHandle;
use crate::state::StateManager;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Per-trigger run policies, usually taken from the pipeline defaults
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TriggerOptions {
    pub concurrency: ConcurrencyPolicy,
    /// Hold the run until the previous logical run succeeded
    pub depends_on_past: bool,
}

type RunOutcome = std::result::Result<Arc<RunReport>, String>;

/// Why a queued run is not starting
#[derive(Debug, Clone, PartialEq, Eq)]
struct Blocker {
    previous: String,
    status: String,
}

struct RunEntry {
    handle: RunHandle,
    graph: Arc<TaskGraph>,
    /// Taken when the run starts
    pending: Option<Run>,
    status: RunStatus,
    options: TriggerOptions,
    blocked: Option<Blocker>,
    cancel: CancelHandle,
    done: watch::Sender<Option<RunOutcome>>,
}

#[derive(Default)]
struct PipelineRuns {
    runs: BTreeMap<DateTime<Utc>, RunEntry>,
    active: Option<DateTime<Utc>>,
}

/// Owns every run known to this process
#[derive(Clone)]
pub struct RunManager {
    inner: Arc<Mutex<HashMap<String, PipelineRuns>>>,
    scheduler: TaskScheduler,
    state: Option<Arc<StateManager>>,
}

impl RunManager {
    pub fn new(scheduler: TaskScheduler) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            scheduler,
            state: None,
        }
    }

    /// Look up and record runs in `state`
    pub fn with_state(mut self, state: Arc<StateManager>) -> Self {
        self.state = Some(state);
        self
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, PipelineRuns>>> {
        self.inner
            .lock()
            .map_err(|_| PipewrightError::Other("run manager lock poisoned".to_string()))
    }

    /// Trigger a run of `graph` for `logical_ts`.
    ///
    /// Must be called from within a Tokio runtime; an eligible run starts on
    /// a spawned task before this returns.
    pub fn trigger(
        &self,
        graph: Arc<TaskGraph>,
        logical_ts: DateTime<Utc>,
        options: TriggerOptions,
    ) -> Result<RunHandle> {
        let handle = RunHandle::new(graph.id(), logical_ts);
        if self.is_known(&handle)? {
            debug!("Run {} already known, not triggering again", handle);
            return Ok(handle);
        }

        let persisted = match &self.state {
            Some(state) => state.load_run(&handle)?,
            None => None,
        };

        let mut inner = self.lock()?;
        let pipeline = inner.entry(graph.id().to_string()).or_default();
        if pipeline.runs.contains_key(&logical_ts) {
            return Ok(handle);
        }

        let run = match persisted {
            Some(run) if run.status.is_terminal() => {
                info!("Run {} already finished {}, not re-executing", handle, run.status);
                let status = run.status;
                let report = build_report(&graph, run);
                let (done, _) = watch::channel(Some(Ok(Arc::new(report))));
                pipeline.runs.insert(
                    logical_ts,
                    RunEntry {
                        handle: handle.clone(),
                        graph,
                        pending: None,
                        status,
                        options,
                        blocked: None,
                        cancel: CancelHandle::new(),
                        done,
                    },
                );
                return Ok(handle);
            }
            Some(mut run) => {
                let kept = run
                    .instances
                    .values()
                    .filter(|i| i.state == TaskState::Success)
                    .count();
                info!("Resuming run {} ({} task(s) already succeeded)", handle, kept);
                for instance in run.instances.values_mut() {
                    instance.reset_for_resume();
                }
                run.status = RunStatus::Queued;
                run
            }
            None => Run::new(
                handle.clone(),
                graph.all_tasks().iter().map(|t| t.id.as_str()),
            ),
        };

        if options.concurrency == ConcurrencyPolicy::Reject {
            if let Some(active) = pipeline.runs.values().find(|e| !e.status.is_terminal()) {
                return Err(PipewrightError::ConcurrentRunConflict {
                    pipeline: graph.id().to_string(),
                    active: active.handle.run_id(),
                });
            }
        }

        if let Some(state) = &self.state {
            state.save_run(&run)?;
        }

        let (done, _) = watch::channel(None);
        pipeline.runs.insert(
            logical_ts,
            RunEntry {
                handle: handle.clone(),
                graph: graph.clone(),
                pending: Some(run),
                status: RunStatus::Queued,
                options,
                blocked: None,
                cancel: CancelHandle::new(),
                done,
            },
        );
        info!("Queued run {}", handle);

        self.pump(&mut inner, graph.id());
        Ok(handle)
    }

    /// Re-trigger runs a previous process left queued or running
    pub fn resume_interrupted(
        &self,
        graph: Arc<TaskGraph>,
        options: TriggerOptions,
    ) -> Result<Vec<RunHandle>> {
        let Some(state) = &self.state else {
            return Ok(Vec::new());
        };

        let mut handles = Vec::new();
        for record in state.interrupted_runs(graph.id())? {
            handles.push(self.trigger(graph.clone(), record.logical_ts, options.clone())?);
        }
        Ok(handles)
    }

    fn is_known(&self, handle: &RunHandle) -> Result<bool> {
        let inner = self.lock()?;
        Ok(inner
            .get(&handle.graph_id)
            .is_some_and(|p| p.runs.contains_key(&handle.logical_ts)))
    }

    /// Current status of a run known to this manager
    pub fn status(&self, handle: &RunHandle) -> Result<RunStatus> {
        let inner = self.lock()?;
        entry(&inner, handle).map(|e| e.status)
    }

    /// True while the run waits on an unsuccessful previous run
    pub fn is_blocked(&self, handle: &RunHandle) -> Result<bool> {
        let inner = self.lock()?;
        entry(&inner, handle).map(|e| e.blocked.is_some())
    }

    /// `DependsOnPastBlocked` if the run is held back by its predecessor
    pub fn check_blocked(&self, handle: &RunHandle) -> Result<()> {
        let inner = self.lock()?;
        match &entry(&inner, handle)?.blocked {
            Some(blocker) => Err(PipewrightError::DependsOnPastBlocked {
                run_id: handle.run_id(),
                previous: blocker.previous.clone(),
                status: blocker.status.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Wait until the run reaches a terminal status
    pub async fn await_run(&self, handle: &RunHandle) -> Result<RunReport> {
        let mut rx = {
            let inner = self.lock()?;
            entry(&inner, handle)?.done.subscribe()
        };

        loop {
            let current = rx.borrow_and_update().clone();
            match current {
                Some(Ok(report)) => return Ok(report.as_ref().clone()),
                Some(Err(message)) => return Err(PipewrightError::Other(message)),
                None => {}
            }
            if rx.changed().await.is_err() {
                return Err(PipewrightError::Other(format!(
                    "Run {} was dropped before finishing",
                    handle
                )));
            }
        }
    }

    /// Cancel a queued or running run. Finished runs are left alone.
    pub fn cancel(&self, handle: &RunHandle) -> Result<()> {
        let mut inner = self.lock()?;
        let pipeline = inner
            .get_mut(&handle.graph_id)
            .ok_or_else(|| PipewrightError::RunNotFound(handle.run_id()))?;
        let entry = pipeline
            .runs
            .get_mut(&handle.logical_ts)
            .ok_or_else(|| PipewrightError::RunNotFound(handle.run_id()))?;

        match entry.status {
            RunStatus::Running => {
                info!("Cancelling run {}", handle);
                entry.cancel.cancel();
            }
            RunStatus::Queued => {
                info!("Cancelling queued run {}", handle);
                let mut run = entry.pending.take().unwrap_or_else(|| {
                    Run::new(
                        handle.clone(),
                        entry.graph.all_tasks().iter().map(|t| t.id.as_str()),
                    )
                });
                for instance in run.instances.values_mut() {
                    if !instance.state.is_terminal() {
                        instance.state = TaskState::Skipped;
                    }
                }
                run.status = RunStatus::Cancelled;
                if let Some(state) = &self.state {
                    state.save_run(&run)?;
                }

                entry.status = RunStatus::Cancelled;
                entry.blocked = None;
                let report = build_report(&entry.graph, run);
                entry.done.send_replace(Some(Ok(Arc::new(report))));

                let pipeline_id = handle.graph_id.clone();
                self.pump(&mut inner, &pipeline_id);
            }
            _ => debug!("Run {} already finished, nothing to cancel", handle),
        }
        Ok(())
    }

    /// Start the earliest queued run of `pipeline_id` if none is active
    fn pump(&self, inner: &mut HashMap<String, PipelineRuns>, pipeline_id: &str) {
        let Some(pipeline) = inner.get_mut(pipeline_id) else {
            return;
        };
        if pipeline.active.is_some() {
            return;
        }

        let Some(ts) = pipeline
            .runs
            .iter()
            .find(|(_, e)| e.status == RunStatus::Queued)
            .map(|(ts, _)| *ts)
        else {
            return;
        };

        let depends_on_past = pipeline.runs[&ts].options.depends_on_past;
        if depends_on_past {
            let blocker = self.previous_blocker(pipeline, pipeline_id, ts);
            if let Some(entry) = pipeline.runs.get_mut(&ts) {
                if let Some(b) = blocker.as_ref().filter(|b| entry.blocked.as_ref() != Some(*b)) {
                    warn!(
                        "Run {} held: previous run {} is {}",
                        entry.handle, b.previous, b.status
                    );
                }
                let held = blocker.is_some();
                entry.blocked = blocker;
                if held {
                    return;
                }
            }
        }

        let Some(entry) = pipeline.runs.get_mut(&ts) else {
            return;
        };
        let Some(run) = entry.pending.take() else {
            return;
        };

        entry.status = RunStatus::Running;
        pipeline.active = Some(ts);

        let manager = self.clone();
        let scheduler = self.scheduler.clone();
        let graph = entry.graph.clone();
        let handle = entry.handle.clone();
        let signal = entry.cancel.signal();

        info!("Starting run {}", handle);
        tokio::spawn(async move {
            let result = scheduler.execute_run(graph, run, signal).await;
            manager.finish(&handle, result);
        });
    }

    /// The previous logical run, if it exists and has not succeeded
    fn previous_blocker(
        &self,
        pipeline: &PipelineRuns,
        pipeline_id: &str,
        ts: DateTime<Utc>,
    ) -> Option<Blocker> {
        let in_memory = pipeline
            .runs
            .range(..ts)
            .next_back()
            .map(|(prev_ts, e)| (*prev_ts, e.handle.run_id(), e.status));

        let persisted = match &self.state {
            Some(state) => match state.previous_run(pipeline_id, ts) {
                Ok(record) => record.map(|r| (r.logical_ts, r.run_id, r.status)),
                Err(e) => {
                    error!("Could not load previous run of '{}': {}", pipeline_id, e);
                    return Some(Blocker {
                        previous: "unknown".to_string(),
                        status: "unavailable".to_string(),
                    });
                }
            },
            None => None,
        };

        // The manager's view is fresher than the database for runs it owns.
        let previous = match (in_memory, persisted) {
            (Some(mem), Some(db)) if db.0 > mem.0 => Some(db),
            (Some(mem), _) => Some(mem),
            (None, db) => db,
        };

        match previous {
            Some((_, run_id, status)) if status != RunStatus::Success => Some(Blocker {
                previous: run_id,
                status: status.to_string(),
            }),
            _ => None,
        }
    }

    fn finish(&self, handle: &RunHandle, result: Result<RunReport>) {
        let outcome: RunOutcome = match result {
            Ok(report) => {
                info!("Run {} finished {}", handle, report.status);
                Ok(Arc::new(report))
            }
            Err(e) => {
                error!("Run {} aborted: {}", handle, e);
                if let Some(state) = &self.state {
                    if let Err(db) = state.update_run_status(handle, RunStatus::Failed) {
                        error!("Could not record failure of run {}: {}", handle, db);
                    }
                }
                Err(e.to_string())
            }
        };

        let mut inner = match self.lock() {
            Ok(inner) => inner,
            Err(e) => {
                error!("Run {} finished but could not be recorded: {}", handle, e);
                return;
            }
        };

        if let Some(pipeline) = inner.get_mut(&handle.graph_id) {
            if pipeline.active == Some(handle.logical_ts) {
                pipeline.active = None;
            }
            if let Some(entry) = pipeline.runs.get_mut(&handle.logical_ts) {
                entry.status = match &outcome {
                    Ok(report) => report.status,
                    Err(_) => RunStatus::Failed,
                };
                entry.done.send_replace(Some(outcome));
            }
        }

        self.pump(&mut inner, &handle.graph_id);
    }
}

fn entry<'a>(inner: &'a HashMap<String, PipelineRuns>, handle: &RunHandle) -> Result<&'a RunEntry> {
    inner
        .get(&handle.graph_id)
        .and_then(|p| p.runs.get(&handle.logical_ts))
        .ok_or_else(|| PipewrightError::RunNotFound(handle.run_id()))
}
