//! Core data models for the pipewright execution core

use crate::error::{PipewrightError, Result};
use crate::retry::{Backoff, RetryPolicy};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

// Input validation limits
pub const MAX_YAML_SIZE: usize = 1_048_576; // 1 MB
pub const MAX_TASK_COUNT: usize = 1_000;
pub const MAX_TASK_NAME_LEN: usize = 64;
pub const MAX_STEP_DOCUMENT_SIZE: usize = 262_144; // 256 KB
pub const MAX_OUTPUT_SIZE: usize = 1_048_576; // 1 MB per stream

/// Task identifier, unique within a graph
pub type TaskId = String;

/// Task parameters after environment resolution
pub type TaskParams = BTreeMap<String, String>;

/// Pipeline definition parsed from YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>, // 6-field cron expression
    #[serde(default)]
    pub config: PipelineDefaults,
    pub tasks: Vec<TaskConfig>,
}

/// Pipeline-wide execution defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDefaults {
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub depends_on_past: bool,
    #[serde(default)]
    pub concurrency: ConcurrencyPolicy,
    #[serde(default)]
    pub fail_fast: bool,
}

impl Default for PipelineDefaults {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            retry: RetrySettings::default(),
            depends_on_past: false,
            concurrency: ConcurrencyPolicy::default(),
            fail_fast: false,
        }
    }
}

fn default_max_parallel() -> usize {
    4
}

/// What a trigger does while another run of the pipeline is active
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConcurrencyPolicy {
    #[default]
    Queue,
    Reject,
}

/// Retry settings as written in YAML; unset fields inherit
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RetrySettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backoff: Option<Backoff>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_delay_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_on_timeout: Option<bool>,
}

impl RetrySettings {
    /// Overlay these settings on `base`.
    pub fn apply_to(&self, base: &RetryPolicy) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries.unwrap_or(base.max_retries),
            backoff: self.backoff.unwrap_or(base.backoff),
            base_delay: self
                .delay_secs
                .map(Duration::from_secs)
                .unwrap_or(base.base_delay),
            max_delay: self
                .max_delay_secs
                .map(Duration::from_secs)
                .unwrap_or(base.max_delay),
            retry_on_timeout: self.retry_on_timeout.unwrap_or(base.retry_on_timeout),
        }
    }
}

/// Individual task definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetrySettings>,
    /// Step definition document path, relative to the pipeline file
    #[serde(skip_serializing_if = "Option::is_none")]
    pub steps_file: Option<String>,
    /// Inline step definition document
    #[serde(skip_serializing_if = "Option::is_none")]
    pub steps: Option<serde_json::Value>,
    /// Submit task whose handle an external wait task polls
    #[serde(skip_serializing_if = "Option::is_none")]
    pub submit_task: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll_interval: Option<u64>, // seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>, // seconds
}

/// Task type as written in YAML
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    DataTransfer,
    ExternalQuery,
    ExternalJobSubmit,
    ExternalJobWait,
    NoOp,
}

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_EXTERNAL_TIMEOUT: Duration = Duration::from_secs(6 * 60 * 60);

/// Opaque step definition document forwarded to the job system
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition(pub serde_json::Value);

impl StepDefinition {
    /// Number of steps in the document (a non-array document is one step)
    pub fn step_count(&self) -> usize {
        match &self.0 {
            serde_json::Value::Array(steps) => steps.len(),
            serde_json::Value::Null => 0,
            _ => 1,
        }
    }
}

/// Where an external wait task gets the step it polls
#[derive(Debug, Clone, PartialEq)]
pub enum WaitSource {
    /// Poll the handle produced by an upstream submit task
    Upstream(TaskId),
    /// Submit these steps at the start of every attempt
    Submit(StepDefinition),
}

/// Closed set of task kinds, one execution strategy each
#[derive(Debug, Clone, PartialEq)]
pub enum TaskKind {
    DataTransfer,
    ExternalQuery,
    ExternalJobSubmit {
        steps: StepDefinition,
    },
    ExternalJobWait {
        source: WaitSource,
        poll_interval: Duration,
        timeout: Duration,
    },
    NoOp,
}

impl TaskKind {
    pub fn name(&self) -> &'static str {
        match self {
            TaskKind::DataTransfer => "data_transfer",
            TaskKind::ExternalQuery => "external_query",
            TaskKind::ExternalJobSubmit { .. } => "external_job_submit",
            TaskKind::ExternalJobWait { .. } => "external_job_wait",
            TaskKind::NoOp => "no_op",
        }
    }
}

/// Immutable task definition inside a graph
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub id: TaskId,
    pub kind: TaskKind,
    pub params: TaskParams,
    pub retry: Option<RetryPolicy>,
}

impl Task {
    pub fn new(id: impl Into<TaskId>, kind: TaskKind) -> Self {
        Self {
            id: id.into(),
            kind,
            params: TaskParams::new(),
            retry: None,
        }
    }

    pub fn no_op(id: impl Into<TaskId>) -> Self {
        Self::new(id, TaskKind::NoOp)
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }
}

/// Task instance state
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Ready,
    Running,
    Retrying,
    Success,
    Failed,
    UpstreamFailed,
    Skipped,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Success | TaskState::Failed | TaskState::UpstreamFailed | TaskState::Skipped
        )
    }

    /// Terminal and not a success
    pub fn blocks_downstream(self) -> bool {
        matches!(
            self,
            TaskState::Failed | TaskState::UpstreamFailed | TaskState::Skipped
        )
    }

    fn can_move_to(self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Pending, Ready | UpstreamFailed | Skipped)
                | (Ready, Running | Skipped)
                | (Running, Retrying | Success | Failed)
                | (Retrying, Running | Failed)
        )
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskState::Pending => "pending",
            TaskState::Ready => "ready",
            TaskState::Running => "running",
            TaskState::Retrying => "retrying",
            TaskState::Success => "success",
            TaskState::Failed => "failed",
            TaskState::UpstreamFailed => "upstream_failed",
            TaskState::Skipped => "skipped",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for TaskState {
    type Err = PipewrightError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(TaskState::Pending),
            "ready" => Ok(TaskState::Ready),
            "running" => Ok(TaskState::Running),
            "retrying" => Ok(TaskState::Retrying),
            "success" => Ok(TaskState::Success),
            "failed" => Ok(TaskState::Failed),
            "upstream_failed" => Ok(TaskState::UpstreamFailed),
            "skipped" => Ok(TaskState::Skipped),
            other => Err(PipewrightError::Other(format!("Unknown task state '{}'", other))),
        }
    }
}

/// Run status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Queued,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Success | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    /// Process exit code reported by the `run` command
    pub fn exit_code(self) -> i32 {
        match self {
            RunStatus::Success => 0,
            RunStatus::Failed => 1,
            RunStatus::Queued | RunStatus::Running => 3,
            RunStatus::Cancelled => 4,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Queued => write!(f, "queued"),
            RunStatus::Running => write!(f, "running"),
            RunStatus::Success => write!(f, "success"),
            RunStatus::Failed => write!(f, "failed"),
            RunStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for RunStatus {
    type Err = PipewrightError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(RunStatus::Queued),
            "running" => Ok(RunStatus::Running),
            "success" => Ok(RunStatus::Success),
            "failed" => Ok(RunStatus::Failed),
            "cancelled" => Ok(RunStatus::Cancelled),
            other => Err(PipewrightError::Other(format!("Unknown run status '{}'", other))),
        }
    }
}

/// Status reported by the external job system for one step
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase", tag = "state", content = "message")]
pub enum ExternalStatus {
    Pending,
    Running,
    Completed,
    Failed(Option<String>),
    Cancelled,
}

impl ExternalStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExternalStatus::Completed | ExternalStatus::Failed(_) | ExternalStatus::Cancelled
        )
    }
}

impl std::fmt::Display for ExternalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExternalStatus::Pending => write!(f, "pending"),
            ExternalStatus::Running => write!(f, "running"),
            ExternalStatus::Completed => write!(f, "completed"),
            ExternalStatus::Failed(Some(msg)) => write!(f, "failed: {}", msg),
            ExternalStatus::Failed(None) => write!(f, "failed"),
            ExternalStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Monitor-side lifecycle of an external step
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MonitorState {
    Submitted,
    Polling,
    Completed,
    ExternalFailed,
    Cancelled,
    TimedOut,
}

impl std::fmt::Display for MonitorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MonitorState::Submitted => "submitted",
            MonitorState::Polling => "polling",
            MonitorState::Completed => "completed",
            MonitorState::ExternalFailed => "external_failed",
            MonitorState::Cancelled => "cancelled",
            MonitorState::TimedOut => "timed_out",
        };
        write!(f, "{}", s)
    }
}

/// Handle to a step submitted to the external job system
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExternalStepHandle {
    /// Job (cluster / job flow) the step was added to
    pub job_id: String,
    /// Identifier of the step to watch, as returned by the submission
    pub step_id: String,
    /// Number of steps in the submitted document
    pub submitted_steps: usize,
    pub state: MonitorState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_status: Option<ExternalStatus>,
}

impl ExternalStepHandle {
    pub fn new(job_id: impl Into<String>, step_id: impl Into<String>, submitted_steps: usize) -> Self {
        Self {
            job_id: job_id.into(),
            step_id: step_id.into(),
            submitted_steps,
            state: MonitorState::Submitted,
            last_status: None,
        }
    }
}

/// Outcome of a single attempt
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    /// Failed, another attempt follows
    TransientFailure,
    /// Failed and no attempts remain
    Exhausted,
    /// Failed with an error the policy never retries
    Fatal,
    Cancelled,
}

impl std::fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AttemptOutcome::Success => "success",
            AttemptOutcome::TransientFailure => "transient_failure",
            AttemptOutcome::Exhausted => "exhausted",
            AttemptOutcome::Fatal => "fatal",
            AttemptOutcome::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for AttemptOutcome {
    type Err = PipewrightError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "success" => Ok(AttemptOutcome::Success),
            "transient_failure" => Ok(AttemptOutcome::TransientFailure),
            "exhausted" => Ok(AttemptOutcome::Exhausted),
            "fatal" => Ok(AttemptOutcome::Fatal),
            "cancelled" => Ok(AttemptOutcome::Cancelled),
            other => Err(PipewrightError::Other(format!(
                "Unknown attempt outcome '{}'",
                other
            ))),
        }
    }
}

/// One recorded attempt of a task
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub outcome: AttemptOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Per-run state of one task
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskInstance {
    pub task_id: TaskId,
    pub state: TaskState,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external: Option<ExternalStepHandle>,
    #[serde(default)]
    pub history: Vec<AttemptRecord>,
}

impl TaskInstance {
    pub fn new(task_id: impl Into<TaskId>) -> Self {
        Self {
            task_id: task_id.into(),
            state: TaskState::Pending,
            attempts: 0,
            last_error: None,
            external: None,
            history: Vec::new(),
        }
    }

    /// Move to `next`, refusing to leave a terminal state.
    pub fn transition(&mut self, next: TaskState) -> Result<()> {
        if !self.state.can_move_to(next) {
            return Err(PipewrightError::InvalidTransition {
                task: self.task_id.clone(),
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        self.state = next;
        Ok(())
    }

    /// Failed on its own account: the last attempt exhausted its retries or
    /// hit a fatal error. A task stopped by fail-fast or cancellation, mid
    /// attempt or in backoff, is `Failed` without being a root cause.
    pub fn is_root_failure(&self) -> bool {
        self.state == TaskState::Failed
            && matches!(
                self.history.last().map(|record| record.outcome),
                Some(AttemptOutcome::Exhausted | AttemptOutcome::Fatal)
            )
    }

    /// Put an interrupted instance back in line after a restart.
    ///
    /// Terminal instances are left untouched.
    pub fn reset_for_resume(&mut self) {
        if !self.state.is_terminal() {
            self.state = TaskState::Pending;
        }
    }
}

/// Identifies one run: pipeline plus logical timestamp
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunHandle {
    pub graph_id: String,
    pub logical_ts: DateTime<Utc>,
}

impl RunHandle {
    pub fn new(graph_id: impl Into<String>, logical_ts: DateTime<Utc>) -> Self {
        Self {
            graph_id: graph_id.into(),
            logical_ts,
        }
    }

    pub fn run_id(&self) -> String {
        format!(
            "{}@{}",
            self.graph_id,
            self.logical_ts.to_rfc3339_opts(SecondsFormat::Secs, true)
        )
    }
}

impl std::fmt::Display for RunHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.run_id())
    }
}

/// One execution of a graph for a logical timestamp
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Run {
    pub handle: RunHandle,
    pub status: RunStatus,
    pub instances: HashMap<TaskId, TaskInstance>,
}

impl Run {
    /// Fresh run with every instance `Pending`
    pub fn new<'a>(handle: RunHandle, task_ids: impl IntoIterator<Item = &'a str>) -> Self {
        let instances = task_ids
            .into_iter()
            .map(|id| (id.to_string(), TaskInstance::new(id)))
            .collect();
        Self {
            handle,
            status: RunStatus::Queued,
            instances,
        }
    }

    pub fn instance(&self, task_id: &str) -> Option<&TaskInstance> {
        self.instances.get(task_id)
    }

    pub fn state_of(&self, task_id: &str) -> Option<TaskState> {
        self.instances.get(task_id).map(|i| i.state)
    }

    pub fn all_terminal(&self) -> bool {
        self.instances.values().all(|i| i.state.is_terminal())
    }
}

/// Final outcome of a run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunReport {
    pub handle: RunHandle,
    pub status: RunStatus,
    /// Tasks that failed themselves, not merely upstream-failed
    pub failed_tasks: Vec<TaskId>,
    /// Instances in graph insertion order
    pub instances: Vec<TaskInstance>,
}

impl RunReport {
    pub fn instance(&self, task_id: &str) -> Option<&TaskInstance> {
        self.instances.iter().find(|i| i.task_id == task_id)
    }

    pub fn success_count(&self) -> usize {
        self.instances
            .iter()
            .filter(|i| i.state == TaskState::Success)
            .count()
    }
}

/// Persisted run record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub pipeline: String,
    pub logical_ts: DateTime<Utc>,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Persisted attempt row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRow {
    pub task_id: TaskId,
    pub record: AttemptRecord,
}
