//! Error types for pipewright

use thiserror::Error;

/// pipewright error types
#[derive(Error, Debug)]
pub enum PipewrightError {
    /// YAML parsing errors
    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    /// JSON errors (step definition documents, job API payloads)
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Pipeline YAML size exceeded limit
    #[error("Pipeline YAML exceeds 1MB limit (size: {0} bytes)")]
    YamlSizeExceeded(usize),

    /// Task count exceeded limit
    #[error("Task count {count} exceeds limit of {limit}")]
    TaskCountExceeded { count: usize, limit: usize },

    /// Task name validation error
    #[error("Task name '{name}' exceeds {max} characters")]
    TaskNameTooLong { name: String, max: usize },

    /// Invalid task name format
    #[error("Invalid task name '{name}': only alphanumeric, underscore, and dash allowed")]
    InvalidTaskName { name: String },

    /// Graph definition: cycle between tasks
    #[error("Cycle detected in task graph: {0}")]
    CycleDetected(String),

    /// Graph definition: the same task id was declared twice
    #[error("Duplicate task id '{0}'")]
    DuplicateTaskId(String),

    /// Graph definition: an edge references a task that does not exist
    #[error("Edge {upstream} -> {downstream} references unknown task '{missing}'")]
    DanglingEdge {
        upstream: String,
        downstream: String,
        missing: String,
    },

    /// Graph definition: a task refers to another task it cannot use
    #[error("Task '{task}' references '{reference}': {reason}")]
    InvalidTaskReference {
        task: String,
        reference: String,
        reason: String,
    },

    /// Host callback failure, recoverable through the retry policy
    #[error("Task '{task}' failed: {message}")]
    TaskExecution { task: String, message: String },

    /// The external job system reported the step as failed
    #[error("External step {step_id} of task '{task}' failed: {message}")]
    ExternalJob {
        task: String,
        step_id: String,
        message: String,
    },

    /// The external step did not reach a terminal status before the deadline
    #[error("External step {step_id} of task '{task}' timed out after {timeout_secs} seconds")]
    ExternalTimeout {
        task: String,
        step_id: String,
        timeout_secs: u64,
    },

    /// A predecessor of the task did not succeed
    #[error("Task '{task}' not executed: upstream task '{upstream}' did not succeed")]
    UpstreamFailure { task: String, upstream: String },

    /// Another run of the same pipeline is active
    #[error("Pipeline '{pipeline}' already has an active run for {active}")]
    ConcurrentRunConflict { pipeline: String, active: String },

    /// The previous logical run did not succeed
    #[error("Run {run_id} is waiting on the previous run {previous} which ended {status}")]
    DependsOnPastBlocked {
        run_id: String,
        previous: String,
        status: String,
    },

    /// Work was stopped by a cancellation request
    #[error("Task '{task}' was cancelled")]
    Cancelled { task: String },

    /// Illegal task instance state transition
    #[error("Task '{task}' cannot move from {from} to {to}")]
    InvalidTransition {
        task: String,
        from: String,
        to: String,
    },

    /// Unknown run handle
    #[error("Run {0} not found")]
    RunNotFound(String),

    /// Database errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Settings errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP errors
    #[error("HTTP error: {0}")]
    Http(String),

    /// Pipeline validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    /// Generic error
    #[error("Error: {0}")]
    Other(String),
}

impl PipewrightError {
    /// True for errors raised while building a task graph.
    pub fn is_graph_definition(&self) -> bool {
        matches!(
            self,
            PipewrightError::CycleDetected(_)
                | PipewrightError::DuplicateTaskId(_)
                | PipewrightError::DanglingEdge { .. }
                | PipewrightError::InvalidTaskReference { .. }
        )
    }

    /// Process exit code for the `run` command.
    pub fn exit_code(&self) -> i32 {
        match self {
            e if e.is_graph_definition() => 2,
            PipewrightError::ConcurrentRunConflict { .. }
            | PipewrightError::DependsOnPastBlocked { .. } => 3,
            PipewrightError::Cancelled { .. } => 4,
            PipewrightError::TaskExecution { .. }
            | PipewrightError::ExternalJob { .. }
            | PipewrightError::ExternalTimeout { .. }
            | PipewrightError::UpstreamFailure { .. } => 1,
            _ => 5,
        }
    }
}

/// Result type alias using PipewrightError
pub type Result<T> = std::result::Result<T, PipewrightError>;
