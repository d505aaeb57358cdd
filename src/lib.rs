//! pipewright - task-graph execution core for scheduled data pipelines
//!
//! A pipeline is a DAG of heterogeneous tasks (data transfers, queries,
//! external job submissions and waits). [`run_manager::RunManager`] turns a
//! trigger for a logical date into exactly one run, [`scheduler::TaskScheduler`]
//! drives that run to a terminal status under a parallelism bound, and
//! [`retry::RetryManager`] and [`external::ExternalStepMonitor`] handle
//! retries and long-running external steps.

pub mod cli;
pub mod cron_scheduler;
pub mod dag;
pub mod error;
pub mod executors;
pub mod external;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod params;
pub mod parser;
pub mod retry;
pub mod run_manager;
pub mod scheduler;
pub mod settings;
pub mod signal;
pub mod state;
pub mod templates;
