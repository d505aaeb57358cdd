//! Cron triggering for scheduled pipelines
//!
//! Each cron tick triggers one run through the [`RunManager`], with the tick
//! time truncated to the minute as the logical timestamp. Overlap and
//! `depends_on_past` handling stay with the run manager, so a slow run never
//! causes a tick to execute the same logical run twice.
//!
//! # Example
//!
//! ```no_run
//! use pipewright::cron_scheduler::CronScheduler;
//! use pipewright::parser::parse_pipeline_file;
//! use pipewright::run_manager::RunManager;
//! use pipewright::settings::PipelineEnv;
//!
//! # async fn example(runs: RunManager) -> anyhow::Result<()> {
//! let pipeline = parse_pipeline_file("user_behaviour.yaml", &PipelineEnv::new())?;
//! let mut cron = CronScheduler::new(runs).await?;
//! cron.add_pipeline(&pipeline).await?;
//! cron.start().await?;
//! # Ok(())
//! # }
//! ```

use crate::error::{PipewrightError, Result};
use crate::parser::Pipeline;
use crate::run_manager::RunManager;
use chrono::{DateTime, Timelike, Utc};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

pub struct CronScheduler {
    scheduler: JobScheduler,
    runs: RunManager,
    jobs: usize,
}

impl CronScheduler {
    pub async fn new(runs: RunManager) -> Result<Self> {
        let scheduler = JobScheduler::new()
            .await
            .map_err(|e| PipewrightError::Other(format!("Failed to create job scheduler: {}", e)))?;

        Ok(Self {
            scheduler,
            runs,
            jobs: 0,
        })
    }

    /// Register `pipeline` under its `schedule`.
    ///
    /// # Errors
    ///
    /// * `PipewrightError::Validation` - no schedule, or an invalid cron expression
    pub async fn add_pipeline(&mut self, pipeline: &Pipeline) -> Result<()> {
        let schedule = pipeline.schedule.as_deref().ok_or_else(|| {
            PipewrightError::Validation(format!(
                "Pipeline '{}' has no schedule defined",
                pipeline.name
            ))
        })?;

        let graph = pipeline.graph.clone();
        let options = pipeline.trigger_options();
        let runs = self.runs.clone();

        let job = Job::new_async(schedule, move |_uuid, _lock| {
            let graph = graph.clone();
            let options = options.clone();
            let runs = runs.clone();

            Box::pin(async move {
                let logical_ts = logical_timestamp(Utc::now());
                match runs.trigger(graph.clone(), logical_ts, options) {
                    Ok(handle) => info!("Cron tick triggered run {}", handle),
                    Err(e) => error!(
                        "Cron tick for '{}' at {} not triggered: {}",
                        graph.id(),
                        logical_ts,
                        e
                    ),
                }
            })
        })
        .map_err(|e| {
            PipewrightError::Validation(format!("Invalid cron expression '{}': {}", schedule, e))
        })?;

        self.scheduler
            .add(job)
            .await
            .map_err(|e| PipewrightError::Other(format!("Failed to add job: {}", e)))?;
        self.jobs += 1;

        info!("Pipeline '{}' scheduled with '{}'", pipeline.name, schedule);
        Ok(())
    }

    pub async fn start(&self) -> Result<()> {
        self.scheduler
            .start()
            .await
            .map_err(|e| PipewrightError::Other(format!("Failed to start scheduler: {}", e)))?;
        info!("Cron scheduler started with {} job(s)", self.jobs);
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.scheduler
            .shutdown()
            .await
            .map_err(|e| PipewrightError::Other(format!("Failed to shutdown scheduler: {}", e)))?;
        info!("Cron scheduler stopped");
        Ok(())
    }

    pub fn job_count(&self) -> usize {
        self.jobs
    }
}

/// Logical timestamp of a tick: the tick time truncated to the minute
pub fn logical_timestamp(tick: DateTime<Utc>) -> DateTime<Utc> {
    tick.with_nanosecond(0)
        .and_then(|t| t.with_second(0))
        .unwrap_or(tick)
}
