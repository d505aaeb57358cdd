//! Command-line interface for pipewright

use crate::cron_scheduler::CronScheduler;
use crate::executors::{HostCallbacks, HttpJobClient, ShellCallbacks, TaskCallbacks};
use crate::logging::{init_logging, LogConfig, LogFormat, LogLevel};
use crate::metrics::Metrics;
use crate::models::{RunHandle, RunReport, TaskState};
use crate::parser::{parse_pipeline_file, Pipeline};
use crate::run_manager::RunManager;
use crate::scheduler::TaskScheduler;
use crate::settings::Settings;
use crate::state::StateManager;
use crate::templates;
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// pipewright - task-graph runner for scheduled data pipelines
#[derive(Parser, Debug)]
#[command(name = "pipewright")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Task-graph runner for scheduled data pipelines", long_about = None)]
pub struct Cli {
    /// Settings file (default: ./pipewright.{toml,yaml,json} if present)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, global = true)]
    pub log_level: Option<String>,

    /// Log format (json or pretty)
    #[arg(long, global = true)]
    pub log_format: Option<String>,

    /// SQLite database for run state
    #[arg(long, global = true)]
    pub db_path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a pipeline once for a logical date and wait for it
    Run {
        /// Pipeline YAML file
        pipeline: PathBuf,

        /// Logical date (YYYY-MM-DD or RFC 3339); defaults to today (UTC)
        #[arg(short, long)]
        date: Option<String>,
    },

    /// Validate a pipeline YAML file and print its execution levels
    Validate {
        /// Pipeline YAML file
        pipeline: PathBuf,
    },

    /// Show recent runs
    Status {
        /// Pipeline name (lists all pipelines if omitted)
        pipeline: Option<String>,

        /// Number of recent runs to show
        #[arg(long, default_value = "10")]
        limit: usize,
    },

    /// Show task attempts of a run
    Logs {
        /// Pipeline name
        pipeline: String,

        /// Logical date of the run (latest run if omitted)
        #[arg(short, long)]
        date: Option<String>,

        /// Only show this task
        #[arg(short, long)]
        task: Option<String>,
    },

    /// Trigger a pipeline on its cron schedule until Ctrl-C
    Serve {
        /// Pipeline YAML file (must define `schedule`)
        pipeline: PathBuf,

        /// Port for the Prometheus `/metrics` endpoint
        #[arg(long)]
        metrics_port: Option<u16>,
    },

    /// Print built-in pipeline templates
    Template {
        /// Template type (omit to list available templates)
        #[arg(short = 't', long = "type")]
        template_type: Option<TemplateType>,

        /// Write output to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, ValueEnum)]
pub enum TemplateType {
    /// Single no-op task
    Minimal,
    /// Local transfer and query commands
    Transfer,
    /// Daily user-behaviour pipeline with an external job
    UserBehaviour,
}

impl TemplateType {
    fn name(&self) -> &'static str {
        match self {
            TemplateType::Minimal => "minimal",
            TemplateType::Transfer => "transfer",
            TemplateType::UserBehaviour => "user-behaviour",
        }
    }
}

impl Cli {
    /// Settings file and `PIPEWRIGHT_*` variables, with CLI flags on top
    pub fn load_settings(&self) -> crate::error::Result<Settings> {
        let mut settings = Settings::load(self.config.as_deref())?;
        if let Some(db_path) = &self.db_path {
            settings.db_path = db_path.clone();
        }
        Ok(settings)
    }

    pub fn init_logging(&self, settings: &Settings) -> anyhow::Result<()> {
        let level = self
            .log_level
            .as_deref()
            .or(settings.log_level.as_deref())
            .map(LogLevel::from)
            .unwrap_or(LogLevel::Info);
        let format = self
            .log_format
            .as_deref()
            .map(LogFormat::from)
            .or(settings.log_format)
            .unwrap_or_default();

        init_logging(&LogConfig { level, format })
    }

    /// Execute the command and return the process exit code
    pub async fn execute(&self, settings: &Settings) -> anyhow::Result<i32> {
        match &self.command {
            Commands::Run { pipeline, date } => {
                self.run_pipeline(settings, pipeline, date.as_deref()).await
            }
            Commands::Validate { pipeline } => self.validate_pipeline(settings, pipeline),
            Commands::Status { pipeline, limit } => {
                self.show_status(settings, pipeline.as_deref(), *limit)
            }
            Commands::Logs {
                pipeline,
                date,
                task,
            } => self.show_logs(settings, pipeline, date.as_deref(), task.as_deref()),
            Commands::Serve {
                pipeline,
                metrics_port,
            } => self.serve(settings, pipeline, *metrics_port).await,
            Commands::Template {
                template_type,
                output,
            } => self.handle_template(template_type.as_ref(), output.as_ref()),
        }
    }

    async fn run_pipeline(
        &self,
        settings: &Settings,
        path: &Path,
        date: Option<&str>,
    ) -> anyhow::Result<i32> {
        let logical_ts = parse_logical_date(date)?;
        let pipeline = parse_pipeline_file(path, &settings.pipeline_env())?;
        info!("Pipeline '{}' loaded ({} tasks)", pipeline.name, pipeline.graph.len());

        let state = Arc::new(StateManager::new(&settings.db_path)?);
        let runs = RunManager::new(task_scheduler(settings, &pipeline, state.clone(), None)?)
            .with_state(state);

        let handle = runs.trigger(pipeline.graph.clone(), logical_ts, pipeline.trigger_options())?;
        println!("{}", handle.run_id());
        runs.check_blocked(&handle)?;

        let report = tokio::select! {
            report = runs.await_run(&handle) => report?,
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, cancelling run {}", handle);
                runs.cancel(&handle)?;
                runs.await_run(&handle).await?
            }
        };

        print_report(&report);
        Ok(report.status.exit_code())
    }

    fn validate_pipeline(&self, settings: &Settings, path: &Path) -> anyhow::Result<i32> {
        let pipeline = parse_pipeline_file(path, &settings.pipeline_env())?;

        println!("Pipeline '{}' is valid", pipeline.name);
        println!("Tasks: {}", pipeline.graph.len());
        if let Some(schedule) = &pipeline.schedule {
            println!("Schedule: {}", schedule);
        }
        println!("Execution levels:");
        for (level, tasks) in pipeline.graph.parallel_levels().iter().enumerate() {
            println!("  {}: {}", level, tasks.join(", "));
        }
        Ok(0)
    }

    fn show_status(&self, settings: &Settings, pipeline: Option<&str>, limit: usize) -> anyhow::Result<i32> {
        let state = StateManager::new(&settings.db_path)?;

        let Some(name) = pipeline else {
            let pipelines = state.list_pipelines()?;
            if pipelines.is_empty() {
                println!("No pipelines found");
                return Ok(0);
            }
            println!("{:<30} {:<8} {:<12} {:<20}", "Pipeline", "Runs", "Last status", "Last logical date");
            println!("{}", "-".repeat(72));
            for summary in pipelines {
                println!(
                    "{:<30} {:<8} {:<12} {:<20}",
                    summary.name,
                    summary.total_runs,
                    summary
                        .last_status
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| "-".to_string()),
                    summary
                        .last_logical_ts
                        .map(|ts| ts.to_rfc3339())
                        .unwrap_or_else(|| "never".to_string()),
                );
            }
            return Ok(0);
        };

        let history = state.get_run_history(name, limit)?;
        if history.is_empty() {
            println!("No runs found for pipeline '{}'", name);
            return Ok(0);
        }

        for record in history {
            println!("Run {}", record.run_id);
            println!("  Status: {}", record.status);
            println!("  Started: {}", record.started_at);
            if let Some(completed) = record.completed_at {
                let seconds = completed.signed_duration_since(record.started_at).num_seconds();
                println!("  Duration: {}", format_duration(seconds));
            }
            if let Some(run) = state.load_run(&RunHandle::new(name, record.logical_ts))? {
                let mut instances: Vec<_> = run.instances.values().collect();
                instances.sort_by(|a, b| a.task_id.cmp(&b.task_id));
                for instance in instances {
                    println!(
                        "    - {} [{}] (attempts: {})",
                        instance.task_id, instance.state, instance.attempts
                    );
                }
            }
            println!();
        }
        Ok(0)
    }

    fn show_logs(
        &self,
        settings: &Settings,
        pipeline: &str,
        date: Option<&str>,
        task: Option<&str>,
    ) -> anyhow::Result<i32> {
        let state = StateManager::new(&settings.db_path)?;

        let run_id = match date {
            Some(date) => RunHandle::new(pipeline, parse_logical_date(Some(date))?).run_id(),
            None => match state.get_run_history(pipeline, 1)?.into_iter().next() {
                Some(record) => record.run_id,
                None => {
                    println!("No runs found for pipeline '{}'", pipeline);
                    return Ok(0);
                }
            },
        };

        let attempts: Vec<_> = state
            .get_attempts(&run_id)?
            .into_iter()
            .filter(|row| task.map_or(true, |t| row.task_id == t))
            .collect();

        println!("Run {}", run_id);
        if attempts.is_empty() {
            println!("No attempts recorded");
            return Ok(0);
        }

        for row in attempts {
            let seconds = row
                .record
                .finished_at
                .signed_duration_since(row.record.started_at)
                .num_seconds();
            println!(
                "{} attempt {} [{}] {} ({})",
                row.task_id,
                row.record.attempt,
                row.record.outcome,
                row.record.started_at.format("%Y-%m-%d %H:%M:%S"),
                format_duration(seconds)
            );
            if let Some(error) = &row.record.error {
                println!("    {}", error);
            }
        }
        Ok(0)
    }

    async fn serve(&self, settings: &Settings, path: &Path, metrics_port: Option<u16>) -> anyhow::Result<i32> {
        let pipeline = parse_pipeline_file(path, &settings.pipeline_env())?;
        let state = Arc::new(StateManager::new(&settings.db_path)?);

        let metrics = Metrics::new()?;
        metrics.start(metrics_port.unwrap_or(settings.metrics_port)).await?;

        let scheduler = task_scheduler(settings, &pipeline, state.clone(), Some(metrics))?;
        let runs = RunManager::new(scheduler).with_state(state);

        let resumed = runs.resume_interrupted(pipeline.graph.clone(), pipeline.trigger_options())?;
        if !resumed.is_empty() {
            info!("Resumed {} interrupted run(s) of '{}'", resumed.len(), pipeline.name);
        }

        let mut cron = CronScheduler::new(runs).await?;
        cron.add_pipeline(&pipeline).await?;
        cron.start().await?;

        println!("Serving pipeline '{}', press Ctrl+C to stop", pipeline.name);
        tokio::signal::ctrl_c().await?;

        info!("Shutdown requested");
        cron.shutdown().await?;
        Ok(0)
    }

    fn handle_template(
        &self,
        template_type: Option<&TemplateType>,
        output: Option<&PathBuf>,
    ) -> anyhow::Result<i32> {
        let Some(template_type) = template_type else {
            println!("Available templates:\n");
            println!("{:<16} DESCRIPTION", "TYPE");
            println!("{}", "-".repeat(72));
            for info in templates::list_templates() {
                println!("{:<16} {}", info.name, info.description);
            }
            println!();
            println!("Usage: pipewright template --type <TYPE> [-o <FILE>]");
            return Ok(0);
        };

        let content = templates::get_template(template_type.name())
            .ok_or_else(|| anyhow::anyhow!("Unknown template type: {}", template_type.name()))?;

        match output {
            Some(path) => {
                use std::io::Write as _;
                let mut file = std::fs::OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .open(path)
                    .map_err(|e| {
                        if e.kind() == std::io::ErrorKind::AlreadyExists {
                            anyhow::anyhow!("File '{}' already exists", path.display())
                        } else {
                            e.into()
                        }
                    })?;
                file.write_all(content.as_bytes())?;
                println!("Template written to {}", path.display());
            }
            None => print!("{content}"),
        }
        Ok(0)
    }
}

/// Host callbacks from the settings: local commands plus the job API when configured
fn host_callbacks(settings: &Settings) -> anyhow::Result<Arc<dyn TaskCallbacks>> {
    let mut shell = ShellCallbacks::new();
    if let Some(secs) = settings.command_timeout_secs {
        shell = shell.with_default_timeout(Duration::from_secs(secs));
    }
    let jobs = settings
        .job_api_url
        .as_deref()
        .map(HttpJobClient::new)
        .transpose()?;
    Ok(Arc::new(HostCallbacks::new(shell, jobs)))
}

fn task_scheduler(
    settings: &Settings,
    pipeline: &Pipeline,
    state: Arc<StateManager>,
    metrics: Option<Metrics>,
) -> anyhow::Result<TaskScheduler> {
    let mut scheduler = TaskScheduler::new(host_callbacks(settings)?)
        .with_state(state)
        .with_max_parallel(pipeline.defaults.max_parallel)
        .with_fail_fast(pipeline.defaults.fail_fast)
        .with_default_retry(pipeline.default_retry());
    if let Some(metrics) = metrics {
        scheduler = scheduler.with_metrics(metrics);
    }
    Ok(scheduler)
}

/// `YYYY-MM-DD` (midnight UTC) or an RFC 3339 timestamp; today when absent
pub fn parse_logical_date(date: Option<&str>) -> anyhow::Result<DateTime<Utc>> {
    let Some(date) = date else {
        return Ok(Utc::now().date_naive().and_hms_opt(0, 0, 0).unwrap_or_default().and_utc());
    };

    if let Ok(ts) = DateTime::parse_from_rfc3339(date) {
        return Ok(ts.with_timezone(&Utc));
    }
    let day = NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .map_err(|e| anyhow::anyhow!("invalid date '{}' (expected YYYY-MM-DD): {}", date, e))?;
    Ok(day.and_hms_opt(0, 0, 0).unwrap_or_default().and_utc())
}

fn print_report(report: &RunReport) {
    println!("Run {} finished {}", report.handle, report.status);
    println!(
        "  {}/{} tasks succeeded",
        report.success_count(),
        report.instances.len()
    );
    for instance in &report.instances {
        if matches!(instance.state, TaskState::Failed | TaskState::UpstreamFailed) {
            println!(
                "  - {} [{}] after {} attempt(s): {}",
                instance.task_id,
                instance.state,
                instance.attempts,
                instance.last_error.as_deref().unwrap_or("-")
            );
        }
    }
    if !report.failed_tasks.is_empty() {
        println!("  root cause: {}", report.failed_tasks.join(", "));
    }
}

fn format_duration(seconds: i64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h {}m {}s", seconds / 3600, (seconds % 3600) / 60, seconds % 60)
    }
}
