//! Prometheus metrics for runs and task attempts
//!
//! # Available Metrics
//!
//! - `pipewright_runs_total{pipeline, status}` - Counter of finished runs
//! - `pipewright_task_attempts_total{pipeline, task, outcome}` - Counter of task attempts
//! - `pipewright_task_duration_seconds{pipeline, task}` - Histogram of dispatch durations
//! - `pipewright_active_runs` - Gauge of runs currently executing
//! - `pipewright_active_tasks` - Gauge of tasks currently dispatched
//!
//! `serve` exposes them at `/metrics`.
//!
//! # Example
//!
//! ```no_run
//! use pipewright::metrics::Metrics;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let metrics = Metrics::new()?;
//! metrics.start(9090).await?;
//!
//! metrics.record_run("user_behaviour", "success");
//! metrics.record_attempt("user_behaviour", "extract", "success");
//! # Ok(())
//! # }
//! ```

use prometheus::{
    CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

/// Histogram bucket boundaries for task duration metrics (in seconds)
const TASK_DURATION_BUCKETS: &[f64] = &[1.0, 5.0, 30.0, 60.0, 300.0, 900.0, 3600.0, 21600.0];

/// Metric registry shared by schedulers of every run
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,
    runs: CounterVec,
    task_attempts: CounterVec,
    task_duration: HistogramVec,
    active_runs: Gauge,
    active_tasks: Gauge,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let runs = CounterVec::new(
            Opts::new("pipewright_runs_total", "Total number of finished runs"),
            &["pipeline", "status"],
        )?;

        let task_attempts = CounterVec::new(
            Opts::new(
                "pipewright_task_attempts_total",
                "Total number of task attempts",
            ),
            &["pipeline", "task", "outcome"],
        )?;

        let task_duration = HistogramVec::new(
            HistogramOpts::new(
                "pipewright_task_duration_seconds",
                "Task dispatch duration in seconds, retries included",
            )
            .buckets(TASK_DURATION_BUCKETS.to_vec()),
            &["pipeline", "task"],
        )?;

        let active_runs = Gauge::with_opts(Opts::new("pipewright_active_runs", "Active runs"))?;
        let active_tasks = Gauge::with_opts(Opts::new("pipewright_active_tasks", "Active tasks"))?;

        registry.register(Box::new(runs.clone()))?;
        registry.register(Box::new(task_attempts.clone()))?;
        registry.register(Box::new(task_duration.clone()))?;
        registry.register(Box::new(active_runs.clone()))?;
        registry.register(Box::new(active_tasks.clone()))?;

        Ok(Self {
            registry: Arc::new(registry),
            runs,
            task_attempts,
            task_duration,
            active_runs,
            active_tasks,
        })
    }

    /// Serve `/metrics` on 127.0.0.1:`port` from a background task
    pub async fn start(&self, port: u16) -> anyhow::Result<()> {
        let addr = format!("127.0.0.1:{}", port);
        let listener = TcpListener::bind(&addr).await?;
        info!("Metrics server listening on http://{}/metrics", addr);

        let metrics = self.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _addr)) => {
                        let metrics = metrics.clone();
                        tokio::spawn(async move {
                            if let Err(e) = metrics.handle_request(stream).await {
                                error!("Error handling metrics request: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Error accepting connection: {}", e);
                    }
                }
            }
        });

        Ok(())
    }

    async fn handle_request(&self, mut stream: tokio::net::TcpStream) -> anyhow::Result<()> {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let mut buffer = [0; 1024];
        let n = stream.read(&mut buffer).await?;
        let request = String::from_utf8_lossy(&buffer[..n]);

        if request.starts_with("GET /metrics") {
            let body = self.render()?;
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\n\r\n{}",
                body.len(),
                body
            );
            stream.write_all(response.as_bytes()).await?;
        } else {
            let response = "HTTP/1.1 404 Not Found\r\nContent-Length: 9\r\n\r\nNot Found";
            stream.write_all(response.as_bytes()).await?;
        }

        Ok(())
    }

    /// Current metrics in the Prometheus text format
    pub fn render(&self) -> anyhow::Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }

    pub fn record_run(&self, pipeline: &str, status: &str) {
        self.runs.with_label_values(&[pipeline, status]).inc();
    }

    pub fn record_attempt(&self, pipeline: &str, task: &str, outcome: &str) {
        self.task_attempts
            .with_label_values(&[pipeline, task, outcome])
            .inc();
    }

    pub fn observe_task_duration(&self, pipeline: &str, task: &str, duration_secs: f64) {
        self.task_duration
            .with_label_values(&[pipeline, task])
            .observe(duration_secs);
    }

    pub fn inc_active_runs(&self) {
        self.active_runs.inc();
    }

    pub fn dec_active_runs(&self) {
        self.active_runs.dec();
    }

    pub fn inc_active_tasks(&self) {
        self.active_tasks.inc();
    }

    pub fn dec_active_tasks(&self) {
        self.active_tasks.dec();
    }
}
