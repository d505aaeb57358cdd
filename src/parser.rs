//! Pipeline YAML parsing and validation
//!
//! [`parse_pipeline_yaml`] checks the document on its own: limits, names,
//! per-kind fields. [`build_pipeline`] then resolves `${NAME}` references
//! against a [`PipelineEnv`], checks run placeholders, loads step documents
//! and builds the [`TaskGraph`]. Graph-shape problems (cycles, dangling
//! `depends_on`, bad `submit_task`) surface there as graph definition errors.

use crate::dag::{Edge, TaskGraph};
use crate::error::{PipewrightError, Result};
use crate::models::*;
use crate::params::{resolve_env, validate_template};
use crate::retry::RetryPolicy;
use crate::run_manager::TriggerOptions;
use crate::settings::PipelineEnv;
use std::collections::HashSet;
use std::fs;
use std::path::{Component, Path};
use std::sync::Arc;
use std::time::Duration;

const MAX_PARALLEL_LIMIT: usize = 256;

/// A validated pipeline, ready to trigger
#[derive(Debug, Clone)]
pub struct Pipeline {
    pub name: String,
    pub description: Option<String>,
    pub schedule: Option<String>,
    pub defaults: PipelineDefaults,
    pub graph: Arc<TaskGraph>,
}

impl Pipeline {
    /// Retry policy for tasks that do not override it
    pub fn default_retry(&self) -> RetryPolicy {
        self.defaults.retry.apply_to(&RetryPolicy::default())
    }

    pub fn trigger_options(&self) -> TriggerOptions {
        TriggerOptions {
            concurrency: self.defaults.concurrency,
            depends_on_past: self.defaults.depends_on_past,
        }
    }
}

/// Load, validate and build the pipeline at `path`.
///
/// `steps_file` entries are resolved relative to the directory holding the
/// pipeline file.
///
/// # Example
///
/// ```no_run
/// use pipewright::parser::parse_pipeline_file;
/// use pipewright::settings::PipelineEnv;
///
/// let env: PipelineEnv = [("data_bucket", "user-analytics")].into_iter().collect();
/// let pipeline = parse_pipeline_file("user_behaviour.yaml", &env)?;
/// println!("{} has {} tasks", pipeline.name, pipeline.graph.len());
/// # Ok::<(), pipewright::error::PipewrightError>(())
/// ```
pub fn parse_pipeline_file<P: AsRef<Path>>(path: P, env: &PipelineEnv) -> Result<Pipeline> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)?;
    let config = parse_pipeline_yaml(&content)?;
    let base_dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    build_pipeline(config, env, base_dir)
}

/// Parse and validate a pipeline document.
///
/// # Errors
///
/// * `PipewrightError::YamlSizeExceeded` - content larger than 1MB
/// * `PipewrightError::YamlParse` - malformed YAML or unknown task type
/// * `PipewrightError::TaskCountExceeded` - more than 1,000 tasks
/// * `PipewrightError::InvalidTaskName` / `TaskNameTooLong` - bad names
/// * `PipewrightError::DuplicateTaskId` - two tasks with the same name
/// * `PipewrightError::Validation` - bad limits, schedule or per-kind fields
///
/// # Example
///
/// ```
/// use pipewright::parser::parse_pipeline_yaml;
///
/// let yaml = r#"
/// name: nightly
/// tasks:
///   - name: start
///     type: no_op
///   - name: finish
///     type: no_op
///     depends_on: [start]
/// "#;
///
/// let config = parse_pipeline_yaml(yaml)?;
/// assert_eq!(config.tasks.len(), 2);
/// # Ok::<(), pipewright::error::PipewrightError>(())
/// ```
pub fn parse_pipeline_yaml(content: &str) -> Result<PipelineConfig> {
    if content.len() > MAX_YAML_SIZE {
        return Err(PipewrightError::YamlSizeExceeded(content.len()));
    }

    let config: PipelineConfig = serde_yaml::from_str(content)?;

    validate_task_name(&config.name)?;

    if config.tasks.len() > MAX_TASK_COUNT {
        return Err(PipewrightError::TaskCountExceeded {
            count: config.tasks.len(),
            limit: MAX_TASK_COUNT,
        });
    }

    let mut seen = HashSet::with_capacity(config.tasks.len());
    for task in &config.tasks {
        validate_task_name(&task.name)?;
        if !seen.insert(task.name.as_str()) {
            return Err(PipewrightError::DuplicateTaskId(task.name.clone()));
        }
        validate_kind_fields(task)?;
    }

    if config.config.max_parallel == 0 {
        return Err(PipewrightError::Validation(
            "max_parallel must be at least 1".to_string(),
        ));
    }
    if config.config.max_parallel > MAX_PARALLEL_LIMIT {
        return Err(PipewrightError::Validation(format!(
            "max_parallel must be at most {}",
            MAX_PARALLEL_LIMIT
        )));
    }

    if let Some(schedule) = &config.schedule {
        validate_schedule(schedule)?;
    }

    Ok(config)
}

/// Turn a parsed document into a [`Pipeline`].
pub fn build_pipeline(config: PipelineConfig, env: &PipelineEnv, base_dir: &Path) -> Result<Pipeline> {
    let default_retry = config.config.retry.apply_to(&RetryPolicy::default());

    let mut tasks = Vec::with_capacity(config.tasks.len());
    let mut edges = Vec::new();

    for task_config in &config.tasks {
        let mut params = TaskParams::new();
        for (key, value) in &task_config.params {
            let resolved = resolve_env(value, env.as_map())
                .and_then(|v| validate_template(&v).map(|_| v))
                .map_err(|e| in_param(&task_config.name, key, e))?;
            params.insert(key.clone(), resolved);
        }

        for upstream in &task_config.depends_on {
            edges.push(Edge::new(upstream.clone(), task_config.name.clone()));
        }
        // A wait task always runs after the submit task it watches
        if let Some(submit) = &task_config.submit_task {
            edges.push(Edge::new(submit.clone(), task_config.name.clone()));
        }

        let mut task = Task::new(task_config.name.clone(), task_kind(task_config, env, base_dir)?);
        task.params = params;
        task.retry = task_config
            .retry
            .as_ref()
            .map(|settings| settings.apply_to(&default_retry));
        tasks.push(task);
    }

    let graph = TaskGraph::build(config.name.clone(), tasks, &edges)?;

    Ok(Pipeline {
        name: config.name,
        description: config.description,
        schedule: config.schedule,
        defaults: config.config,
        graph: Arc::new(graph),
    })
}

fn in_param(task: &str, key: &str, err: PipewrightError) -> PipewrightError {
    let detail = match err {
        PipewrightError::Validation(msg) => msg,
        other => other.to_string(),
    };
    PipewrightError::Validation(format!("Task '{}', parameter '{}': {}", task, key, detail))
}

/// Task and pipeline names: 1..=64 chars of alphanumerics, `_` and `-`
fn validate_task_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(PipewrightError::InvalidTaskName {
            name: name.to_string(),
        });
    }

    if name.len() > MAX_TASK_NAME_LEN {
        return Err(PipewrightError::TaskNameTooLong {
            name: name.to_string(),
            max: MAX_TASK_NAME_LEN,
        });
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(PipewrightError::InvalidTaskName {
            name: name.to_string(),
        });
    }

    Ok(())
}

/// Seconds-first cron: 6 fields, or 7 with a year
fn validate_schedule(schedule: &str) -> Result<()> {
    let fields = schedule.split_whitespace().count();
    if !(6..=7).contains(&fields) {
        return Err(PipewrightError::Validation(format!(
            "schedule '{}' must have 6 or 7 fields (sec min hour day month weekday [year]), found {}",
            schedule, fields
        )));
    }
    Ok(())
}

fn validate_kind_fields(task: &TaskConfig) -> Result<()> {
    let invalid = |msg: &str| {
        Err(PipewrightError::Validation(format!(
            "Task '{}' ({:?}): {}",
            task.name, task.task_type, msg
        )))
    };

    let has_steps = task.steps.is_some() || task.steps_file.is_some();
    if task.steps.is_some() && task.steps_file.is_some() {
        return invalid("set either steps or steps_file, not both");
    }
    if task.poll_interval == Some(0) {
        return invalid("poll_interval must be positive");
    }
    if task.timeout == Some(0) {
        return invalid("timeout must be positive");
    }

    match task.task_type {
        TaskType::ExternalJobSubmit => {
            if !has_steps {
                return invalid("steps or steps_file is required");
            }
            if task.submit_task.is_some() || task.poll_interval.is_some() || task.timeout.is_some() {
                return invalid("submit_task, poll_interval and timeout only apply to external_job_wait");
            }
        }
        TaskType::ExternalJobWait => match (&task.submit_task, has_steps) {
            (Some(_), true) => return invalid("set either submit_task or steps, not both"),
            (None, false) => return invalid("submit_task or steps is required"),
            _ => {}
        },
        TaskType::DataTransfer | TaskType::ExternalQuery | TaskType::NoOp => {
            if has_steps
                || task.submit_task.is_some()
                || task.poll_interval.is_some()
                || task.timeout.is_some()
            {
                return invalid("step and polling fields only apply to external job tasks");
            }
        }
    }

    Ok(())
}

fn task_kind(task: &TaskConfig, env: &PipelineEnv, base_dir: &Path) -> Result<TaskKind> {
    let required_steps = || {
        load_steps(task, env, base_dir)?.ok_or_else(|| {
            PipewrightError::Validation(format!("Task '{}' has no step definition", task.name))
        })
    };

    Ok(match task.task_type {
        TaskType::DataTransfer => TaskKind::DataTransfer,
        TaskType::ExternalQuery => TaskKind::ExternalQuery,
        TaskType::NoOp => TaskKind::NoOp,
        TaskType::ExternalJobSubmit => TaskKind::ExternalJobSubmit {
            steps: required_steps()?,
        },
        TaskType::ExternalJobWait => {
            let source = match &task.submit_task {
                Some(submit) => WaitSource::Upstream(submit.clone()),
                None => WaitSource::Submit(required_steps()?),
            };
            TaskKind::ExternalJobWait {
                source,
                poll_interval: task
                    .poll_interval
                    .map(Duration::from_secs)
                    .unwrap_or(DEFAULT_POLL_INTERVAL),
                timeout: task
                    .timeout
                    .map(Duration::from_secs)
                    .unwrap_or(DEFAULT_EXTERNAL_TIMEOUT),
            }
        }
    })
}

/// Inline `steps` or the JSON document at `steps_file`, with `${NAME}`
/// references resolved in every string.
fn load_steps(task: &TaskConfig, env: &PipelineEnv, base_dir: &Path) -> Result<Option<StepDefinition>> {
    let document = match (&task.steps, &task.steps_file) {
        (Some(inline), _) => inline.clone(),
        (None, Some(file)) => {
            validate_relative_path(file)?;
            let content = fs::read_to_string(base_dir.join(file))?;
            if content.len() > MAX_STEP_DOCUMENT_SIZE {
                return Err(PipewrightError::Validation(format!(
                    "steps_file '{}' of task '{}' exceeds {} bytes",
                    file, task.name, MAX_STEP_DOCUMENT_SIZE
                )));
            }
            serde_json::from_str(&content)?
        }
        (None, None) => return Ok(None),
    };

    if !document.is_array() {
        return Err(PipewrightError::Validation(format!(
            "step definition of task '{}' must be a JSON array",
            task.name
        )));
    }

    let resolved = resolve_env_in_json(document, env)
        .map_err(|e| in_param(&task.name, "steps", e))?;
    Ok(Some(StepDefinition(resolved)))
}

fn resolve_env_in_json(value: serde_json::Value, env: &PipelineEnv) -> Result<serde_json::Value> {
    use serde_json::Value;

    Ok(match value {
        Value::String(s) => Value::String(resolve_env(&s, env.as_map())?),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| resolve_env_in_json(item, env))
                .collect::<Result<_>>()?,
        ),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| Ok((k, resolve_env_in_json(v, env)?)))
                .collect::<Result<_>>()?,
        ),
        other => other,
    })
}

fn validate_relative_path(path: &str) -> Result<()> {
    if Path::new(path)
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(PipewrightError::Validation(format!(
            "steps_file '{}' must not contain '..'",
            path
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ConcurrencyPolicy;
    use crate::retry::Backoff;
    use crate::templates::get_template;

    fn env() -> PipelineEnv {
        [
            ("data_bucket", "user-analytics"),
            ("script_bucket", "user-analytics-scripts"),
            ("job_flow_id", "j-2AXXXXXXGAPLF"),
        ]
        .into_iter()
        .collect()
    }

    fn build(yaml: &str) -> Result<Pipeline> {
        build_pipeline(parse_pipeline_yaml(yaml)?, &env(), Path::new("."))
    }

    #[test]
    fn test_parse_user_behaviour_pipeline() {
        let pipeline = build(get_template("user-behaviour").unwrap()).unwrap();

        assert_eq!(pipeline.name, "user_behaviour");
        assert_eq!(pipeline.graph.len(), 9);
        assert!(pipeline.trigger_options().depends_on_past);

        let submit = pipeline
            .graph
            .task("start_emr_movie_classification_script")
            .unwrap();
        let TaskKind::ExternalJobSubmit { steps } = &submit.kind else {
            panic!("expected submit kind");
        };
        assert_eq!(steps.step_count(), 3);
        assert!(steps.0.to_string().contains("s3://user-analytics/raw/movie_review"));
        assert_eq!(
            submit.params.get("job_flow_id").map(String::as_str),
            Some("j-2AXXXXXXGAPLF")
        );
        // env resolved at load, run placeholders left for the run
        assert_eq!(
            submit.params.get("input").map(String::as_str),
            Some("s3://user-analytics/raw/movie_review/{{ ds }}/movie.csv")
        );

        let wait = pipeline
            .graph
            .task("wait_for_movie_classification_transformation")
            .unwrap();
        assert_eq!(
            wait.kind,
            TaskKind::ExternalJobWait {
                source: WaitSource::Upstream("start_emr_movie_classification_script".into()),
                poll_interval: Duration::from_secs(30),
                timeout: Duration::from_secs(7200),
            }
        );

        let joins = pipeline.graph.predecessors("generate_user_behavior_metric");
        assert_eq!(joins.len(), 2);
    }

    #[test]
    fn test_defaults_and_task_retry_overlay() {
        let yaml = r#"
name: retries
config:
  concurrency: reject
  retry:
    max_retries: 4
    backoff: exponential
tasks:
  - name: a
    type: no_op
  - name: b
    type: no_op
    depends_on: [a]
    retry:
      max_retries: 0
"#;
        let pipeline = build(yaml).unwrap();
        assert_eq!(pipeline.defaults.max_parallel, 4);
        assert_eq!(pipeline.trigger_options().concurrency, ConcurrencyPolicy::Reject);

        let default_retry = pipeline.default_retry();
        assert_eq!(default_retry.max_retries, 4);
        assert_eq!(default_retry.backoff, Backoff::Exponential);

        assert!(pipeline.graph.task("a").unwrap().retry.is_none());
        let b_retry = pipeline.graph.task("b").unwrap().retry.clone().unwrap();
        assert_eq!(b_retry.max_retries, 0);
        assert_eq!(b_retry.backoff, Backoff::Exponential);
    }

    #[test]
    fn test_yaml_size_limit() {
        let large = "name: big\ntasks:\n".to_string() + &"  - name: x\n".repeat(100_000);
        assert!(matches!(
            parse_pipeline_yaml(&large),
            Err(PipewrightError::YamlSizeExceeded(_))
        ));
    }

    #[test]
    fn test_task_count_limit() {
        let mut yaml = "name: many\ntasks:\n".to_string();
        for i in 0..=MAX_TASK_COUNT {
            yaml.push_str(&format!("  - name: t{}\n    type: no_op\n", i));
        }
        assert!(matches!(
            parse_pipeline_yaml(&yaml),
            Err(PipewrightError::TaskCountExceeded { .. })
        ));
    }

    #[test]
    fn test_task_name_validation() {
        assert!(validate_task_name("load_user-purchase_1").is_ok());
        assert!(matches!(
            validate_task_name("has space"),
            Err(PipewrightError::InvalidTaskName { .. })
        ));
        assert!(matches!(
            validate_task_name(""),
            Err(PipewrightError::InvalidTaskName { .. })
        ));
        assert!(matches!(
            validate_task_name(&"a".repeat(65)),
            Err(PipewrightError::TaskNameTooLong { .. })
        ));
    }

    #[test]
    fn test_duplicate_task_rejected() {
        let yaml = r#"
name: dup
tasks:
  - name: a
    type: no_op
  - name: a
    type: no_op
"#;
        let err = parse_pipeline_yaml(yaml).unwrap_err();
        assert!(matches!(err, PipewrightError::DuplicateTaskId(ref id) if id == "a"));
        assert!(err.is_graph_definition());
    }

    #[test]
    fn test_graph_errors_surface_from_build() {
        let cycle = r#"
name: loop
tasks:
  - name: a
    type: no_op
    depends_on: [b]
  - name: b
    type: no_op
    depends_on: [a]
"#;
        assert!(matches!(build(cycle), Err(PipewrightError::CycleDetected(_))));

        let dangling = r#"
name: dangling
tasks:
  - name: a
    type: no_op
    depends_on: [ghost]
"#;
        assert!(matches!(
            build(dangling),
            Err(PipewrightError::DanglingEdge { ref missing, .. }) if missing == "ghost"
        ));

        let wrong_submit = r#"
name: wrong_submit
tasks:
  - name: a
    type: no_op
  - name: wait
    type: external_job_wait
    submit_task: a
"#;
        assert!(matches!(
            build(wrong_submit),
            Err(PipewrightError::InvalidTaskReference { .. })
        ));
    }

    #[test]
    fn test_kind_field_validation() {
        let submit_without_steps = r#"
name: p
tasks:
  - name: submit
    type: external_job_submit
"#;
        assert!(matches!(
            parse_pipeline_yaml(submit_without_steps),
            Err(PipewrightError::Validation(msg)) if msg.contains("required")
        ));

        let no_op_with_timeout = r#"
name: p
tasks:
  - name: noop
    type: no_op
    timeout: 30
"#;
        assert!(parse_pipeline_yaml(no_op_with_timeout).is_err());

        let wait_with_both = r#"
name: p
tasks:
  - name: wait
    type: external_job_wait
    submit_task: other
    steps: [{"Name": "x"}]
"#;
        assert!(parse_pipeline_yaml(wait_with_both).is_err());

        let zero_interval = r#"
name: p
tasks:
  - name: wait
    type: external_job_wait
    steps: [{"Name": "x"}]
    poll_interval: 0
"#;
        assert!(parse_pipeline_yaml(zero_interval).is_err());
    }

    #[test]
    fn test_wait_with_own_steps_submits() {
        let yaml = r#"
name: p
tasks:
  - name: wait
    type: external_job_wait
    params:
      job_flow_id: "${job_flow_id}"
    steps:
      - Name: run once
"#;
        let pipeline = build(yaml).unwrap();
        let TaskKind::ExternalJobWait { source, poll_interval, timeout } =
            &pipeline.graph.task("wait").unwrap().kind
        else {
            panic!("expected wait kind");
        };
        assert!(matches!(source, WaitSource::Submit(steps) if steps.step_count() == 1));
        assert_eq!(*poll_interval, DEFAULT_POLL_INTERVAL);
        assert_eq!(*timeout, DEFAULT_EXTERNAL_TIMEOUT);
    }

    #[test]
    fn test_unresolved_env_and_unknown_placeholder() {
        let missing_env = r#"
name: p
tasks:
  - name: copy
    type: data_transfer
    params:
      target: "s3://${missing_bucket}/x"
"#;
        let err = build(missing_env).unwrap_err();
        assert!(matches!(err, PipewrightError::Validation(ref msg)
            if msg.contains("copy") && msg.contains("missing_bucket")));

        let unknown_placeholder = r#"
name: p
tasks:
  - name: copy
    type: data_transfer
    params:
      target: "s3://bucket/{{ yesterday }}/x"
"#;
        assert!(matches!(
            build(unknown_placeholder),
            Err(PipewrightError::Validation(msg)) if msg.contains("yesterday")
        ));
    }

    #[test]
    fn test_max_parallel_and_schedule_limits() {
        let zero = "name: p\nconfig:\n  max_parallel: 0\ntasks:\n  - name: a\n    type: no_op\n";
        assert!(parse_pipeline_yaml(zero).is_err());

        let huge = "name: p\nconfig:\n  max_parallel: 257\ntasks:\n  - name: a\n    type: no_op\n";
        assert!(parse_pipeline_yaml(huge).is_err());

        let five_field = "name: p\nschedule: \"0 0 * * *\"\ntasks:\n  - name: a\n    type: no_op\n";
        assert!(matches!(
            parse_pipeline_yaml(five_field),
            Err(PipewrightError::Validation(msg)) if msg.contains("6 or 7 fields")
        ));
    }

    #[test]
    fn test_steps_file_loaded_relative_to_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("steps")).unwrap();
        fs::write(
            dir.path().join("steps/classify.json"),
            r#"[{"Name": "copy", "Args": ["--src=s3://${data_bucket}/raw"]}, {"Name": "classify"}]"#,
        )
        .unwrap();
        let pipeline_path = dir.path().join("pipeline.yaml");
        fs::write(
            &pipeline_path,
            r#"
name: from_file
tasks:
  - name: submit
    type: external_job_submit
    steps_file: steps/classify.json
"#,
        )
        .unwrap();

        let pipeline = parse_pipeline_file(&pipeline_path, &env()).unwrap();
        let TaskKind::ExternalJobSubmit { steps } = &pipeline.graph.task("submit").unwrap().kind
        else {
            panic!("expected submit kind");
        };
        assert_eq!(steps.step_count(), 2);
        assert_eq!(steps.0[0]["Args"][0], "--src=s3://user-analytics/raw");
    }

    #[test]
    fn test_steps_file_rejects_traversal_and_non_arrays() {
        assert!(validate_relative_path("steps/a.json").is_ok());
        assert!(validate_relative_path("../secrets.json").is_err());

        let object_steps = r#"
name: p
tasks:
  - name: submit
    type: external_job_submit
    steps:
      Name: not a list
"#;
        assert!(matches!(
            build(object_steps),
            Err(PipewrightError::Validation(msg)) if msg.contains("JSON array")
        ));
    }
}
