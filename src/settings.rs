//! Process settings and the pipeline environment
//!
//! Settings are layered with the `config` crate: an optional settings file
//! (`pipewright.toml`, `.yaml` or `.json` in the working directory, or the
//! path given with `--config`), then `PIPEWRIGHT_*` environment variables.
//! Nested keys use a double underscore, so `PIPEWRIGHT_ENV__DATA_BUCKET`
//! sets `env.data_bucket`.

use crate::error::Result;
use crate::logging::LogFormat;
use config::{Config, Environment, File};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

const DEFAULT_SETTINGS_FILE: &str = "pipewright";
const ENV_PREFIX: &str = "PIPEWRIGHT";

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default)]
    pub log_level: Option<String>,
    #[serde(default)]
    pub log_format: Option<LogFormat>,
    /// Base URL of the REST job API used by submit and wait tasks
    #[serde(default)]
    pub job_api_url: Option<String>,
    /// Default timeout for local transfer and query commands
    #[serde(default)]
    pub command_timeout_secs: Option<u64>,
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
    /// Values for `${NAME}` references in pipeline parameters
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("pipewright.db")
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            log_level: None,
            log_format: None,
            job_api_url: None,
            command_timeout_secs: None,
            metrics_port: default_metrics_port(),
            env: BTreeMap::new(),
        }
    }
}

impl Settings {
    /// Load settings from `path` (required when given) or the default
    /// settings file (optional), overlaid with `PIPEWRIGHT_*` variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => File::from(path).required(true),
            None => File::with_name(DEFAULT_SETTINGS_FILE).required(false),
        };

        let settings = Config::builder()
            .add_source(file)
            .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?
            .try_deserialize()?;
        Ok(settings)
    }

    pub fn pipeline_env(&self) -> PipelineEnv {
        self.env.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }
}

/// Immutable name/value table for `${NAME}` references.
///
/// Built once per process and handed to the parser; names are
/// case-insensitive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineEnv {
    values: BTreeMap<String, String>,
}

impl PipelineEnv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(&name.to_lowercase()).map(String::as_str)
    }

    pub fn as_map(&self) -> &BTreeMap<String, String> {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for PipelineEnv {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let values = iter
            .into_iter()
            .map(|(k, v)| (k.into().to_lowercase(), v.into()))
            .collect();
        Self { values }
    }
}
