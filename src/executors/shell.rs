//! Local process adapter for data-transfer and external-query tasks
//!
//! Parameters understood:
//!
//! - `command` (required): absolute path of the program to run
//! - `args`: whitespace-separated argument list, with no quoting; pass text
//!   containing spaces (SQL, messages) as its own parameter instead
//! - `workdir`: working directory
//! - `timeout_secs`: kill the process after this many seconds
//!
//! Every other parameter is exported to the process as
//! `PIPEWRIGHT_PARAM_<KEY>` (upper-cased), so scripts receive the rendered
//! task parameters (bucket names, object keys, SQL text) without shell
//! interpolation.

use crate::models::TaskParams;
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

const RESERVED_PARAMS: &[&str] = &["command", "args", "workdir", "timeout_secs"];
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3600);

/// Runs one local command per task attempt
#[derive(Debug, Clone)]
pub struct ShellCallbacks {
    default_timeout: Duration,
}

impl ShellCallbacks {
    pub fn new() -> Self {
        Self {
            default_timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Run the command described by `params`; non-zero exit is an error.
    pub async fn run(&self, params: &TaskParams) -> anyhow::Result<()> {
        let command = params
            .get("command")
            .ok_or_else(|| anyhow::anyhow!("missing 'command' parameter"))?;
        if !Path::new(command).is_absolute() {
            anyhow::bail!("command must be an absolute path: {}", command);
        }

        let timeout = match params.get("timeout_secs") {
            Some(secs) => Duration::from_secs(
                secs.parse()
                    .map_err(|_| anyhow::anyhow!("invalid timeout_secs '{}'", secs))?,
            ),
            None => self.default_timeout,
        };

        let mut cmd = Command::new(command);
        if let Some(args) = params.get("args") {
            cmd.args(args.split_whitespace());
        }
        if let Some(workdir) = params.get("workdir") {
            cmd.current_dir(workdir);
        }
        for (key, value) in params {
            if !RESERVED_PARAMS.contains(&key.as_str()) {
                cmd.env(format!("PIPEWRIGHT_PARAM_{}", key.to_uppercase()), value);
            }
        }

        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        // The child dies with the future on timeout or cancellation.
        cmd.kill_on_drop(true);

        info!("Executing command: {}", command);
        debug!("Command args: {:?}", params.get("args"));

        let output = tokio::time::timeout(timeout, cmd.output())
            .await
            .map_err(|_| {
                anyhow::anyhow!("command timed out after {} seconds", timeout.as_secs())
            })??;

        let (stdout, _) = super::truncate_output_bytes(&output.stdout);
        let (stderr, stderr_truncated) = super::truncate_output_bytes(&output.stderr);
        if !stdout.is_empty() {
            debug!("stdout: {}", stdout.trim_end());
        }

        if output.status.success() {
            Ok(())
        } else {
            if stderr_truncated {
                warn!("stderr truncated");
            }
            anyhow::bail!(
                "command exited with {:?}: {}",
                output.status.code(),
                stderr.trim()
            )
        }
    }
}

impl Default for ShellCallbacks {
    fn default() -> Self {
        Self::new()
    }
}
