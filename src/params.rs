//! Task parameter substitution
//!
//! Two narrow grammars are supported:
//!
//! - `${NAME}` is an environment reference, resolved once when the pipeline
//!   is loaded (see [`resolve_env`]).
//! - `{{ ds }}`, `{{ ds_nodash }}` and `{{ ts }}` are run placeholders,
//!   rendered once per run before dispatch (see [`render`]).
//!
//! Both functions are pure.

use crate::error::{PipewrightError, Result};
use crate::models::TaskParams;
use chrono::{DateTime, SecondsFormat, Utc};
use std::collections::BTreeMap;

/// Placeholder names accepted inside `{{ }}`
pub const PLACEHOLDERS: &[&str] = &["ds", "ds_nodash", "ts"];

fn expand(name: &str, logical_ts: DateTime<Utc>) -> Option<String> {
    match name {
        "ds" => Some(logical_ts.format("%Y-%m-%d").to_string()),
        "ds_nodash" => Some(logical_ts.format("%Y%m%d").to_string()),
        "ts" => Some(logical_ts.to_rfc3339_opts(SecondsFormat::Secs, true)),
        _ => None,
    }
}

/// Render run placeholders in `template`.
///
/// # Example
///
/// ```
/// use chrono::{TimeZone, Utc};
/// use pipewright::params::render;
///
/// let ts = Utc.with_ymd_and_hms(2022, 1, 11, 0, 0, 0).unwrap();
/// let key = render("raw/movie_review/{{ ds }}/movie.csv", ts)?;
/// assert_eq!(key, "raw/movie_review/2022-01-11/movie.csv");
/// # Ok::<(), pipewright::error::PipewrightError>(())
/// ```
pub fn render(template: &str, logical_ts: DateTime<Utc>) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find("}}").ok_or_else(|| {
            PipewrightError::Validation(format!("Unterminated placeholder in '{}'", template))
        })?;
        let name = after[..end].trim();
        let value = expand(name, logical_ts).ok_or_else(|| {
            PipewrightError::Validation(format!(
                "Unknown placeholder '{{{{ {} }}}}' in '{}' (expected one of {:?})",
                name, template, PLACEHOLDERS
            ))
        })?;
        out.push_str(&value);
        rest = &after[end + 2..];
    }

    out.push_str(rest);
    Ok(out)
}

/// Check that every placeholder in `template` is known and terminated
pub fn validate_template(template: &str) -> Result<()> {
    render(template, DateTime::<Utc>::default()).map(|_| ())
}

/// Render every parameter value for one run
pub fn render_params(params: &TaskParams, logical_ts: DateTime<Utc>) -> Result<TaskParams> {
    params
        .iter()
        .map(|(k, v)| Ok((k.clone(), render(v, logical_ts)?)))
        .collect()
}

/// Replace `${NAME}` references with values from `env`.
///
/// Names are matched case-insensitively. A reference with no value is an
/// error, so a pipeline never starts with a half-resolved parameter.
pub fn resolve_env(value: &str, env: &BTreeMap<String, String>) -> Result<String> {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find('}').ok_or_else(|| {
            PipewrightError::Validation(format!("Unterminated environment reference in '{}'", value))
        })?;
        let name = after[..end].trim();
        let resolved = env.get(&name.to_lowercase()).ok_or_else(|| {
            PipewrightError::Validation(format!("Environment value '{}' is not set", name))
        })?;
        out.push_str(resolved);
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    Ok(out)
}
