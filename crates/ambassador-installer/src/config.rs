//! Controller configuration
//!
//! Intervals come from the environment as Go-style durations (`5m`, `1h30m`,
//! `1.5h`, `300s`). Environment access goes through [`EnvSource`] so tests do
//! not touch process state.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use crate::values::DEFAULT_VALUES_FILES;

/// Poll interval override
pub const CHECK_INTERVAL_ENV: &str = "AMB_CHECK_INTERVAL";

/// Minimum time between two update checks of a deployed release
pub const UPDATE_INTERVAL_ENV: &str = "AMB_UPDATE_INTERVAL";

/// Default poll interval
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Default update interval
pub const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Deadline for chart retrieval and install/upgrade/reconcile
pub const DEFAULT_UPDATE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Deadline for uninstalling a release
pub const DEFAULT_DELETE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Helm repository used when the spec names none
pub const DEFAULT_REPO_URL: &str = "https://www.getambassador.io";

/// Chart installed from the repository
pub const DEFAULT_CHART_NAME: &str = "ambassador";

/// Read access to environment variables
#[cfg_attr(test, mockall::automock)]
pub trait EnvSource: Send + Sync {
    /// Value of the variable, if set
    fn var(&self, name: &str) -> Option<String>;
}

/// [`EnvSource`] backed by the process environment
#[derive(Clone, Copy, Debug, Default)]
pub struct OsEnv;

impl EnvSource for OsEnv {
    fn var(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
}

/// Tunables of the installation controller
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Requeue interval after every retryable outcome
    pub check_interval: Duration,
    /// Minimum time between update checks of a deployed release
    pub update_interval: Duration,
    /// Deadline for chart retrieval and release operations
    pub update_timeout: Duration,
    /// Deadline for uninstalls
    pub delete_timeout: Duration,
    /// Values files merged under `spec.helmValues`
    pub values_files: Vec<PathBuf>,
    /// Repository used when `spec.helmRepo` is unset
    pub default_repo_url: String,
    /// Chart name looked up in the repository index
    pub chart_name: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            check_interval: DEFAULT_CHECK_INTERVAL,
            update_interval: DEFAULT_UPDATE_INTERVAL,
            update_timeout: DEFAULT_UPDATE_TIMEOUT,
            delete_timeout: DEFAULT_DELETE_TIMEOUT,
            values_files: DEFAULT_VALUES_FILES.iter().map(PathBuf::from).collect(),
            default_repo_url: DEFAULT_REPO_URL.to_string(),
            chart_name: DEFAULT_CHART_NAME.to_string(),
        }
    }
}

impl ControllerConfig {
    /// Configuration from the process environment
    pub fn from_env() -> Self {
        Self::from_source(&OsEnv)
    }

    /// Configuration from an arbitrary environment
    ///
    /// Unparsable or zero durations are logged and the default is kept.
    pub fn from_source(env: &dyn EnvSource) -> Self {
        let defaults = Self::default();
        Self {
            check_interval: interval_from(env, CHECK_INTERVAL_ENV, defaults.check_interval),
            update_interval: interval_from(env, UPDATE_INTERVAL_ENV, defaults.update_interval),
            ..defaults
        }
    }
}

fn interval_from(env: &dyn EnvSource, name: &str, default: Duration) -> Duration {
    let Some(raw) = env.var(name).filter(|v| !v.trim().is_empty()) else {
        return default;
    };
    match parse_go_duration(&raw) {
        Ok(d) if !d.is_zero() => d,
        Ok(_) => {
            warn!(variable = name, value = %raw, "ignoring zero interval");
            default
        }
        Err(e) => {
            warn!(variable = name, value = %raw, error = %e, "ignoring invalid interval");
            default
        }
    }
}

/// A duration string could not be parsed
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid duration {input:?}")]
pub struct DurationError {
    /// The offending input
    pub input: String,
}

/// Parse a Go duration (`300ms`, `1.5h`, `2h45m`)
///
/// Negative durations are rejected.
pub fn parse_go_duration(input: &str) -> Result<Duration, DurationError> {
    let invalid = || DurationError {
        input: input.to_string(),
    };

    let s = input.trim();
    let s = s.strip_prefix('+').unwrap_or(s);
    if s == "0" {
        return Ok(Duration::ZERO);
    }
    if s.is_empty() {
        return Err(invalid());
    }

    let mut total_nanos: f64 = 0.0;
    let mut rest = s;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(invalid)?;
        let (number, tail) = rest.split_at(number_len);
        if number.is_empty() || number == "." {
            return Err(invalid());
        }
        let value: f64 = number.parse().map_err(|_| invalid())?;

        let unit_len = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        let (unit, tail) = tail.split_at(unit_len);
        let scale = match unit {
            "ns" => 1.0,
            "us" | "µs" | "μs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60.0 * 1e9,
            "h" => 3600.0 * 1e9,
            _ => return Err(invalid()),
        };

        total_nanos += value * scale;
        rest = tail;
    }

    if !total_nanos.is_finite() || total_nanos > u64::MAX as f64 {
        return Err(invalid());
    }
    Ok(Duration::from_nanos(total_nanos.round() as u64))
}
