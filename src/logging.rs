//! Process-wide `tracing` subscriber setup.
//!
//! Library code only emits events; binaries call [`init`] once at startup. `RUST_LOG`
//! takes precedence over the configured level.

use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::error::{DaqError, DaqResult};

/// Output format of log lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable, colored when writing to a terminal.
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
}

/// Build the filter: `RUST_LOG` if set, otherwise `level` for this crate and `warn` for
/// everything else.
pub fn filter(level: &str) -> DaqResult<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(format!("warn,daq_model={level},daq_modeld={level}"))
        .map_err(|e| DaqError::Config(format!("invalid log level '{level}': {e}")))
}

/// Install the global subscriber.
///
/// # Errors
/// [`DaqError::Config`] for an invalid level or if a global subscriber is already set.
pub fn init(level: &str, format: LogFormat) -> DaqResult<()> {
    let filter = filter(level)?;
    let registry = tracing_subscriber::registry().with(filter);
    let result = match format {
        LogFormat::Pretty => registry.with(fmt::layer().with_target(true)).try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_current_span(true))
            .try_init(),
    };
    result.map_err(|e| DaqError::Config(format!("logging already initialized: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_serde() {
        let format: LogFormat = serde_json::from_str("\"json\"").unwrap();
        assert_eq!(format, LogFormat::Json);
        assert_eq!(LogFormat::default(), LogFormat::Pretty);
    }

    #[test]
    fn test_second_init_fails() {
        // the first call may lose against another test's subscriber; the second never wins
        let _ = init("info", LogFormat::Pretty);
        assert!(init("info", LogFormat::Json).is_err());
    }
}
