//! Structured logging for tracemirror
//!
//! Uses `tracing` with configurable output formats. Initialize once at
//! startup; the `RUST_LOG` environment variable overrides the configured
//! level.
//!
//! # Correlation Fields
//!
//! Use these field names consistently in spans and events:
//! - `collection`: Sync collection identifier
//! - `trace_id`: Mirrored trace identifier
//! - `circuit`: Circuit breaker name
//! - `source`: Data source (local/remote/all)

use std::io;
use std::path::PathBuf;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, EnvFilter};

/// Global flag to track if logging has been initialized
static LOGGING_INITIALIZED: OnceLock<bool> = OnceLock::new();

/// Output format for log events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-friendly output for interactive use.
    #[default]
    Pretty,
    /// Machine-parseable JSON lines for CI/ops.
    Json,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level filter (trace, debug, info, warn, error).
    /// Can be overridden by the RUST_LOG environment variable.
    pub level: String,

    /// Output format (pretty or json)
    pub format: LogFormat,

    /// Optional path to a log file; when set, logs go there instead of
    /// stderr.
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            file: None,
        }
    }
}

/// Error type for logging initialization
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("logging already initialized")]
    AlreadyInitialized,

    #[error("failed to create log file: {0}")]
    FileCreate(#[from] io::Error),
}

/// Initialize the global tracing subscriber.
///
/// Returns [`LogError::AlreadyInitialized`] on a second call; callers who
/// don't care (tests) can ignore the error.
pub fn init_logging(config: &LogConfig) -> Result<(), LogError> {
    if LOGGING_INITIALIZED.get().is_some() {
        return Err(LogError::AlreadyInitialized);
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.clone()));

    let result = match (&config.file, config.format) {
        (Some(path), format) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            let builder = fmt()
                .with_env_filter(filter)
                .with_writer(std::sync::Arc::new(file))
                .with_ansi(false);
            match format {
                LogFormat::Json => builder.json().try_init(),
                LogFormat::Pretty => builder.try_init(),
            }
        }
        (None, LogFormat::Json) => fmt()
            .with_env_filter(filter)
            .with_writer(io::stderr)
            .json()
            .try_init(),
        (None, LogFormat::Pretty) => fmt()
            .with_env_filter(filter)
            .with_writer(io::stderr)
            .try_init(),
    };

    if result.is_err() {
        return Err(LogError::AlreadyInitialized);
    }
    let _ = LOGGING_INITIALIZED.set(true);
    Ok(())
}
