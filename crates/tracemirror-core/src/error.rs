//! Error types for tracemirror-core

use thiserror::Error;

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for tracemirror-core
#[derive(Error, Debug)]
pub enum Error {
    /// Remote trace-analytics provider errors
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    /// Local store errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Sync scheduler errors
    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    /// Configuration errors (fatal at startup only)
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Forecast engine errors
    #[error("Forecast error: {0}")]
    Forecast(#[from] ForecastError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors from the remote trace-analytics provider.
///
/// The split between `Transient` and `Permanent` drives the sync loop's
/// retry decision; `CircuitOpen` is produced by the client wrapper, never
/// by a provider itself.
#[derive(Error, Debug)]
pub enum RemoteError {
    /// Retryable failure: network error, timeout, or 5xx response.
    #[error("transient remote failure: {message}")]
    Transient {
        /// HTTP status code when the failure came from a response.
        status: Option<u16>,
        /// Human-readable description.
        message: String,
    },

    /// Non-retryable failure: the request itself is wrong (4xx).
    #[error("permanent remote failure (status {status}): {message}")]
    Permanent {
        /// HTTP status code.
        status: u16,
        /// Human-readable description.
        message: String,
    },

    /// The circuit breaker refused the call without invoking the provider.
    #[error("circuit open; retry after {retry_after_ms}ms")]
    CircuitOpen {
        /// Milliseconds until the breaker will allow a trial call.
        retry_after_ms: u64,
    },

    /// The remote call exceeded its bounded timeout.
    #[error("remote call timed out after {0}ms")]
    Timeout(u64),

    /// The provider responded but the body could not be decoded.
    #[error("invalid remote response: {0}")]
    InvalidResponse(String),
}

impl RemoteError {
    /// Whether the sync loop should retry this failure with backoff.
    ///
    /// Timeouts count the same as any other transient failure; a
    /// `CircuitOpen` refusal is never retried (the breaker already
    /// rate-limits the dependency).
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transient { .. } | Self::Timeout(_) => true,
            Self::Permanent { .. } | Self::CircuitOpen { .. } | Self::InvalidResponse(_) => false,
        }
    }
}

/// Errors from the local SQLite mirror.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Underlying SQLite error.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Schema creation or migration failed.
    #[error("schema error: {0}")]
    Schema(String),

    /// A requested row does not exist.
    #[error("not found: {0}")]
    NotFound(String),
}

/// Errors from the sync scheduler.
#[derive(Error, Debug)]
pub enum SchedulerError {
    /// A cycle for this collection is already in flight; the request is
    /// rejected, never queued.
    #[error("sync already running for collection `{collection}`")]
    AlreadyRunning {
        /// Collection whose running flag is held.
        collection: String,
    },

    /// The scheduler has been told to stop; no new cycles start.
    #[error("scheduler is shutting down")]
    ShuttingDown,

    /// The collection is not configured for syncing.
    #[error("unknown collection `{0}`")]
    UnknownCollection(String),

    /// Boot-time configuration failed; the sync subsystem is permanently
    /// unavailable for this process.
    #[error("sync subsystem unavailable: {0}")]
    Unavailable(String),
}

/// Configuration errors. Fatal at startup only: the host process keeps
/// running, with the sync subsystem marked unavailable.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Remote provider credentials are missing.
    #[error("missing remote provider credentials ({0})")]
    MissingCredentials(String),

    /// A config value is out of range or malformed.
    #[error("invalid config: {0}")]
    Invalid(String),

    /// The config file could not be read.
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// The config file could not be parsed.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Errors from the forecast engine.
#[derive(Error, Debug)]
pub enum ForecastError {
    /// Not enough mirrored history to produce a forecast.
    #[error("insufficient history: have {have_hours}h, need {need_hours}h")]
    InsufficientHistory {
        /// Hours of history available.
        have_hours: u64,
        /// Hours of history required.
        need_hours: u64,
    },

    /// The underlying series read failed.
    #[error("history read failed: {0}")]
    History(String),
}
