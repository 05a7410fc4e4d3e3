//! Configuration management for tracemirror
//!
//! Handles loading and validation of tracemirror.toml configuration files.
//! Validation failures are fatal at startup only: callers are expected to
//! construct the scheduler in unavailable mode rather than crash the host.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Remote provider settings
    #[serde(default)]
    pub remote: RemoteConfig,

    /// Sync scheduler settings
    #[serde(default)]
    pub sync: SyncConfig,

    /// Retry policy settings
    #[serde(default)]
    pub retry: RetryConfig,

    /// Circuit breaker settings
    #[serde(default)]
    pub breaker: BreakerConfig,

    /// Forecast engine settings
    #[serde(default)]
    pub forecast: ForecastConfig,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Database file path
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            db_path: default_db_path(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_db_path() -> String {
    "~/.local/share/tracemirror/mirror.db".to_string()
}

/// Remote trace-analytics provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Base URL of the provider API
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// API key. Empty means unconfigured; the sync subsystem disables
    /// itself and downstream reads report degraded mode.
    #[serde(default)]
    pub api_key: String,

    /// Per-request timeout in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Page size for paginated pulls
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: String::new(),
            request_timeout_ms: default_request_timeout_ms(),
            page_size: default_page_size(),
        }
    }
}

impl RemoteConfig {
    /// Bounded per-request timeout.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

fn default_base_url() -> String {
    "https://cloud.tracelens.dev".to_string()
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_page_size() -> u32 {
    100
}

/// Sync scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Interval between scheduled cycles, in seconds
    #[serde(default = "default_sync_interval_secs")]
    pub interval_secs: u64,

    /// Collections to mirror (e.g. "traces", "meetings")
    #[serde(default = "default_collections")]
    pub collections: Vec<String>,

    /// Retention period for mirrored records, in days
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_sync_interval_secs(),
            collections: default_collections(),
            retention_days: default_retention_days(),
        }
    }
}

impl SyncConfig {
    /// Interval between scheduled cycles.
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

fn default_sync_interval_secs() -> u64 {
    300
}

fn default_collections() -> Vec<String> {
    vec!["traces".to_string()]
}

fn default_retention_days() -> u32 {
    90
}

/// Retry policy configuration for page fetches
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Initial delay before the first retry, in milliseconds
    #[serde(default = "default_retry_initial_ms")]
    pub initial_delay_ms: u64,

    /// Maximum delay between retries, in milliseconds
    #[serde(default = "default_retry_max_ms")]
    pub max_delay_ms: u64,

    /// Maximum attempts per page (including the first)
    #[serde(default = "default_retry_attempts")]
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_retry_initial_ms(),
            max_delay_ms: default_retry_max_ms(),
            max_attempts: default_retry_attempts(),
        }
    }
}

fn default_retry_initial_ms() -> u64 {
    200
}

fn default_retry_max_ms() -> u64 {
    5_000
}

fn default_retry_attempts() -> u32 {
    3
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Cooldown before a half-open trial, in seconds
    #[serde(default = "default_recovery_timeout_secs")]
    pub recovery_timeout_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_secs: default_recovery_timeout_secs(),
        }
    }
}

impl BreakerConfig {
    /// Cooldown before a half-open trial.
    #[must_use]
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_secs)
    }
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout_secs() -> u64 {
    60
}

/// Forecast engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForecastConfig {
    /// Trailing days of history feeding the hour-of-day baseline
    #[serde(default = "default_trailing_days")]
    pub trailing_days: u32,

    /// Minimum hours of history before forecasting is attempted
    #[serde(default = "default_min_history_hours")]
    pub min_history_hours: u64,

    /// Capacity threshold above which scale-up is recommended (traces/hour)
    #[serde(default = "default_scale_up_threshold")]
    pub scale_up_threshold: f64,

    /// Capacity threshold below which scale-down is recommended (traces/hour)
    #[serde(default = "default_scale_down_threshold")]
    pub scale_down_threshold: f64,
}

impl Default for ForecastConfig {
    fn default() -> Self {
        Self {
            trailing_days: default_trailing_days(),
            min_history_hours: default_min_history_hours(),
            scale_up_threshold: default_scale_up_threshold(),
            scale_down_threshold: default_scale_down_threshold(),
        }
    }
}

fn default_trailing_days() -> u32 {
    14
}

fn default_min_history_hours() -> u64 {
    48
}

fn default_scale_up_threshold() -> f64 {
    500.0
}

fn default_scale_down_threshold() -> f64 {
    50.0
}

impl Config {
    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&raw)?;
        Ok(config)
    }

    /// Validate the configuration for use by the sync subsystem.
    ///
    /// A validation failure does not abort the host process; the caller
    /// constructs the scheduler in unavailable mode and every downstream
    /// read reports degraded results.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.remote.api_key.trim().is_empty() {
            return Err(ConfigError::MissingCredentials("remote.api_key".to_string()));
        }
        if self.remote.base_url.trim().is_empty() {
            return Err(ConfigError::Invalid("remote.base_url is empty".to_string()));
        }
        if self.sync.collections.is_empty() {
            return Err(ConfigError::Invalid(
                "sync.collections must name at least one collection".to_string(),
            ));
        }
        if self.sync.interval_secs == 0 {
            return Err(ConfigError::Invalid("sync.interval_secs must be > 0".to_string()));
        }
        if self.remote.page_size == 0 {
            return Err(ConfigError::Invalid("remote.page_size must be > 0".to_string()));
        }
        if self.forecast.scale_down_threshold >= self.forecast.scale_up_threshold {
            return Err(ConfigError::Invalid(
                "forecast.scale_down_threshold must be below scale_up_threshold".to_string(),
            ));
        }
        Ok(())
    }
}
