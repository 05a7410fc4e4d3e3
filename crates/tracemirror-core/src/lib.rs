//! tracemirror-core: Core library for tracemirror
//!
//! This crate provides the resilient telemetry layer behind the LLM trace
//! dashboard: a circuit-breaker-guarded client for the remote
//! trace-analytics provider, a background scheduler that mirrors remote
//! trace/cost records into a local SQLite store, a multi-source metrics
//! aggregator that degrades gracefully, and a forecasting engine built on
//! the mirrored history.
//!
//! # Architecture
//!
//! ```text
//! SyncScheduler → RemoteTelemetryClient (circuit-breaker-guarded)
//!                        ↓
//!                  LocalStore (idempotent upsert)
//!                        ↓
//!                MetricsAggregator (local + optional live remote)
//!                        ↓
//!                  ForecastEngine → dashboard layer (external)
//! ```
//!
//! # Modules
//!
//! - `circuit_breaker`: Failure isolation for remote calls
//! - `remote`: Provider trait, HTTP provider, breaker-guarded client
//! - `store`: SQLite mirror (upsert-by-id, range queries, sync state)
//! - `scheduler`: Background sync cycles with non-overlap and shutdown
//! - `aggregator`: Unified metrics, dense series, degraded fallback
//! - `forecast`: Seasonal-naive load forecasts and scaling advice
//! - `retry`: Exponential backoff for transient remote failures
//! - `records`: Trace/cost/sync-state data model
//! - `config`: TOML configuration with startup validation
//! - `logging`: tracing-subscriber setup
//!
//! # Safety
//!
//! This crate forbids unsafe code.

pub mod aggregator;
pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod forecast;
pub mod logging;
pub mod records;
pub mod remote;
pub mod retry;
pub mod scheduler;
pub mod store;

pub use error::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_set() {
        assert!(!VERSION.is_empty());
    }
}
