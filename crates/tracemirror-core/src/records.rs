//! Data model for mirrored telemetry records
//!
//! Trace and cost records flow from the remote provider through the sync
//! cycle into the local store, and back out through the aggregator. Sync
//! state is the per-collection bookkeeping row the scheduler persists
//! between cycles.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum per-cycle errors retained in a collection's sync state.
pub const MAX_SYNC_ERRORS: usize = 20;

/// Outcome classification of a traced operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceStatus {
    Success,
    Error,
    Unknown,
}

impl fmt::Display for TraceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Error => write!(f, "error"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

impl FromStr for TraceStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "success" | "ok" | "completed" => Ok(Self::Success),
            "error" | "failed" | "failure" => Ok(Self::Error),
            _ => Ok(Self::Unknown),
        }
    }
}

/// Where a record was first observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordOrigin {
    /// Produced by this process (instrumented locally).
    Local,
    /// Mirrored from the remote provider.
    Remote,
}

impl fmt::Display for RecordOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Remote => write!(f, "remote"),
        }
    }
}

/// A single mirrored LLM call trace.
///
/// The id is unique per origin; re-syncing the same external id must
/// upsert, never duplicate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceRecord {
    /// Unique id (the provider's external id for remote records).
    pub id: String,
    /// Operation name (e.g. "summarize_meeting").
    pub name: String,
    /// Outcome of the traced operation.
    pub status: TraceStatus,
    /// Start timestamp.
    pub started_at: Option<DateTime<Utc>>,
    /// End timestamp.
    pub ended_at: Option<DateTime<Utc>>,
    /// Wall-clock duration in milliseconds, when the provider reports one.
    pub duration_ms: Option<f64>,
    /// Free-form metadata attached by the instrumented caller.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    /// Error message for failed operations.
    pub error_message: Option<String>,
    /// Where the record was first observed.
    pub origin: RecordOrigin,
    /// Owning project or operation reference.
    pub project: Option<String>,
}

impl TraceRecord {
    /// Duration in milliseconds, computing from timestamps when the
    /// provider did not report one.
    #[must_use]
    pub fn duration_or_computed(&self) -> Option<f64> {
        if self.duration_ms.is_some() {
            return self.duration_ms;
        }
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => {
                let ms = (end - start).num_milliseconds();
                (ms >= 0).then(|| ms as f64)
            }
            _ => None,
        }
    }
}

/// Token pricing for a model family (USD per 1M tokens).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TokenPricing {
    /// Input token cost per 1M tokens (USD)
    pub input_per_million: f64,
    /// Output token cost per 1M tokens (USD)
    pub output_per_million: f64,
}

impl TokenPricing {
    /// Create new pricing
    #[must_use]
    pub const fn new(input_per_million: f64, output_per_million: f64) -> Self {
        Self {
            input_per_million,
            output_per_million,
        }
    }

    /// Calculate cost for given token counts
    #[must_use]
    pub fn calculate(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        let input_cost = (input_tokens as f64 / 1_000_000.0) * self.input_per_million;
        let output_cost = (output_tokens as f64 / 1_000_000.0) * self.output_per_million;
        input_cost + output_cost
    }

    /// Approximate pricing for common model families.
    ///
    /// Unknown models fall back to a conservative mid-range rate so the
    /// dashboard never shows zero spend for a billed call.
    #[must_use]
    pub fn for_model(model: &str) -> Self {
        const MODEL_PRICING: &[(&[&str], f64, f64)] = &[
            (&["gpt-4o-mini"], 0.15, 0.60),
            (&["gpt-4o", "gpt-4-turbo"], 2.50, 10.00),
            (&["gpt-4"], 10.00, 30.00),
            (&["gpt-3.5"], 0.50, 1.50),
            (&["gemini-1.5-pro", "gemini-pro"], 1.25, 5.00),
            (&["gemini-1.5-flash", "gemini-flash"], 0.075, 0.30),
            (&["claude-3-opus", "claude-opus"], 15.00, 75.00),
            (&["claude-3-5-sonnet", "claude-3-sonnet", "claude-sonnet"], 3.00, 15.00),
            (&["claude-3-haiku", "claude-haiku"], 0.25, 1.25),
        ];
        let lower = model.to_lowercase();
        MODEL_PRICING
            .iter()
            .find(|(patterns, _, _)| patterns.iter().any(|p| lower.contains(p)))
            .map_or(Self::new(1.00, 3.00), |(_, input, output)| {
                Self::new(*input, *output)
            })
    }
}

/// Cost attribution for a single LLM call.
///
/// Soft reference to the owning trace; orphan cleanup is not required.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostRecord {
    /// Id of the owning [`TraceRecord`].
    pub trace_id: String,
    /// Model name as reported by the provider.
    pub model: String,
    /// Input (prompt) token count.
    pub input_tokens: u64,
    /// Output (completion) token count.
    pub output_tokens: u64,
    /// Total cost in USD.
    pub total_cost: f64,
    /// When the call was billed.
    pub recorded_at: DateTime<Utc>,
}

impl CostRecord {
    /// Build a cost record, computing the cost from the pricing table when
    /// the provider did not report one.
    #[must_use]
    pub fn with_computed_cost(
        trace_id: impl Into<String>,
        model: impl Into<String>,
        input_tokens: u64,
        output_tokens: u64,
        reported_cost: Option<f64>,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        let model = model.into();
        let total_cost = reported_cost.unwrap_or_else(|| {
            TokenPricing::for_model(&model).calculate(input_tokens, output_tokens)
        });
        Self {
            trace_id: trace_id.into(),
            model,
            input_tokens,
            output_tokens,
            total_cost,
            recorded_at,
        }
    }
}

/// Per-collection sync bookkeeping, persisted between cycles.
///
/// The running flag is deliberately absent: it is process-local state
/// owned by the scheduler, never written to disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncState {
    /// Collection this state belongs to.
    pub collection: String,
    /// Last fully processed cursor (RFC 3339 timestamp or opaque token).
    pub cursor: Option<String>,
    /// When the last cycle finished.
    pub last_synced_at: Option<DateTime<Utc>>,
    /// Duration of the last cycle in milliseconds.
    pub last_duration_ms: Option<u64>,
    /// Errors from the last cycle, capped at [`MAX_SYNC_ERRORS`].
    #[serde(default)]
    pub last_errors: Vec<String>,
}

impl SyncState {
    /// Fresh state for a collection that has never synced.
    #[must_use]
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            cursor: None,
            last_synced_at: None,
            last_duration_ms: None,
            last_errors: Vec::new(),
        }
    }

    /// Append an error, dropping the oldest once the cap is reached.
    pub fn push_error(&mut self, error: impl Into<String>) {
        if self.last_errors.len() >= MAX_SYNC_ERRORS {
            self.last_errors.remove(0);
        }
        self.last_errors.push(error.into());
    }
}
