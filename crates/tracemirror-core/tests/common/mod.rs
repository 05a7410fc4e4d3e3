//! Shared test helpers: a scriptable in-process provider and record
//! builders used across the integration suites.

#![allow(dead_code)]

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use tracemirror_core::error::RemoteError;
use tracemirror_core::records::{CostRecord, RecordOrigin, TraceRecord, TraceStatus};
use tracemirror_core::remote::{TracePage, TraceProvider};

/// Build a trace record with sensible defaults.
pub fn make_trace(id: &str, ts: DateTime<Utc>, status: TraceStatus) -> TraceRecord {
    TraceRecord {
        id: id.to_string(),
        name: "summarize_meeting".to_string(),
        status,
        started_at: Some(ts),
        ended_at: Some(ts + chrono::Duration::milliseconds(500)),
        duration_ms: Some(500.0),
        metadata: serde_json::Map::new(),
        error_message: None,
        origin: RecordOrigin::Remote,
        project: Some("meeting-notes".to_string()),
    }
}

/// Build a cost record for a trace.
pub fn make_cost(trace_id: &str, ts: DateTime<Utc>, usd: f64) -> CostRecord {
    CostRecord {
        trace_id: trace_id.to_string(),
        model: "gpt-4o-mini".to_string(),
        input_tokens: 1000,
        output_tokens: 200,
        total_cost: usd,
        recorded_at: ts,
    }
}

/// Provider serving a fixed page sequence, with optional scripted
/// failures and an optional gate that holds a fetch open until released.
///
/// Cursors are page indices rendered as strings: page 0 is served for a
/// `None` cursor, page N for cursor `"N"`.
pub struct ScriptedProvider {
    pages: Vec<TracePage>,
    /// Page index that always fails with a transient error.
    fail_at: Option<usize>,
    /// When set, every fetch waits here before returning.
    gate: Option<Arc<Notify>>,
    calls: AtomicU32,
}

impl ScriptedProvider {
    pub fn new(pages: Vec<TracePage>) -> Self {
        Self {
            pages,
            fail_at: None,
            gate: None,
            calls: AtomicU32::new(0),
        }
    }

    /// Script page `index` to always fail with a transient error.
    #[must_use]
    pub fn failing_at(mut self, index: usize) -> Self {
        self.fail_at = Some(index);
        self
    }

    /// Hold every fetch until the returned gate is notified.
    #[must_use]
    pub fn gated(mut self, gate: Arc<Notify>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Total fetches served (including failures).
    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Build a page holding the given records, chained to the next index.
    pub fn page(records: Vec<TraceRecord>, next: Option<usize>) -> TracePage {
        TracePage {
            records,
            costs: Vec::new(),
            next_cursor: next.map(|n| n.to_string()),
        }
    }
}

impl TraceProvider for ScriptedProvider {
    fn list(
        &self,
        _collection: &str,
        cursor: Option<&str>,
        _page_size: u32,
    ) -> Pin<Box<dyn Future<Output = Result<TracePage, RemoteError>> + Send + '_>> {
        let index = cursor.map_or(0, |c| c.parse::<usize>().unwrap_or(0));
        let gate = self.gate.clone();
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = gate {
                gate.notified().await;
            }
            if self.fail_at == Some(index) {
                return Err(RemoteError::Transient {
                    status: Some(503),
                    message: format!("scripted failure at page {index}"),
                });
            }
            Ok(self.pages.get(index).cloned().unwrap_or_default())
        })
    }
}

/// Provider that always fails with a transient error.
pub struct AlwaysDownProvider;

impl TraceProvider for AlwaysDownProvider {
    fn list(
        &self,
        _collection: &str,
        _cursor: Option<&str>,
        _page_size: u32,
    ) -> Pin<Box<dyn Future<Output = Result<TracePage, RemoteError>> + Send + '_>> {
        Box::pin(async {
            Err(RemoteError::Transient {
                status: Some(503),
                message: "provider down".to_string(),
            })
        })
    }
}
