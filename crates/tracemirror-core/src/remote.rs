//! Remote trace-analytics provider client.
//!
//! The sync scheduler and the aggregator's direct-read path both talk to
//! the provider through [`RemoteTelemetryClient`], which routes every call
//! through a shared circuit breaker. A breaker refusal surfaces as a typed
//! [`RemoteFetch::Unavailable`] value so a single open circuit never
//! aborts a whole sync cycle or dashboard read.

use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::circuit_breaker::{CircuitBreakerStatus, SharedCircuitBreaker};
use crate::config::RemoteConfig;
use crate::error::RemoteError;
use crate::records::{CostRecord, RecordOrigin, TraceRecord, TraceStatus};

/// One page of records pulled from the provider.
#[derive(Debug, Clone, Default)]
pub struct TracePage {
    /// Trace records in this page.
    pub records: Vec<TraceRecord>,
    /// Cost records riding along with the traces.
    pub costs: Vec<CostRecord>,
    /// Cursor for the next page; `None` when this page is the last.
    pub next_cursor: Option<String>,
}

impl TracePage {
    /// Whether the page carries no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.costs.is_empty()
    }
}

/// Abstract paginated pull interface over the remote provider.
///
/// Object-safe via boxed futures so the client can hold any provider
/// behind `Box<dyn TraceProvider>` (the tests script one in-process).
pub trait TraceProvider: Send + Sync {
    /// Fetch one page of records at or after `cursor`.
    fn list(
        &self,
        collection: &str,
        cursor: Option<&str>,
        page_size: u32,
    ) -> Pin<Box<dyn Future<Output = Result<TracePage, RemoteError>> + Send + '_>>;
}

// =============================================================================
// HTTP provider
// =============================================================================

/// Wire shape of a trace row as the provider serves it.
#[derive(Debug, Deserialize)]
struct ApiTrace {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    status: Option<String>,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    duration_ms: Option<f64>,
    #[serde(default)]
    metadata: serde_json::Map<String, serde_json::Value>,
    error_message: Option<String>,
    project: Option<String>,
    #[serde(default)]
    costs: Vec<ApiCost>,
}

/// Wire shape of a cost row nested under its trace.
#[derive(Debug, Deserialize)]
struct ApiCost {
    model: String,
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    total_cost: Option<f64>,
    recorded_at: Option<DateTime<Utc>>,
}

/// Wire shape of a page response.
#[derive(Debug, Deserialize)]
struct ApiPage {
    #[serde(default)]
    data: Vec<ApiTrace>,
    next_cursor: Option<String>,
}

impl ApiTrace {
    fn into_records(self) -> (TraceRecord, Vec<CostRecord>) {
        let status = self
            .status
            .as_deref()
            .and_then(|s| TraceStatus::from_str(s).ok())
            .unwrap_or(TraceStatus::Unknown);
        let fallback_ts = self.ended_at.or(self.started_at).unwrap_or_else(Utc::now);

        let costs = self
            .costs
            .into_iter()
            .map(|c| {
                CostRecord::with_computed_cost(
                    self.id.clone(),
                    c.model,
                    c.input_tokens,
                    c.output_tokens,
                    c.total_cost,
                    c.recorded_at.unwrap_or(fallback_ts),
                )
            })
            .collect();

        let record = TraceRecord {
            id: self.id,
            name: self.name,
            status,
            started_at: self.started_at,
            ended_at: self.ended_at,
            duration_ms: self.duration_ms,
            metadata: self.metadata,
            error_message: self.error_message,
            origin: RecordOrigin::Remote,
            project: self.project,
        };
        (record, costs)
    }
}

/// Provider implementation over the hosted trace-analytics HTTP API.
#[derive(Debug)]
pub struct HttpTraceProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    timeout_ms: u64,
}

impl HttpTraceProvider {
    /// Build a provider from the remote config section.
    pub fn new(config: &RemoteConfig) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| RemoteError::Transient {
                status: None,
                message: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            timeout_ms: config.request_timeout_ms,
        })
    }

    async fn fetch_page(
        &self,
        collection: &str,
        cursor: Option<&str>,
        page_size: u32,
    ) -> Result<TracePage, RemoteError> {
        let url = format!("{}/api/public/{collection}", self.base_url);
        let mut request = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .query(&[("limit", page_size.to_string())]);
        if let Some(cursor) = cursor {
            request = request.query(&[("since", cursor)]);
        }

        let response = request.send().await.map_err(|e| classify_send_error(&e, self.timeout_ms))?;

        let status = response.status();
        if !status.is_success() {
            let code = status.as_u16();
            let body = response.text().await.unwrap_or_default();
            let message = if body.is_empty() {
                status.to_string()
            } else {
                body.chars().take(200).collect()
            };
            if code == 429 || status.is_server_error() {
                return Err(RemoteError::Transient {
                    status: Some(code),
                    message,
                });
            }
            return Err(RemoteError::Permanent {
                status: code,
                message,
            });
        }

        let page: ApiPage = response
            .json()
            .await
            .map_err(|e| RemoteError::InvalidResponse(e.to_string()))?;

        let mut records = Vec::with_capacity(page.data.len());
        let mut costs = Vec::new();
        for api_trace in page.data {
            let (record, mut trace_costs) = api_trace.into_records();
            records.push(record);
            costs.append(&mut trace_costs);
        }

        debug!(
            collection,
            records = records.len(),
            costs = costs.len(),
            has_next = page.next_cursor.is_some(),
            "Fetched remote page"
        );

        Ok(TracePage {
            records,
            costs,
            next_cursor: page.next_cursor,
        })
    }
}

fn classify_send_error(e: &reqwest::Error, timeout_ms: u64) -> RemoteError {
    if e.is_timeout() {
        RemoteError::Timeout(timeout_ms)
    } else {
        RemoteError::Transient {
            status: e.status().map(|s| s.as_u16()),
            message: e.to_string(),
        }
    }
}

impl TraceProvider for HttpTraceProvider {
    fn list(
        &self,
        collection: &str,
        cursor: Option<&str>,
        page_size: u32,
    ) -> Pin<Box<dyn Future<Output = Result<TracePage, RemoteError>> + Send + '_>> {
        let collection = collection.to_string();
        let cursor = cursor.map(str::to_string);
        Box::pin(async move { self.fetch_page(&collection, cursor.as_deref(), page_size).await })
    }
}

// =============================================================================
// Breaker-guarded client
// =============================================================================

/// Result of a guarded fetch: either a page, or a typed refusal when the
/// circuit is open.
#[derive(Debug)]
pub enum RemoteFetch {
    /// The provider answered with a page.
    Page(TracePage),
    /// The circuit breaker refused the call; the provider was not invoked.
    Unavailable {
        /// Milliseconds until a trial call will be permitted.
        retry_after_ms: u64,
    },
}

/// Typed client for the remote provider, every call routed through the
/// shared circuit breaker.
pub struct RemoteTelemetryClient {
    provider: Box<dyn TraceProvider>,
    breaker: SharedCircuitBreaker,
}

impl RemoteTelemetryClient {
    /// Wrap a provider with a breaker.
    #[must_use]
    pub fn new(provider: Box<dyn TraceProvider>, breaker: SharedCircuitBreaker) -> Self {
        Self { provider, breaker }
    }

    /// Fetch one page since `cursor`, guarded by the breaker.
    ///
    /// The breaker lock is released before the provider call is awaited
    /// and re-acquired only to record the outcome. Provider failures of
    /// any class count as breaker failures; a refusal is reported as
    /// `Ok(RemoteFetch::Unavailable)` so callers can degrade instead of
    /// aborting.
    pub async fn list_since(
        &self,
        collection: &str,
        cursor: Option<&str>,
        page_size: u32,
    ) -> Result<RemoteFetch, RemoteError> {
        if let Err(refusal) = self.breaker.try_acquire() {
            debug!(
                collection,
                retry_after_ms = refusal.retry_after_ms,
                "Circuit open; skipping remote call"
            );
            return Ok(RemoteFetch::Unavailable {
                retry_after_ms: refusal.retry_after_ms,
            });
        }

        match self.provider.list(collection, cursor, page_size).await {
            Ok(page) => {
                self.breaker.record_success();
                Ok(RemoteFetch::Page(page))
            }
            Err(e) => {
                self.breaker.record_failure();
                warn!(collection, error = %e, "Remote fetch failed");
                Err(e)
            }
        }
    }

    /// Whether the provider is currently reachable as far as the breaker
    /// knows (proxies breaker state; does not issue a probe).
    #[must_use]
    pub fn is_reachable(&self) -> bool {
        self.breaker.would_allow()
    }

    /// Breaker status snapshot for the scheduler/status surfaces.
    #[must_use]
    pub fn breaker_status(&self) -> CircuitBreakerStatus {
        self.breaker.status()
    }
}

impl std::fmt::Debug for RemoteTelemetryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteTelemetryClient")
            .field("breaker", &self.breaker.status().state)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitStateKind};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    /// Provider that fails a configurable number of times, then succeeds.
    struct FlakyProvider {
        failures_remaining: AtomicU32,
    }

    impl TraceProvider for FlakyProvider {
        fn list(
            &self,
            _collection: &str,
            _cursor: Option<&str>,
            _page_size: u32,
        ) -> Pin<Box<dyn Future<Output = Result<TracePage, RemoteError>> + Send + '_>> {
            let remaining = self.failures_remaining.load(Ordering::SeqCst);
            Box::pin(async move {
                if remaining > 0 {
                    self.failures_remaining.fetch_sub(1, Ordering::SeqCst);
                    Err(RemoteError::Transient {
                        status: Some(503),
                        message: "unavailable".to_string(),
                    })
                } else {
                    Ok(TracePage::default())
                }
            })
        }
    }

    fn client_with_failures(failures: u32, threshold: u32) -> RemoteTelemetryClient {
        let breaker = SharedCircuitBreaker::new(CircuitBreaker::with_name(
            "remote_provider",
            CircuitBreakerConfig::new(threshold, Duration::from_secs(60)),
        ));
        RemoteTelemetryClient::new(
            Box::new(FlakyProvider {
                failures_remaining: AtomicU32::new(failures),
            }),
            breaker,
        )
    }

    #[tokio::test]
    async fn failures_trip_the_breaker() {
        let client = client_with_failures(10, 2);

        assert!(client.list_since("traces", None, 50).await.is_err());
        assert!(client.list_since("traces", None, 50).await.is_err());
        assert!(matches!(
            client.breaker_status().state,
            CircuitStateKind::Open
        ));

        // Third call is refused without invoking the provider.
        match client.list_since("traces", None, 50).await {
            Ok(RemoteFetch::Unavailable { retry_after_ms }) => {
                assert!(retry_after_ms > 0);
            }
            other => panic!("expected Unavailable, got {other:?}"),
        }
        assert!(!client.is_reachable());
    }

    #[tokio::test]
    async fn success_keeps_breaker_closed() {
        let client = client_with_failures(0, 2);
        match client.list_since("traces", None, 50).await {
            Ok(RemoteFetch::Page(page)) => assert!(page.is_empty()),
            other => panic!("expected Page, got {other:?}"),
        }
        assert!(client.is_reachable());
    }

    #[test]
    fn api_trace_conversion_fills_costs_and_origin() {
        let raw = serde_json::json!({
            "id": "tr-9",
            "name": "summarize_meeting",
            "status": "completed",
            "started_at": "2026-01-10T12:00:00Z",
            "ended_at": "2026-01-10T12:00:02Z",
            "metadata": {"pipeline": "meeting-notes"},
            "costs": [
                {"model": "gpt-4o-mini", "input_tokens": 1200, "output_tokens": 300}
            ]
        });
        let api_trace: ApiTrace = serde_json::from_value(raw).expect("deserialize");
        let (record, costs) = api_trace.into_records();

        assert_eq!(record.status, TraceStatus::Success);
        assert_eq!(record.origin, RecordOrigin::Remote);
        assert_eq!(record.duration_or_computed(), Some(2000.0));
        assert_eq!(costs.len(), 1);
        assert_eq!(costs[0].trace_id, "tr-9");
        assert!(costs[0].total_cost > 0.0);
    }

    #[test]
    fn api_page_tolerates_missing_fields() {
        let page: ApiPage = serde_json::from_str(r#"{"data": [{"id": "t1"}]}"#).expect("parse");
        assert_eq!(page.data.len(), 1);
        assert!(page.next_cursor.is_none());
    }
}
