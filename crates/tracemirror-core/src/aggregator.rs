//! Multi-source metrics aggregation for the dashboard layer.
//!
//! Merges the local mirror and (optionally) live remote data into unified
//! counters, latency distributions, and dense time-bucketed series.
//! Degrades gracefully: when the remote source is unavailable the result
//! carries `degraded = true` and falls back to local data instead of
//! raising. Dashboard reads always get a structured response.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Duration, DurationRound, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::circuit_breaker::CircuitBreakerStatus;
use crate::records::{CostRecord, TraceRecord, TraceStatus};
use crate::remote::{RemoteFetch, RemoteTelemetryClient};
use crate::store::LocalStore;

/// Valid request window, in hours. Out-of-range values are clamped,
/// never rejected.
pub const MIN_WINDOW_HOURS: u32 = 1;
pub const MAX_WINDOW_HOURS: u32 = 168;

/// Page budget for direct remote reads (the mirror is the primary path;
/// direct reads are bounded so a dashboard request can't pull forever).
const REMOTE_READ_MAX_PAGES: u32 = 10;

/// Which data source a read should consult.
///
/// Resolved once at the call boundary; the merge logic never compares
/// strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
    /// Local mirror only.
    Local,
    /// Live remote query, falling back to local when unavailable.
    Remote,
    /// Merge of both; on duplicate ids the fresher `ended_at` wins.
    All,
}

impl fmt::Display for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Remote => write!(f, "remote"),
            Self::All => write!(f, "all"),
        }
    }
}

impl FromStr for DataSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "remote" => Ok(Self::Remote),
            "all" => Ok(Self::All),
            other => Err(format!("unknown data source `{other}` (expected local|remote|all)")),
        }
    }
}

/// Latency distribution summary in milliseconds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LatencySummary {
    /// Traces with a usable duration.
    pub count: u64,
    pub mean_ms: Option<f64>,
    pub p50_ms: Option<f64>,
    pub p90_ms: Option<f64>,
    pub p95_ms: Option<f64>,
    pub p99_ms: Option<f64>,
    pub max_ms: Option<f64>,
}

/// Unified counters over the requested window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnifiedMetrics {
    /// Window actually used, after clamping.
    pub window_hours: u32,
    /// Source actually consulted.
    pub source: DataSource,
    /// One or more sources were unavailable; results cover a subset.
    pub degraded: bool,
    pub total_traces: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub unknown_count: u64,
    /// Successes over classified traces, in [0,1].
    pub success_rate: f64,
    /// Errors over classified traces, in [0,1].
    pub error_rate: f64,
    pub latency: LatencySummary,
    pub total_cost_usd: f64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    /// Non-fatal problems encountered while gathering.
    pub errors: Vec<String>,
    pub generated_at: DateTime<Utc>,
}

/// One fixed-width bucket of the latency series.
///
/// Empty buckets are present with zero count and `None` latency so
/// callers can assume a dense, regularly spaced series.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeriesBucket {
    pub bucket_start: DateTime<Utc>,
    pub count: u64,
    pub error_count: u64,
    pub mean_latency_ms: Option<f64>,
    pub p95_latency_ms: Option<f64>,
}

/// Dense hourly latency series over the requested window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatencyTimeSeries {
    pub window_hours: u32,
    pub source: DataSource,
    pub degraded: bool,
    pub buckets: Vec<SeriesBucket>,
}

/// Recent traces, newest first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecentTraces {
    pub source: DataSource,
    pub degraded: bool,
    pub traces: Vec<TraceRecord>,
}

/// Health of each data source, for the dashboard status widget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSourceStatus {
    pub local_available: bool,
    pub local_trace_count: u64,
    pub local_cost_count: u64,
    pub remote_configured: bool,
    pub remote_reachable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub breaker: Option<CircuitBreakerStatus>,
    /// True when any source is unavailable.
    pub degraded: bool,
}

/// Records gathered for a window, with degradation bookkeeping.
struct Gathered {
    records: Vec<TraceRecord>,
    costs: Vec<CostRecord>,
    degraded: bool,
    errors: Vec<String>,
}

/// Merges local-store and live-remote data for dashboard consumption.
pub struct MetricsAggregator {
    store: Arc<LocalStore>,
    /// `None` when the remote side never configured; remote/all reads
    /// degrade to local.
    client: Option<Arc<RemoteTelemetryClient>>,
    /// Collection consulted for direct remote reads.
    collection: String,
    page_size: u32,
}

impl MetricsAggregator {
    /// Build an aggregator over the mirror and an optional live client.
    #[must_use]
    pub fn new(
        store: Arc<LocalStore>,
        client: Option<Arc<RemoteTelemetryClient>>,
        collection: impl Into<String>,
        page_size: u32,
    ) -> Self {
        Self {
            store,
            client,
            collection: collection.into(),
            page_size: page_size.max(1),
        }
    }

    /// Clamp a requested window into `[MIN_WINDOW_HOURS, MAX_WINDOW_HOURS]`.
    #[must_use]
    pub fn clamp_hours(hours: u32) -> u32 {
        hours.clamp(MIN_WINDOW_HOURS, MAX_WINDOW_HOURS)
    }

    /// Unified counters + latency distribution over the window.
    pub async fn unified_metrics(&self, hours: u32, source: DataSource) -> UnifiedMetrics {
        let hours = Self::clamp_hours(hours);
        let end = Utc::now();
        let start = end - Duration::hours(i64::from(hours));

        let gathered = self.gather(start, end, source).await;
        let mut metrics = compute_metrics(&gathered.records, &gathered.costs);

        metrics.window_hours = hours;
        metrics.source = source;
        metrics.degraded = gathered.degraded;
        metrics.errors = gathered.errors;
        metrics
    }

    /// Dense hourly latency series over the window.
    pub async fn latency_time_series(&self, hours: u32, source: DataSource) -> LatencyTimeSeries {
        let hours = Self::clamp_hours(hours);
        // Align to hour boundaries so buckets are stable across calls.
        let end = (Utc::now() + Duration::hours(1))
            .duration_trunc(Duration::hours(1))
            .unwrap_or_else(|_| Utc::now());
        let start = end - Duration::hours(i64::from(hours));

        let gathered = self.gather(start, end, source).await;
        let buckets = bucketize(&gathered.records, start, hours);

        LatencyTimeSeries {
            window_hours: hours,
            source,
            degraded: gathered.degraded,
            buckets,
        }
    }

    /// Most recent traces, newest first.
    pub async fn recent_traces(&self, limit: usize, source: DataSource) -> RecentTraces {
        let limit = limit.clamp(1, 1000);
        match source {
            DataSource::Local => {
                let traces = self.store.recent_traces(limit).unwrap_or_else(|e| {
                    warn!(error = %e, "Local recent-traces query failed");
                    Vec::new()
                });
                RecentTraces {
                    source,
                    degraded: false,
                    traces,
                }
            }
            DataSource::Remote | DataSource::All => {
                let end = Utc::now();
                let start = end - Duration::hours(24);
                let gathered = self.gather(start, end, source).await;
                let mut traces = gathered.records;
                traces.sort_by_key(|t| std::cmp::Reverse(t.ended_at.or(t.started_at)));
                traces.truncate(limit);
                RecentTraces {
                    source,
                    degraded: gathered.degraded,
                    traces,
                }
            }
        }
    }

    /// Unclamped local-only hourly series ending at the last complete
    /// hour. Internal feed for the forecast engine, which needs more
    /// trailing history than the dashboard window contract allows.
    pub(crate) fn local_history_series(&self, hours: u32) -> Vec<SeriesBucket> {
        let end = Utc::now()
            .duration_trunc(Duration::hours(1))
            .unwrap_or_else(|_| Utc::now());
        let start = end - Duration::hours(i64::from(hours));
        let gathered = self.gather_local(start, end);
        bucketize(&gathered.records, start, hours)
    }

    /// Health of each data source.
    pub fn data_source_status(&self) -> DataSourceStatus {
        let (local_available, local_trace_count, local_cost_count) =
            match (self.store.trace_count(), self.store.cost_count()) {
                (Ok(traces), Ok(costs)) => (true, traces, costs),
                _ => (false, 0, 0),
            };
        let remote_configured = self.client.is_some();
        let remote_reachable = self.client.as_ref().is_some_and(|c| c.is_reachable());

        DataSourceStatus {
            local_available,
            local_trace_count,
            local_cost_count,
            remote_configured,
            remote_reachable,
            breaker: self.client.as_ref().map(|c| c.breaker_status()),
            degraded: !local_available || !remote_reachable,
        }
    }

    // -- Gathering ------------------------------------------------------------

    async fn gather(&self, start: DateTime<Utc>, end: DateTime<Utc>, source: DataSource) -> Gathered {
        match source {
            DataSource::Local => self.gather_local(start, end),
            DataSource::Remote => {
                let (remote, mut degraded, mut errors) = self.gather_remote(start, end).await;
                match remote {
                    Some(records) => Gathered {
                        records,
                        // Cost attribution always comes from the mirror;
                        // the provider nests costs under traces only on
                        // the sync path.
                        costs: self.local_costs(start, end, &mut errors),
                        degraded,
                        errors,
                    },
                    None => {
                        // Remote unavailable: explicit degraded fallback
                        // to the mirror rather than an error.
                        degraded = true;
                        let mut fallback = self.gather_local(start, end);
                        fallback.degraded = degraded;
                        fallback.errors.append(&mut errors);
                        fallback
                    }
                }
            }
            DataSource::All => {
                let mut local = self.gather_local(start, end);
                let (remote, degraded, mut errors) = self.gather_remote(start, end).await;
                let remote_missing = remote.is_none();
                let records = match remote {
                    Some(remote_records) => merge_freshest(local.records, remote_records),
                    None => local.records,
                };
                local.errors.append(&mut errors);
                Gathered {
                    records,
                    costs: local.costs,
                    degraded: local.degraded || degraded || remote_missing,
                    errors: local.errors,
                }
            }
        }
    }

    fn gather_local(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Gathered {
        let mut errors = Vec::new();
        let records = match self.store.traces_in_range(start, end) {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "Local range query failed");
                errors.push(format!("local traces: {e}"));
                Vec::new()
            }
        };
        let costs = self.local_costs(start, end, &mut errors);
        Gathered {
            records,
            costs,
            degraded: !errors.is_empty(),
            errors,
        }
    }

    fn local_costs(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        errors: &mut Vec<String>,
    ) -> Vec<CostRecord> {
        match self.store.costs_in_range(start, end) {
            Ok(costs) => costs,
            Err(e) => {
                warn!(error = %e, "Local cost query failed");
                errors.push(format!("local costs: {e}"));
                Vec::new()
            }
        }
    }

    /// Direct remote read, bypassing the mirror. Returns `None` when the
    /// remote side is unavailable (unconfigured, circuit open, or failing).
    async fn gather_remote(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> (Option<Vec<TraceRecord>>, bool, Vec<String>) {
        let Some(client) = self.client.as_ref() else {
            return (None, true, vec!["remote source not configured".to_string()]);
        };

        let mut records = Vec::new();
        let mut cursor = Some(start.to_rfc3339());
        let mut errors = Vec::new();

        for _ in 0..REMOTE_READ_MAX_PAGES {
            match client
                .list_since(&self.collection, cursor.as_deref(), self.page_size)
                .await
            {
                Ok(RemoteFetch::Page(page)) => {
                    records.extend(
                        page.records
                            .into_iter()
                            .filter(|r| in_window(r, start, end)),
                    );
                    match page.next_cursor {
                        Some(next) => cursor = Some(next),
                        None => return (Some(records), false, errors),
                    }
                }
                Ok(RemoteFetch::Unavailable { retry_after_ms }) => {
                    debug!(retry_after_ms, "Remote read unavailable (circuit open)");
                    errors.push(format!("remote unavailable; retry after {retry_after_ms}ms"));
                    // A partial pull is unusable for counters: degrade to
                    // local rather than report a truncated window.
                    return (None, true, errors);
                }
                Err(e) => {
                    errors.push(format!("remote read: {e}"));
                    return (None, true, errors);
                }
            }
        }

        debug!(
            pages = REMOTE_READ_MAX_PAGES,
            "Remote read page budget exhausted; truncating window"
        );
        errors.push("remote read truncated at page budget".to_string());
        (Some(records), true, errors)
    }
}

impl std::fmt::Debug for MetricsAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsAggregator")
            .field("collection", &self.collection)
            .field("remote_configured", &self.client.is_some())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Pure helpers
// =============================================================================

fn in_window(record: &TraceRecord, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
    record
        .started_at
        .or(record.ended_at)
        .is_some_and(|ts| ts >= start && ts < end)
}

/// Merge two record sets by id; on duplicates the record with the more
/// recent `ended_at` wins (a missing `ended_at` loses to a present one).
fn merge_freshest(local: Vec<TraceRecord>, remote: Vec<TraceRecord>) -> Vec<TraceRecord> {
    let mut by_id: HashMap<String, TraceRecord> = HashMap::with_capacity(local.len());
    for record in local.into_iter().chain(remote) {
        match by_id.entry(record.id.clone()) {
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(record);
            }
            std::collections::hash_map::Entry::Occupied(mut entry) => {
                if record.ended_at > entry.get().ended_at {
                    entry.insert(record);
                }
            }
        }
    }
    let mut merged: Vec<TraceRecord> = by_id.into_values().collect();
    merged.sort_by_key(|t| t.started_at.or(t.ended_at));
    merged
}

fn compute_metrics(records: &[TraceRecord], costs: &[CostRecord]) -> UnifiedMetrics {
    let total_traces = records.len() as u64;
    let success_count = records
        .iter()
        .filter(|r| r.status == TraceStatus::Success)
        .count() as u64;
    let error_count = records
        .iter()
        .filter(|r| r.status == TraceStatus::Error)
        .count() as u64;
    let unknown_count = total_traces - success_count - error_count;

    let classified = success_count + error_count;
    let (success_rate, error_rate) = if classified == 0 {
        (0.0, 0.0)
    } else {
        (
            success_count as f64 / classified as f64,
            error_count as f64 / classified as f64,
        )
    };

    let durations: Vec<f64> = records
        .iter()
        .filter_map(TraceRecord::duration_or_computed)
        .collect();

    UnifiedMetrics {
        window_hours: 0,
        source: DataSource::Local,
        degraded: false,
        total_traces,
        success_count,
        error_count,
        unknown_count,
        success_rate,
        error_rate,
        latency: summarize_latency(durations),
        total_cost_usd: costs.iter().map(|c| c.total_cost).sum(),
        total_input_tokens: costs.iter().map(|c| c.input_tokens).sum(),
        total_output_tokens: costs.iter().map(|c| c.output_tokens).sum(),
        errors: Vec::new(),
        generated_at: Utc::now(),
    }
}

fn summarize_latency(mut durations: Vec<f64>) -> LatencySummary {
    if durations.is_empty() {
        return LatencySummary::default();
    }
    durations.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let count = durations.len() as u64;
    let mean = durations.iter().sum::<f64>() / durations.len() as f64;

    LatencySummary {
        count,
        mean_ms: Some(mean),
        p50_ms: Some(percentile(&durations, 50.0)),
        p90_ms: Some(percentile(&durations, 90.0)),
        p95_ms: Some(percentile(&durations, 95.0)),
        p99_ms: Some(percentile(&durations, 99.0)),
        max_ms: durations.last().copied(),
    }
}

/// Nearest-rank percentile over a sorted slice.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (p / 100.0) * (sorted.len() - 1) as f64;
    let idx = rank.round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

/// Assign records to dense hourly buckets starting at `start`.
fn bucketize(records: &[TraceRecord], start: DateTime<Utc>, hours: u32) -> Vec<SeriesBucket> {
    let mut per_bucket: Vec<Vec<&TraceRecord>> = vec![Vec::new(); hours as usize];
    for record in records {
        let Some(ts) = record.started_at.or(record.ended_at) else {
            continue;
        };
        let offset = (ts - start).num_hours();
        if offset >= 0 && (offset as usize) < per_bucket.len() {
            per_bucket[offset as usize].push(record);
        }
    }

    per_bucket
        .into_iter()
        .enumerate()
        .map(|(i, bucket)| {
            let bucket_start = start + Duration::hours(i as i64);
            let durations: Vec<f64> = bucket
                .iter()
                .filter_map(|r| r.duration_or_computed())
                .collect();
            let summary = summarize_latency(durations);
            SeriesBucket {
                bucket_start,
                count: bucket.len() as u64,
                error_count: bucket
                    .iter()
                    .filter(|r| r.status == TraceStatus::Error)
                    .count() as u64,
                mean_latency_ms: summary.mean_ms,
                p95_latency_ms: summary.p95_ms,
            }
        })
        .collect()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::RecordOrigin;
    use chrono::TimeZone;

    fn record(id: &str, status: TraceStatus, ts: DateTime<Utc>, duration: f64) -> TraceRecord {
        TraceRecord {
            id: id.to_string(),
            name: "summarize_meeting".to_string(),
            status,
            started_at: Some(ts),
            ended_at: Some(ts + Duration::milliseconds(duration as i64)),
            duration_ms: Some(duration),
            metadata: serde_json::Map::new(),
            error_message: None,
            origin: RecordOrigin::Local,
            project: None,
        }
    }

    fn aggregator_over(store: LocalStore) -> MetricsAggregator {
        MetricsAggregator::new(Arc::new(store), None, "traces", 100)
    }

    // -- DataSource -----------------------------------------------------------

    #[test]
    fn data_source_parses_case_insensitively() {
        assert_eq!("local".parse::<DataSource>(), Ok(DataSource::Local));
        assert_eq!("Remote".parse::<DataSource>(), Ok(DataSource::Remote));
        assert_eq!("ALL".parse::<DataSource>(), Ok(DataSource::All));
        assert!("both".parse::<DataSource>().is_err());
    }

    // -- Clamping -------------------------------------------------------------

    #[test]
    fn window_is_clamped_not_rejected() {
        assert_eq!(MetricsAggregator::clamp_hours(0), 1);
        assert_eq!(MetricsAggregator::clamp_hours(24), 24);
        assert_eq!(MetricsAggregator::clamp_hours(10_000), 168);
    }

    // -- Percentiles ----------------------------------------------------------

    #[test]
    fn percentile_of_uniform_values() {
        let values: Vec<f64> = (1..=100).map(f64::from).collect();
        assert!((percentile(&values, 50.0) - 50.0).abs() <= 1.0);
        assert!((percentile(&values, 95.0) - 95.0).abs() <= 1.0);
        assert!((percentile(&values, 99.0) - 99.0).abs() <= 1.0);
    }

    #[test]
    fn empty_latency_summary_is_all_none() {
        let summary = summarize_latency(Vec::new());
        assert_eq!(summary.count, 0);
        assert!(summary.mean_ms.is_none());
        assert!(summary.p95_ms.is_none());
    }

    // -- Merge ----------------------------------------------------------------

    #[test]
    fn merge_prefers_fresher_ended_at() {
        let ts = Utc.with_ymd_and_hms(2026, 1, 10, 12, 0, 0).unwrap();
        let mut stale = record("tr-1", TraceStatus::Unknown, ts, 100.0);
        stale.ended_at = Some(ts);
        let mut fresh = record("tr-1", TraceStatus::Success, ts, 100.0);
        fresh.ended_at = Some(ts + Duration::minutes(5));

        let merged = merge_freshest(vec![stale], vec![fresh]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].status, TraceStatus::Success);
    }

    #[test]
    fn merge_missing_ended_at_loses() {
        let ts = Utc.with_ymd_and_hms(2026, 1, 10, 12, 0, 0).unwrap();
        let mut no_end = record("tr-1", TraceStatus::Unknown, ts, 100.0);
        no_end.ended_at = None;
        let with_end = record("tr-1", TraceStatus::Success, ts, 100.0);

        let merged = merge_freshest(vec![with_end], vec![no_end]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].status, TraceStatus::Success);
    }

    // -- Unified metrics ------------------------------------------------------

    #[tokio::test]
    async fn unified_metrics_counts_and_rates() {
        let store = LocalStore::open_in_memory().expect("store");
        let now = Utc::now();
        for i in 0..8 {
            store
                .upsert_trace(&record(
                    &format!("ok-{i}"),
                    TraceStatus::Success,
                    now - Duration::minutes(i * 5 + 5),
                    200.0,
                ))
                .unwrap();
        }
        for i in 0..2 {
            store
                .upsert_trace(&record(
                    &format!("err-{i}"),
                    TraceStatus::Error,
                    now - Duration::minutes(i * 7 + 5),
                    900.0,
                ))
                .unwrap();
        }

        let aggregator = aggregator_over(store);
        let metrics = aggregator.unified_metrics(24, DataSource::Local).await;

        assert_eq!(metrics.total_traces, 10);
        assert_eq!(metrics.success_count, 8);
        assert_eq!(metrics.error_count, 2);
        assert!((metrics.success_rate - 0.8).abs() < 1e-9);
        assert!((metrics.error_rate - 0.2).abs() < 1e-9);
        assert!(!metrics.degraded);
        assert_eq!(metrics.latency.count, 10);
    }

    // -- Dense series ---------------------------------------------------------

    #[tokio::test]
    async fn empty_store_yields_dense_sentinel_buckets() {
        let aggregator = aggregator_over(LocalStore::open_in_memory().expect("store"));
        let series = aggregator.latency_time_series(6, DataSource::Local).await;

        assert_eq!(series.buckets.len(), 6);
        for bucket in &series.buckets {
            assert_eq!(bucket.count, 0);
            assert!(bucket.mean_latency_ms.is_none());
        }
        // Buckets are regularly spaced, one hour apart.
        for pair in series.buckets.windows(2) {
            assert_eq!(pair[1].bucket_start - pair[0].bucket_start, Duration::hours(1));
        }
    }

    #[tokio::test]
    async fn series_assigns_records_to_their_hour() {
        let store = LocalStore::open_in_memory().expect("store");
        let this_hour = Utc::now()
            .duration_trunc(Duration::hours(1))
            .expect("trunc")
            + Duration::minutes(10);
        store
            .upsert_trace(&record("tr-now", TraceStatus::Success, this_hour, 300.0))
            .unwrap();

        let aggregator = aggregator_over(store);
        let series = aggregator.latency_time_series(3, DataSource::Local).await;
        assert_eq!(series.buckets.len(), 3);
        let total: u64 = series.buckets.iter().map(|b| b.count).sum();
        assert_eq!(total, 1);
        // The populated bucket reports a latency; the rest are sentinels.
        let populated = series.buckets.iter().find(|b| b.count > 0).expect("one hit");
        assert_eq!(populated.mean_latency_ms, Some(300.0));
    }

    // -- Degraded paths -------------------------------------------------------

    #[tokio::test]
    async fn remote_source_without_client_degrades_to_local() {
        let store = LocalStore::open_in_memory().expect("store");
        let now = Utc::now();
        store
            .upsert_trace(&record("tr-1", TraceStatus::Success, now - Duration::hours(1), 150.0))
            .unwrap();

        let aggregator = aggregator_over(store);
        let metrics = aggregator.unified_metrics(24, DataSource::Remote).await;

        assert!(metrics.degraded);
        assert_eq!(metrics.total_traces, 1);
        assert!(!metrics.errors.is_empty());
    }

    #[tokio::test]
    async fn status_reports_unconfigured_remote() {
        let aggregator = aggregator_over(LocalStore::open_in_memory().expect("store"));
        let status = aggregator.data_source_status();
        assert!(status.local_available);
        assert!(!status.remote_configured);
        assert!(status.degraded);
    }
}
