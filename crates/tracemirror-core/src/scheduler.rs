//! Background sync scheduler.
//!
//! One long-lived timer task drives per-collection sync cycles against the
//! remote provider. Cycles never overlap per collection: the timer path
//! skips a held collection, a manual trigger is rejected with
//! [`SchedulerError::AlreadyRunning`]. A stop signal prevents new cycles
//! from starting but lets the in-flight cycle finish.
//!
//! # Cursor discipline
//!
//! The stored cursor only ever advances past a *fully processed* page. A
//! page that still fails after bounded retries leaves the cursor where it
//! was, so the next cycle retries the same window — at-least-once
//! mirroring, made harmless by the store's idempotent upserts.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::circuit_breaker::CircuitBreakerStatus;
use crate::config::{Config, SyncConfig};
use crate::error::SchedulerError;
use crate::records::{SyncState, MAX_SYNC_ERRORS};
use crate::remote::{RemoteFetch, RemoteTelemetryClient};
use crate::retry::{with_retry_outcome, RetryPolicy};
use crate::store::LocalStore;

/// Upper bound on pages pulled per collection per cycle.
const MAX_PAGES_PER_CYCLE: u32 = 100;

/// What initiated a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Scheduled,
    Manual,
}

/// Result of one sync cycle for one collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncReport {
    /// Collection this cycle covered.
    pub collection: String,
    /// Pages fully processed.
    pub pages: u32,
    /// Trace rows upserted.
    pub traces_upserted: usize,
    /// Cost rows upserted.
    pub costs_upserted: usize,
    /// Per-record/per-page errors (bounded).
    pub errors: Vec<String>,
    /// Cycle completed with a non-empty error list — degraded coverage,
    /// still a successful cycle.
    pub partial: bool,
    /// The circuit refused the first fetch; nothing was mirrored.
    pub unavailable: bool,
    /// Wall-clock duration of the cycle.
    pub duration_ms: u64,
}

/// Status of one configured collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionStatus {
    pub collection: String,
    pub running: bool,
    pub cursor: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub last_duration_ms: Option<u64>,
    pub last_errors: Vec<String>,
}

/// Scheduler status surface for the dashboard layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerStatus {
    /// False when boot-time configuration failed; the sync subsystem is
    /// permanently unavailable for this process.
    pub configured: bool,
    /// Why the subsystem is unavailable, when it is.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unavailable_reason: Option<String>,
    /// Configured cycle interval in seconds.
    pub interval_secs: u64,
    /// Next scheduled run, when the timer task is active.
    pub next_run_at: Option<DateTime<Utc>>,
    /// Whether the remote provider is currently reachable (breaker proxy).
    pub remote_reachable: bool,
    /// Breaker snapshot for diagnostics.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub breaker: Option<CircuitBreakerStatus>,
    /// Per-collection state.
    pub collections: Vec<CollectionStatus>,
}

/// Per-collection running flag. Owned by the scheduler, never persisted.
#[derive(Debug)]
struct CollectionSlot {
    name: String,
    running: AtomicBool,
}

/// Releases a collection's running flag on every exit path.
struct RunningGuard<'a> {
    slot: &'a CollectionSlot,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.slot.running.store(false, Ordering::SeqCst);
    }
}

/// Background repeating job driving per-collection sync cycles.
pub struct SyncScheduler {
    store: Arc<LocalStore>,
    /// `None` marks the permanently-unavailable mode entered when boot
    /// configuration failed.
    client: Option<Arc<RemoteTelemetryClient>>,
    sync_config: SyncConfig,
    retry_policy: RetryPolicy,
    page_size: u32,
    collections: BTreeMap<String, Arc<CollectionSlot>>,
    unavailable_reason: Option<String>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    next_run: Mutex<Option<DateTime<Utc>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SyncScheduler {
    /// Build a scheduler from configuration and its collaborators.
    #[must_use]
    pub fn new(store: Arc<LocalStore>, client: Arc<RemoteTelemetryClient>, config: &Config) -> Self {
        let collections = config
            .sync
            .collections
            .iter()
            .map(|name| {
                (
                    name.clone(),
                    Arc::new(CollectionSlot {
                        name: name.clone(),
                        running: AtomicBool::new(false),
                    }),
                )
            })
            .collect();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Self {
            store,
            client: Some(client),
            sync_config: config.sync.clone(),
            retry_policy: RetryPolicy::from_config(&config.retry),
            page_size: config.remote.page_size,
            collections,
            unavailable_reason: None,
            shutdown_tx,
            shutdown_rx,
            next_run: Mutex::new(None),
            handle: Mutex::new(None),
        }
    }

    /// Build a scheduler in permanently-unavailable mode.
    ///
    /// Used when boot-time configuration failed (e.g. missing provider
    /// credentials): cycles are skipped, status reports the reason, and
    /// the host process keeps serving local-only reads.
    #[must_use]
    pub fn unavailable(store: Arc<LocalStore>, config: &Config, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        warn!(reason = %reason, "Sync subsystem starting in unavailable mode");
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            store,
            client: None,
            sync_config: config.sync.clone(),
            retry_policy: RetryPolicy::from_config(&config.retry),
            page_size: config.remote.page_size,
            collections: BTreeMap::new(),
            unavailable_reason: Some(reason),
            shutdown_tx,
            shutdown_rx,
            next_run: Mutex::new(None),
            handle: Mutex::new(None),
        }
    }

    /// Spawn the background timer task for a shared scheduler handle.
    /// Idempotent: a second call while the task is alive is a no-op.
    pub fn start(scheduler: &Arc<Self>) {
        if scheduler.client.is_none() {
            warn!("Sync subsystem unavailable; timer task not started");
            return;
        }
        let mut handle = lock_unpoisoned(&scheduler.handle);
        if handle.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let task = Arc::clone(scheduler);
        *handle = Some(tokio::spawn(async move { task.run_loop().await }));
    }

    /// Signal shutdown and wait for the timer task to finish. An in-flight
    /// cycle completes; no new cycle starts.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = lock_unpoisoned(&self.handle).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Scheduler task join failed");
            }
        }
        info!("Sync scheduler stopped");
    }

    async fn run_loop(self: Arc<Self>) {
        let interval = self.sync_config.interval();
        let mut rx = self.shutdown_rx.clone();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            interval_secs = self.sync_config.interval_secs,
            collections = self.collections.len(),
            "Sync scheduler started"
        );

        loop {
            tokio::select! {
                _ = rx.changed() => {
                    if *rx.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {}
            }

            *lock_unpoisoned(&self.next_run) = Some(
                Utc::now()
                    + chrono::Duration::from_std(interval)
                        .unwrap_or_else(|_| chrono::Duration::zero()),
            );

            // The cycle below is outside the select so a stop signal lets
            // it finish; the flag is re-checked before each collection.
            let names: Vec<String> = self.collections.keys().cloned().collect();
            for name in names {
                if *rx.borrow() {
                    break;
                }
                match self.run_cycle(&name, Trigger::Scheduled).await {
                    Ok(report) => {
                        debug!(
                            collection = %name,
                            pages = report.pages,
                            upserted = report.traces_upserted,
                            partial = report.partial,
                            "Scheduled cycle finished"
                        );
                    }
                    Err(SchedulerError::AlreadyRunning { .. }) => {
                        // A manual trigger holds the flag; skip, don't queue.
                        debug!(collection = %name, "Cycle already running; skipping tick");
                    }
                    Err(e) => {
                        warn!(collection = %name, error = %e, "Scheduled cycle failed");
                    }
                }
            }

            if *rx.borrow() {
                break;
            }
        }
        *lock_unpoisoned(&self.next_run) = None;
    }

    /// Run one sync cycle for a collection right now.
    ///
    /// Rejects with [`SchedulerError::AlreadyRunning`] when a cycle for the
    /// collection holds the running flag; the request is never queued.
    pub async fn trigger_manual(&self, collection: &str) -> Result<SyncReport, SchedulerError> {
        if *self.shutdown_rx.borrow() {
            return Err(SchedulerError::ShuttingDown);
        }
        self.run_cycle(collection, Trigger::Manual).await
    }

    async fn run_cycle(
        &self,
        collection: &str,
        trigger: Trigger,
    ) -> Result<SyncReport, SchedulerError> {
        let Some(client) = self.client.as_ref() else {
            return Err(SchedulerError::Unavailable(
                self.unavailable_reason
                    .clone()
                    .unwrap_or_else(|| "not configured".to_string()),
            ));
        };
        let slot = self
            .collections
            .get(collection)
            .ok_or_else(|| SchedulerError::UnknownCollection(collection.to_string()))?;

        // Acquire the running flag; at most one cycle per collection.
        if slot
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SchedulerError::AlreadyRunning {
                collection: collection.to_string(),
            });
        }
        let _guard = RunningGuard { slot: slot.as_ref() };

        let started = Instant::now();
        info!(collection, trigger = ?trigger, "Sync cycle starting");

        let mut state = match self.store.load_sync_state(collection) {
            Ok(state) => state,
            Err(e) => {
                warn!(collection, error = %e, "Failed to load sync state; starting fresh");
                SyncState::new(collection)
            }
        };
        state.last_errors.clear();

        let mut report = SyncReport {
            collection: collection.to_string(),
            pages: 0,
            traces_upserted: 0,
            costs_upserted: 0,
            errors: Vec::new(),
            partial: false,
            unavailable: false,
            duration_ms: 0,
        };

        // Page loop: fetch → upsert → advance cursor, until the provider
        // reports no further pages or a page is abandoned.
        loop {
            if report.pages >= MAX_PAGES_PER_CYCLE {
                warn!(
                    collection,
                    max_pages = MAX_PAGES_PER_CYCLE,
                    "Page budget exhausted; resuming next cycle from stored cursor"
                );
                break;
            }

            let cursor = state.cursor.clone();
            let outcome = with_retry_outcome(&self.retry_policy, || {
                client.list_since(collection, cursor.as_deref(), self.page_size)
            })
            .await;

            let fetch = match outcome.result {
                Ok(fetch) => fetch,
                Err(e) => {
                    // Page abandoned after bounded retries. The cursor is
                    // NOT advanced: the next cycle retries this window.
                    warn!(
                        collection,
                        attempts = outcome.attempts,
                        error = %e,
                        "Page abandoned after retries; cursor not advanced"
                    );
                    record_error(&mut state, &mut report, format!("page fetch: {e}"));
                    break;
                }
            };

            let page = match fetch {
                RemoteFetch::Page(page) => page,
                RemoteFetch::Unavailable { retry_after_ms } => {
                    debug!(
                        collection,
                        retry_after_ms, "Remote unavailable (circuit open); ending cycle"
                    );
                    report.unavailable = report.pages == 0;
                    record_error(
                        &mut state,
                        &mut report,
                        format!("remote unavailable; retry after {retry_after_ms}ms"),
                    );
                    break;
                }
            };

            let next_cursor = page.next_cursor.clone();
            let is_last = next_cursor.is_none();
            if !page.is_empty() {
                match self.store.upsert_page(&page.records, &page.costs) {
                    Ok(outcome) => {
                        report.traces_upserted += outcome.traces_upserted;
                        report.costs_upserted += outcome.costs_upserted;
                        for err in outcome.errors {
                            record_error(&mut state, &mut report, err);
                        }
                    }
                    Err(e) => {
                        // Transaction-level failure: the page was not
                        // processed, so the cursor must not move past it.
                        warn!(collection, error = %e, "Page upsert failed; cursor not advanced");
                        record_error(&mut state, &mut report, format!("page upsert: {e}"));
                        break;
                    }
                }
            }
            report.pages += 1;

            // The page is now fully processed (best-effort record skips
            // included); only here does the cursor move.
            if let Some(next) = next_cursor {
                state.cursor = Some(next);
            }
            if is_last {
                break;
            }
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        report.duration_ms = duration_ms;
        report.partial = !report.errors.is_empty();

        state.last_synced_at = Some(Utc::now());
        state.last_duration_ms = Some(duration_ms);
        if let Err(e) = self.store.save_sync_state(&state) {
            error!(collection, error = %e, "Failed to persist sync state");
        }

        self.prune_retention();

        info!(
            collection,
            pages = report.pages,
            traces = report.traces_upserted,
            costs = report.costs_upserted,
            errors = report.errors.len(),
            duration_ms,
            "Sync cycle finished"
        );
        Ok(report)
    }

    /// Opportunistic retention pruning at the end of a cycle.
    fn prune_retention(&self) {
        let retention_days = i64::from(self.sync_config.retention_days);
        if retention_days == 0 {
            return;
        }
        let cutoff = Utc::now() - chrono::Duration::days(retention_days);
        match self.store.prune_older_than(cutoff) {
            Ok(0) => {}
            Ok(removed) => debug!(removed, "Pruned expired mirror rows"),
            Err(e) => warn!(error = %e, "Retention pruning failed"),
        }
    }

    /// Whether a cycle for the collection is currently in flight.
    #[must_use]
    pub fn is_running(&self, collection: &str) -> bool {
        self.collections
            .get(collection)
            .is_some_and(|slot| slot.running.load(Ordering::SeqCst))
    }

    /// Status surface: per-collection state, timer info, remote
    /// reachability (breaker proxy).
    pub fn status(&self) -> SchedulerStatus {
        let collections = self
            .collections
            .values()
            .map(|slot| {
                let state = self
                    .store
                    .load_sync_state(&slot.name)
                    .unwrap_or_else(|_| SyncState::new(&slot.name));
                CollectionStatus {
                    collection: slot.name.clone(),
                    running: slot.running.load(Ordering::SeqCst),
                    cursor: state.cursor,
                    last_synced_at: state.last_synced_at,
                    last_duration_ms: state.last_duration_ms,
                    last_errors: state.last_errors,
                }
            })
            .collect();

        SchedulerStatus {
            configured: self.client.is_some(),
            unavailable_reason: self.unavailable_reason.clone(),
            interval_secs: self.sync_config.interval_secs,
            next_run_at: *lock_unpoisoned(&self.next_run),
            remote_reachable: self.client.as_ref().is_some_and(|c| c.is_reachable()),
            breaker: self.client.as_ref().map(|c| c.breaker_status()),
            collections,
        }
    }
}

impl std::fmt::Debug for SyncScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncScheduler")
            .field("collections", &self.collections.len())
            .field("configured", &self.client.is_some())
            .finish_non_exhaustive()
    }
}

fn record_error(state: &mut SyncState, report: &mut SyncReport, message: String) {
    if report.errors.len() < MAX_SYNC_ERRORS {
        report.errors.push(message.clone());
    }
    state.push_error(message);
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, SharedCircuitBreaker};
    use crate::error::RemoteError;
    use crate::records::{RecordOrigin, TraceRecord, TraceStatus};
    use crate::remote::{TracePage, TraceProvider};
    use std::future::Future;
    use std::pin::Pin;
    use std::time::Duration;

    /// Provider serving a fixed sequence of pages keyed by cursor.
    struct PagedProvider {
        pages: Vec<TracePage>,
    }

    impl TraceProvider for PagedProvider {
        fn list(
            &self,
            _collection: &str,
            cursor: Option<&str>,
            _page_size: u32,
        ) -> Pin<Box<dyn Future<Output = Result<TracePage, RemoteError>> + Send + '_>> {
            let index = cursor.map_or(0, |c| c.parse::<usize>().unwrap_or(0));
            let page = self.pages.get(index).cloned().unwrap_or_default();
            Box::pin(async move { Ok(page) })
        }
    }

    fn trace(id: &str) -> TraceRecord {
        TraceRecord {
            id: id.to_string(),
            name: "summarize_meeting".to_string(),
            status: TraceStatus::Success,
            started_at: Some(Utc::now()),
            ended_at: Some(Utc::now()),
            duration_ms: Some(100.0),
            metadata: serde_json::Map::new(),
            error_message: None,
            origin: RecordOrigin::Remote,
            project: None,
        }
    }

    fn test_config() -> Config {
        let mut config = Config::default();
        config.remote.api_key = "tl-test".to_string();
        config.retry.initial_delay_ms = 1;
        config.retry.max_delay_ms = 2;
        config
    }

    fn scheduler_with(provider: Box<dyn TraceProvider>) -> SyncScheduler {
        let store = Arc::new(LocalStore::open_in_memory().expect("store"));
        let breaker = SharedCircuitBreaker::new(CircuitBreaker::with_name(
            "remote_provider",
            CircuitBreakerConfig::new(5, Duration::from_secs(60)),
        ));
        let client = Arc::new(RemoteTelemetryClient::new(provider, breaker));
        SyncScheduler::new(store, client, &test_config())
    }

    #[tokio::test]
    async fn manual_sync_mirrors_all_pages() {
        let scheduler = scheduler_with(Box::new(PagedProvider {
            pages: vec![
                TracePage {
                    records: vec![trace("tr-1"), trace("tr-2")],
                    costs: Vec::new(),
                    next_cursor: Some("1".to_string()),
                },
                TracePage {
                    records: vec![trace("tr-3")],
                    costs: Vec::new(),
                    next_cursor: None,
                },
            ],
        }));

        let report = scheduler.trigger_manual("traces").await.expect("cycle");
        assert_eq!(report.pages, 2);
        assert_eq!(report.traces_upserted, 3);
        assert!(!report.partial);
        assert_eq!(scheduler.store.trace_count().unwrap(), 3);

        let state = scheduler.store.load_sync_state("traces").unwrap();
        assert_eq!(state.cursor.as_deref(), Some("1"));
        assert!(state.last_synced_at.is_some());
    }

    #[tokio::test]
    async fn unknown_collection_is_rejected() {
        let scheduler = scheduler_with(Box::new(PagedProvider { pages: Vec::new() }));
        let err = scheduler.trigger_manual("meetings").await.expect_err("unknown");
        assert!(matches!(err, SchedulerError::UnknownCollection(_)));
    }

    #[tokio::test]
    async fn unavailable_mode_rejects_triggers_and_reports_status() {
        let store = Arc::new(LocalStore::open_in_memory().expect("store"));
        let scheduler = Arc::new(SyncScheduler::unavailable(
            store,
            &test_config(),
            "missing remote provider credentials (remote.api_key)",
        ));

        SyncScheduler::start(&scheduler);
        let err = scheduler.trigger_manual("traces").await.expect_err("unavailable");
        assert!(matches!(err, SchedulerError::Unavailable(_)));

        let status = scheduler.status();
        assert!(!status.configured);
        assert!(!status.remote_reachable);
        assert!(status.unavailable_reason.is_some());
    }

    #[tokio::test]
    async fn running_flag_is_released_after_cycle() {
        let scheduler = scheduler_with(Box::new(PagedProvider { pages: Vec::new() }));
        assert!(!scheduler.is_running("traces"));
        scheduler.trigger_manual("traces").await.expect("cycle");
        assert!(!scheduler.is_running("traces"));
        // A second manual trigger is accepted once the flag is free.
        scheduler.trigger_manual("traces").await.expect("second cycle");
    }
}
