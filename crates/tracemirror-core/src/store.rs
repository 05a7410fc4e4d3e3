//! Local persisted mirror of trace and cost records.
//!
//! SQLite-backed with WAL mode for concurrent read/write safety. The core
//! needs exactly three behaviors from this layer: idempotent upsert by
//! unique id, time-range queries, and per-collection sync-state
//! persistence. Sessions are scoped: the connection lock is taken per
//! unit of work and released on every exit path.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::Connection;
use tracing::{info_span, warn};

use crate::error::StorageError;
use crate::records::{CostRecord, RecordOrigin, SyncState, TraceRecord, TraceStatus};

/// DDL for the mirror tables.
const MIRROR_SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS traces (
    id              TEXT PRIMARY KEY,
    name            TEXT NOT NULL,
    status          TEXT NOT NULL,
    started_at_ms   INTEGER,
    ended_at_ms     INTEGER,
    duration_ms     REAL,
    metadata        TEXT NOT NULL DEFAULT '{}',
    error_message   TEXT,
    origin          TEXT NOT NULL,
    project         TEXT
);
CREATE INDEX IF NOT EXISTS idx_traces_started ON traces(started_at_ms);
CREATE INDEX IF NOT EXISTS idx_traces_ended ON traces(ended_at_ms);

CREATE TABLE IF NOT EXISTS costs (
    trace_id        TEXT NOT NULL,
    model           TEXT NOT NULL,
    input_tokens    INTEGER NOT NULL,
    output_tokens   INTEGER NOT NULL,
    total_cost      REAL NOT NULL,
    recorded_at_ms  INTEGER NOT NULL,
    PRIMARY KEY (trace_id, model, recorded_at_ms)
);
CREATE INDEX IF NOT EXISTS idx_costs_recorded ON costs(recorded_at_ms);

CREATE TABLE IF NOT EXISTS sync_state (
    collection       TEXT PRIMARY KEY,
    cursor           TEXT,
    last_synced_ms   INTEGER,
    last_duration_ms INTEGER,
    last_errors      TEXT NOT NULL DEFAULT '[]'
);
";

/// Outcome of applying one fetched page to the store.
#[derive(Debug, Default)]
pub struct PageUpsertOutcome {
    /// Trace rows inserted or updated.
    pub traces_upserted: usize,
    /// Cost rows inserted or updated.
    pub costs_upserted: usize,
    /// Per-record failures (logged and skipped, page not aborted).
    pub errors: Vec<String>,
}

/// SQLite-backed local mirror.
pub struct LocalStore {
    conn: Mutex<Connection>,
}

impl LocalStore {
    /// Open or create a mirror store at the given path.
    pub fn open(db_path: &Path) -> Result<Self, StorageError> {
        let _span = info_span!("store_open", path = %db_path.display()).entered();

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StorageError::Schema(format!("create data dir: {e}")))?;
            }
        }

        let conn = Connection::open(db_path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        conn.execute_batch(MIRROR_SCHEMA)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(MIRROR_SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn session(&self) -> MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    // -- Upserts --------------------------------------------------------------

    /// Upsert a single trace by unique id.
    pub fn upsert_trace(&self, record: &TraceRecord) -> Result<(), StorageError> {
        let conn = self.session();
        upsert_trace_on(&conn, record)
    }

    /// Upsert a single cost row.
    pub fn upsert_cost(&self, cost: &CostRecord) -> Result<(), StorageError> {
        let conn = self.session();
        upsert_cost_on(&conn, cost)
    }

    /// Apply one fetched page inside a single short-lived transaction.
    ///
    /// Best-effort batch: a failing record is recorded in the outcome's
    /// error list and skipped; the rest of the page still commits.
    pub fn upsert_page(
        &self,
        records: &[TraceRecord],
        costs: &[CostRecord],
    ) -> Result<PageUpsertOutcome, StorageError> {
        let _span = info_span!("store_upsert_page", records = records.len()).entered();

        let mut conn = self.session();
        let tx = conn.transaction()?;
        let mut outcome = PageUpsertOutcome::default();

        for record in records {
            match upsert_trace_on(&tx, record) {
                Ok(()) => outcome.traces_upserted += 1,
                Err(e) => {
                    warn!(trace_id = %record.id, error = %e, "Skipping trace upsert");
                    outcome.errors.push(format!("trace {}: {e}", record.id));
                }
            }
        }
        for cost in costs {
            match upsert_cost_on(&tx, cost) {
                Ok(()) => outcome.costs_upserted += 1,
                Err(e) => {
                    warn!(trace_id = %cost.trace_id, error = %e, "Skipping cost upsert");
                    outcome.errors.push(format!("cost {}: {e}", cost.trace_id));
                }
            }
        }

        tx.commit()?;
        Ok(outcome)
    }

    // -- Queries --------------------------------------------------------------

    /// Traces whose start (or, lacking one, end) timestamp falls in
    /// `[start, end)`.
    pub fn traces_in_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TraceRecord>, StorageError> {
        let _span = info_span!("store_query_range").entered();

        let conn = self.session();
        let mut stmt = conn.prepare(
            "SELECT id, name, status, started_at_ms, ended_at_ms, duration_ms, \
                    metadata, error_message, origin, project \
             FROM traces \
             WHERE COALESCE(started_at_ms, ended_at_ms) >= ?1 \
               AND COALESCE(started_at_ms, ended_at_ms) < ?2 \
             ORDER BY COALESCE(started_at_ms, ended_at_ms)",
        )?;
        let rows = stmt.query_map(
            rusqlite::params![start.timestamp_millis(), end.timestamp_millis()],
            row_to_trace,
        )?;

        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// Most recent traces, newest first.
    pub fn recent_traces(&self, limit: usize) -> Result<Vec<TraceRecord>, StorageError> {
        let conn = self.session();
        let mut stmt = conn.prepare(
            "SELECT id, name, status, started_at_ms, ended_at_ms, duration_ms, \
                    metadata, error_message, origin, project \
             FROM traces \
             ORDER BY COALESCE(ended_at_ms, started_at_ms) DESC \
             LIMIT ?1",
        )?;
        let rows = stmt.query_map(rusqlite::params![limit as i64], row_to_trace)?;

        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// Cost rows recorded in `[start, end)`.
    pub fn costs_in_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<CostRecord>, StorageError> {
        let conn = self.session();
        let mut stmt = conn.prepare(
            "SELECT trace_id, model, input_tokens, output_tokens, total_cost, recorded_at_ms \
             FROM costs \
             WHERE recorded_at_ms >= ?1 AND recorded_at_ms < ?2 \
             ORDER BY recorded_at_ms",
        )?;
        let rows = stmt.query_map(
            rusqlite::params![start.timestamp_millis(), end.timestamp_millis()],
            row_to_cost,
        )?;

        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// Number of mirrored traces.
    pub fn trace_count(&self) -> Result<u64, StorageError> {
        let conn = self.session();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM traces", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Number of mirrored cost rows.
    pub fn cost_count(&self) -> Result<u64, StorageError> {
        let conn = self.session();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM costs", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    // -- Sync state -----------------------------------------------------------

    /// Load a collection's sync state, or a fresh one if never synced.
    pub fn load_sync_state(&self, collection: &str) -> Result<SyncState, StorageError> {
        let conn = self.session();
        let mut stmt = conn.prepare(
            "SELECT collection, cursor, last_synced_ms, last_duration_ms, last_errors \
             FROM sync_state WHERE collection = ?1",
        )?;
        let mut rows = stmt.query_map(rusqlite::params![collection], row_to_sync_state)?;

        match rows.next() {
            Some(row) => Ok(row?),
            None => Ok(SyncState::new(collection)),
        }
    }

    /// Persist a collection's sync state (upsert by collection name).
    pub fn save_sync_state(&self, state: &SyncState) -> Result<(), StorageError> {
        let _span = info_span!("store_save_sync_state", collection = %state.collection).entered();

        let errors_json = serde_json::to_string(&state.last_errors)
            .map_err(|e| StorageError::Schema(format!("serialize error list: {e}")))?;
        let conn = self.session();
        conn.execute(
            "INSERT INTO sync_state (collection, cursor, last_synced_ms, last_duration_ms, last_errors) \
             VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT(collection) DO UPDATE SET \
                 cursor = excluded.cursor, \
                 last_synced_ms = excluded.last_synced_ms, \
                 last_duration_ms = excluded.last_duration_ms, \
                 last_errors = excluded.last_errors",
            rusqlite::params![
                state.collection,
                state.cursor,
                state.last_synced_at.map(|t| t.timestamp_millis()),
                state.last_duration_ms.map(|d| d as i64),
                errors_json,
            ],
        )?;
        Ok(())
    }

    // -- Maintenance ----------------------------------------------------------

    /// Delete mirrored records older than the cutoff. Returns rows removed.
    pub fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, StorageError> {
        let _span = info_span!("store_prune").entered();

        let cutoff_ms = cutoff.timestamp_millis();
        let conn = self.session();
        let traces = conn.execute(
            "DELETE FROM traces WHERE COALESCE(started_at_ms, ended_at_ms) < ?1",
            rusqlite::params![cutoff_ms],
        )?;
        let costs = conn.execute(
            "DELETE FROM costs WHERE recorded_at_ms < ?1",
            rusqlite::params![cutoff_ms],
        )?;
        Ok(traces + costs)
    }
}

impl std::fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStore").finish_non_exhaustive()
    }
}

// =============================================================================
// Row mapping
// =============================================================================

fn upsert_trace_on(conn: &Connection, record: &TraceRecord) -> Result<(), StorageError> {
    let metadata = serde_json::to_string(&record.metadata)
        .map_err(|e| StorageError::Schema(format!("serialize metadata: {e}")))?;
    conn.execute(
        "INSERT INTO traces (id, name, status, started_at_ms, ended_at_ms, duration_ms, \
                             metadata, error_message, origin, project) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10) \
         ON CONFLICT(id) DO UPDATE SET \
             name = excluded.name, \
             status = excluded.status, \
             started_at_ms = excluded.started_at_ms, \
             ended_at_ms = excluded.ended_at_ms, \
             duration_ms = excluded.duration_ms, \
             metadata = excluded.metadata, \
             error_message = excluded.error_message, \
             origin = excluded.origin, \
             project = excluded.project",
        rusqlite::params![
            record.id,
            record.name,
            record.status.to_string(),
            record.started_at.map(|t| t.timestamp_millis()),
            record.ended_at.map(|t| t.timestamp_millis()),
            record.duration_ms,
            metadata,
            record.error_message,
            record.origin.to_string(),
            record.project,
        ],
    )?;
    Ok(())
}

fn upsert_cost_on(conn: &Connection, cost: &CostRecord) -> Result<(), StorageError> {
    conn.execute(
        "INSERT INTO costs (trace_id, model, input_tokens, output_tokens, total_cost, recorded_at_ms) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
         ON CONFLICT(trace_id, model, recorded_at_ms) DO UPDATE SET \
             input_tokens = excluded.input_tokens, \
             output_tokens = excluded.output_tokens, \
             total_cost = excluded.total_cost",
        rusqlite::params![
            cost.trace_id,
            cost.model,
            cost.input_tokens as i64,
            cost.output_tokens as i64,
            cost.total_cost,
            cost.recorded_at.timestamp_millis(),
        ],
    )?;
    Ok(())
}

fn ms_to_datetime(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.and_then(|ms| Utc.timestamp_millis_opt(ms).single())
}

fn row_to_trace(row: &rusqlite::Row<'_>) -> rusqlite::Result<TraceRecord> {
    let status: String = row.get(2)?;
    let metadata: String = row.get(6)?;
    let origin: String = row.get(8)?;
    Ok(TraceRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        status: status.parse().unwrap_or(TraceStatus::Unknown),
        started_at: ms_to_datetime(row.get(3)?),
        ended_at: ms_to_datetime(row.get(4)?),
        duration_ms: row.get(5)?,
        metadata: serde_json::from_str(&metadata).unwrap_or_default(),
        error_message: row.get(7)?,
        origin: if origin == "local" {
            RecordOrigin::Local
        } else {
            RecordOrigin::Remote
        },
        project: row.get(9)?,
    })
}

fn row_to_cost(row: &rusqlite::Row<'_>) -> rusqlite::Result<CostRecord> {
    Ok(CostRecord {
        trace_id: row.get(0)?,
        model: row.get(1)?,
        input_tokens: row.get::<_, i64>(2)? as u64,
        output_tokens: row.get::<_, i64>(3)? as u64,
        total_cost: row.get(4)?,
        recorded_at: ms_to_datetime(Some(row.get(5)?)).unwrap_or_else(Utc::now),
    })
}

fn row_to_sync_state(row: &rusqlite::Row<'_>) -> rusqlite::Result<SyncState> {
    let errors: String = row.get(4)?;
    Ok(SyncState {
        collection: row.get(0)?,
        cursor: row.get(1)?,
        last_synced_at: ms_to_datetime(row.get(2)?),
        last_duration_ms: row.get::<_, Option<i64>>(3)?.map(|d| d as u64),
        last_errors: serde_json::from_str(&errors).unwrap_or_default(),
    })
}

// =============================================================================
// Tests
// =============================================================================
