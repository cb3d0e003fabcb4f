//! Durable store handle and schema.
//!
//! One SQLite database holds everything the pipeline persists: manifest rows
//! and attempt history, the raw-record fingerprint index, derived tables,
//! the anomaly log, and the readiness cache. The connection is shared behind
//! a mutex; every store struct clones the same [`Db`] handle, so the mutex is
//! also what makes the manifest's check-then-write status transition atomic.
//!
//! All writes are append-or-update. Nothing here issues destructive deletes;
//! history of attempts, superseded batches, and resolved anomalies stays
//! inspectable.

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::{Mutex, MutexGuard};
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Schema version for migrations.
/// Version history:
/// - v1: Initial schema
const SCHEMA_VERSION: u32 = 1;

/// Shared handle to the pipeline database.
#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

impl Db {
    /// Open (or create) the database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.initialize_schema()?;
        Ok(db)
    }

    /// In-memory database (for testing).
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.initialize_schema()?;
        Ok(db)
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    fn initialize_schema(&self) -> Result<(), StoreError> {
        let conn = self.lock();

        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
        "#,
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY)",
            [],
        )?;

        let current_version: Option<u32> = conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
                row.get(0)
            })
            .optional()?;

        match current_version {
            None => {
                create_schema_v1(&conn)?;
                conn.execute(
                    "INSERT INTO schema_version (version) VALUES (?)",
                    [SCHEMA_VERSION],
                )?;
                info!("Created pipeline schema v{}", SCHEMA_VERSION);
            }
            Some(v) if v == SCHEMA_VERSION => {
                debug!("Pipeline schema at v{}", SCHEMA_VERSION);
            }
            Some(v) => {
                warn!(
                    "Pipeline schema version mismatch: expected {}, got {}",
                    SCHEMA_VERSION, v
                );
            }
        }

        Ok(())
    }
}

fn create_schema_v1(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        r#"
        -- Latest manifest state, one row per (partition, stage).
        CREATE TABLE IF NOT EXISTS manifest_entries (
            domain          TEXT NOT NULL,
            week_ending     TEXT NOT NULL,
            tier            TEXT NOT NULL,
            stage           TEXT NOT NULL,
            status          TEXT NOT NULL,
            record_count    INTEGER NOT NULL DEFAULT 0,
            digest          TEXT,
            upstream_digest TEXT,
            batch_id        TEXT NOT NULL,
            started_at      TEXT NOT NULL,
            completed_at    TEXT,
            heartbeat_at    TEXT,
            PRIMARY KEY (domain, week_ending, tier, stage)
        );

        -- Append-only log of every manifest transition, for attempt history.
        CREATE TABLE IF NOT EXISTS manifest_attempts (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            domain          TEXT NOT NULL,
            week_ending     TEXT NOT NULL,
            tier            TEXT NOT NULL,
            stage           TEXT NOT NULL,
            status          TEXT NOT NULL,
            record_count    INTEGER NOT NULL DEFAULT 0,
            digest          TEXT,
            upstream_digest TEXT,
            batch_id        TEXT NOT NULL,
            recorded_at     TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_attempts_partition
            ON manifest_attempts(domain, week_ending, tier);

        -- Content-addressed raw records. UNIQUE fingerprint makes re-ingestion
        -- of identical source rows a counted no-op. last_batch_id tracks the
        -- most recent batch that observed the row; semantic fields never change.
        CREATE TABLE IF NOT EXISTS raw_records (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            domain        TEXT NOT NULL,
            week_ending   TEXT NOT NULL,
            tier          TEXT NOT NULL,
            symbol        TEXT NOT NULL,
            venue         TEXT NOT NULL,
            share_volume  INTEGER NOT NULL,
            trade_count   INTEGER NOT NULL,
            source_row    INTEGER NOT NULL,
            fingerprint   TEXT NOT NULL UNIQUE,
            last_batch_id TEXT NOT NULL,
            ingested_at   TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_raw_partition
            ON raw_records(domain, week_ending, tier);

        -- Derived rows upsert by natural key so revisions replace, not append.
        CREATE TABLE IF NOT EXISTS normalized_rows (
            domain       TEXT NOT NULL,
            week_ending  TEXT NOT NULL,
            tier         TEXT NOT NULL,
            symbol       TEXT NOT NULL,
            venue        TEXT NOT NULL,
            share_volume INTEGER NOT NULL,
            trade_count  INTEGER NOT NULL,
            batch_id     TEXT NOT NULL,
            updated_at   TEXT NOT NULL,
            PRIMARY KEY (domain, week_ending, tier, symbol, venue)
        );

        CREATE TABLE IF NOT EXISTS summary_rows (
            domain             TEXT NOT NULL,
            week_ending        TEXT NOT NULL,
            tier               TEXT NOT NULL,
            symbol             TEXT NOT NULL,
            total_share_volume INTEGER NOT NULL,
            total_trade_count  INTEGER NOT NULL,
            venue_count        INTEGER NOT NULL,
            market_share       REAL NOT NULL,
            batch_id           TEXT NOT NULL,
            updated_at         TEXT NOT NULL,
            PRIMARY KEY (domain, week_ending, tier, symbol)
        );

        -- Append-only anomaly log. Rows are closed by setting resolved_at,
        -- never deleted.
        CREATE TABLE IF NOT EXISTS anomalies (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            domain          TEXT NOT NULL,
            week_ending     TEXT NOT NULL,
            tier            TEXT NOT NULL,
            stage           TEXT NOT NULL,
            severity        TEXT NOT NULL,
            category        TEXT NOT NULL,
            message         TEXT NOT NULL,
            detected_at     TEXT NOT NULL,
            resolved_at     TEXT,
            resolution_note TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_anomalies_partition
            ON anomalies(domain, week_ending, tier);
        CREATE INDEX IF NOT EXISTS idx_anomalies_open
            ON anomalies(domain, week_ending) WHERE resolved_at IS NULL;

        -- Cached readiness projection. Recomputable at any time; never the
        -- sole source of truth.
        CREATE TABLE IF NOT EXISTS readiness_cache (
            domain                 TEXT NOT NULL,
            week_ending            TEXT NOT NULL,
            tier                   TEXT NOT NULL,
            is_ready               INTEGER NOT NULL,
            all_partitions_present INTEGER NOT NULL,
            all_stages_complete    INTEGER NOT NULL,
            no_critical_anomalies  INTEGER NOT NULL,
            blocking_issues        TEXT NOT NULL,
            overridden             INTEGER NOT NULL DEFAULT 0,
            updated_at             TEXT NOT NULL,
            PRIMARY KEY (domain, week_ending, tier)
        );

        -- Audit trail for manual readiness overrides. state_stamp captures the
        -- manifest+anomaly state at override time; the override expires when
        -- the stamp no longer matches.
        CREATE TABLE IF NOT EXISTS readiness_overrides (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            domain      TEXT NOT NULL,
            week_ending TEXT NOT NULL,
            tier        TEXT NOT NULL,
            is_ready    INTEGER NOT NULL,
            operator    TEXT NOT NULL,
            note        TEXT NOT NULL,
            state_stamp TEXT NOT NULL,
            applied_at  TEXT NOT NULL,
            expired_at  TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_overrides_partition
            ON readiness_overrides(domain, week_ending, tier);
    "#,
    )?;
    Ok(())
}

/// Errors from the store layer.
#[derive(Debug)]
pub enum StoreError {
    Sqlite(rusqlite::Error),
    Serialization(serde_json::Error),
    /// A RUNNING manifest entry already exists for the (partition, stage)
    /// under a different batch id. No state was changed; back off and retry.
    ConcurrentRunConflict {
        partition_key: String,
        stage: String,
        running_batch_id: String,
    },
    NotFound(String),
    Corrupt(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sqlite(e) => write!(f, "SQLite error: {}", e),
            Self::Serialization(e) => write!(f, "Serialization error: {}", e),
            Self::ConcurrentRunConflict {
                partition_key,
                stage,
                running_batch_id,
            } => write!(
                f,
                "Concurrent run conflict: {} stage {} already RUNNING under batch {}",
                partition_key, stage, running_batch_id
            ),
            Self::NotFound(what) => write!(f, "Not found: {}", what),
            Self::Corrupt(what) => write!(f, "Corrupt stored value: {}", what),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Sqlite(e)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e)
    }
}

// Timestamp/date text encoding shared by the store structs. rusqlite is built
// without the chrono feature, so conversions are explicit.

pub(crate) fn encode_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

pub(crate) fn decode_ts(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("timestamp '{}': {}", s, e)))
}

pub(crate) fn decode_ts_opt(s: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    s.map(|s| decode_ts(&s)).transpose()
}

pub(crate) fn encode_week(week: NaiveDate) -> String {
    week.to_string()
}

pub(crate) fn decode_week(s: &str) -> Result<NaiveDate, StoreError> {
    s.parse()
        .map_err(|e| StoreError::Corrupt(format!("week_ending '{}': {}", s, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_schema_initializes() {
        let db = Db::in_memory().unwrap();
        let conn = db.lock();
        let version: u32 = conn
            .query_row("SELECT version FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn test_open_on_disk_reopens_existing_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.db");
        {
            let _db = Db::open(&path).unwrap();
        }
        // Second open must not recreate or bump the schema.
        let db = Db::open(&path).unwrap();
        let conn = db.lock();
        let count: u32 = conn
            .query_row("SELECT COUNT(*) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_timestamp_round_trip() {
        let now = Utc::now();
        let decoded = decode_ts(&encode_ts(now)).unwrap();
        assert_eq!(decoded.timestamp_micros(), now.timestamp_micros());
    }
}
