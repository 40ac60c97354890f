//! SQLite persistence layer.
//!
//! A single database file holds every store the engine uses:
//! - `actions` / `whitelist` / `profiles` / `daily_counts` (ledger)
//! - `sessions` / `session_items` (resumable batches)
//! - `snapshots` (membership captures)
//! - `timeseries_points` / `daily_aggregates` (metrics)
//!
//! All stores share one connection behind a mutex: the engine has a
//! single logical writer, and readers tolerate the brief lock.

pub mod ledger;
pub mod snapshot;
pub mod timeseries;

pub use ledger::{ActionKind, ActionRecord, CachedProfile, LedgerStore, WhitelistEntry};
pub use snapshot::{MemberKind, SnapshotDiff, SnapshotMeta, SnapshotStore};
pub use timeseries::{DailyAggregate, TimeSeriesPoint, TimeSeriesStore};

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use crate::session::store::SessionStore;

const CREATE_TABLES_SQL: &str = r#"
-- Append-only action ledger
CREATE TABLE IF NOT EXISTS actions (
    id TEXT PRIMARY KEY,
    username TEXT NOT NULL,
    kind TEXT NOT NULL,
    source TEXT,
    reason TEXT,
    followed_back INTEGER NOT NULL DEFAULT 0,
    followed_back_at TEXT,
    created_at TEXT NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{}'
);

CREATE INDEX IF NOT EXISTS idx_actions_username_created
ON actions(username, created_at DESC);

CREATE INDEX IF NOT EXISTS idx_actions_kind_created
ON actions(kind, created_at DESC);

-- Whitelist: presence overrides every other filter decision
CREATE TABLE IF NOT EXISTS whitelist (
    username TEXT PRIMARY KEY,
    reason TEXT,
    added_at TEXT NOT NULL
);

-- Opportunistically cached profile attributes
CREATE TABLE IF NOT EXISTS profiles (
    username TEXT PRIMARY KEY,
    display_name TEXT,
    bio TEXT,
    followers_count INTEGER,
    following_count INTEGER,
    post_count INTEGER,
    verified INTEGER NOT NULL DEFAULT 0,
    avatar_url TEXT,
    updated_at TEXT NOT NULL
);

-- Per-UTC-date action counters
CREATE TABLE IF NOT EXISTS daily_counts (
    date TEXT NOT NULL,
    kind TEXT NOT NULL,
    count INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (date, kind)
);

-- Checkpointed batch sessions
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    status TEXT NOT NULL,
    started_at TEXT NOT NULL,
    completed_at TEXT,
    total_count INTEGER NOT NULL,
    success_count INTEGER NOT NULL DEFAULT 0,
    failed_count INTEGER NOT NULL DEFAULT 0,
    skipped_count INTEGER NOT NULL DEFAULT 0,
    metadata TEXT NOT NULL DEFAULT '{}'
);

CREATE INDEX IF NOT EXISTS idx_sessions_kind_status
ON sessions(kind, status, started_at DESC);

CREATE TABLE IF NOT EXISTS session_items (
    session_id TEXT NOT NULL,
    username TEXT NOT NULL,
    status TEXT NOT NULL,
    processed_at TEXT,
    error_message TEXT,
    PRIMARY KEY (session_id, username),
    FOREIGN KEY (session_id) REFERENCES sessions(id)
);

CREATE INDEX IF NOT EXISTS idx_session_items_status
ON session_items(session_id, status);

-- Immutable membership snapshots (full member sets)
CREATE TABLE IF NOT EXISTS snapshots (
    id TEXT PRIMARY KEY,
    subject TEXT NOT NULL,
    kind TEXT NOT NULL,
    members TEXT NOT NULL,
    count INTEGER NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_snapshots_subject_kind
ON snapshots(subject, kind, created_at DESC);

-- Raw metric points (append-only)
CREATE TABLE IF NOT EXISTS timeseries_points (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    metric TEXT NOT NULL,
    entity TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    value REAL NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_points_metric_entity_ts
ON timeseries_points(metric, entity, timestamp DESC);

-- Derived daily aggregates, updated in the same transaction as the point
CREATE TABLE IF NOT EXISTS daily_aggregates (
    metric TEXT NOT NULL,
    entity TEXT NOT NULL,
    date TEXT NOT NULL,
    min REAL NOT NULL,
    max REAL NOT NULL,
    avg REAL NOT NULL,
    last REAL NOT NULL,
    count INTEGER NOT NULL,
    PRIMARY KEY (metric, entity, date)
);
"#;

/// Normalize a username for storage and comparison.
///
/// Lower-cases and strips a leading `@`. Applied at every store
/// boundary so callers can pass usernames in any of the forms the
/// surface reports them.
pub fn normalize_username(username: &str) -> String {
    username.trim().trim_start_matches('@').to_lowercase()
}

/// Shared handle to the engine database.
///
/// Cloning is cheap; all clones share one connection.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create the database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create data dir {:?}", parent))?;
        }

        let conn = Connection::open(path.as_ref())
            .with_context(|| format!("Failed to open database at {:?}", path.as_ref()))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;

        info!(path = ?path.as_ref(), "Database opened");
        Ok(db)
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;

        debug!("In-memory database created");
        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(CREATE_TABLES_SQL)
            .context("Failed to initialize database schema")?;
        debug!("Database schema initialized");
        Ok(())
    }

    /// Action ledger store.
    pub fn ledger(&self) -> LedgerStore {
        LedgerStore::new(Arc::clone(&self.conn))
    }

    /// Membership snapshot store.
    pub fn snapshots(&self) -> SnapshotStore {
        SnapshotStore::new(Arc::clone(&self.conn))
    }

    /// Time series store.
    pub fn timeseries(&self) -> TimeSeriesStore {
        TimeSeriesStore::new(Arc::clone(&self.conn))
    }

    /// Batch session store.
    pub fn sessions(&self) -> SessionStore {
        SessionStore::new(Arc::clone(&self.conn))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_username() {
        assert_eq!(normalize_username("@Alice"), "alice");
        assert_eq!(normalize_username("  BOB  "), "bob");
        assert_eq!(normalize_username("carol"), "carol");
        assert_eq!(normalize_username("@@double"), "double");
    }

    #[test]
    fn test_in_memory_schema() {
        let db = Database::in_memory().unwrap();
        // All stores must be constructible over the initialized schema
        let _ = db.ledger();
        let _ = db.snapshots();
        let _ = db.timeseries();
        let _ = db.sessions();
    }

    #[test]
    fn test_open_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("flock.db");
        let db = Database::open(&path);
        assert!(db.is_ok());
        assert!(path.exists());
    }
}
