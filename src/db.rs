//! SQLite state shared by the lease queue, the VM registry and the event log
//!
//! Each store keeps one row per key and only ever does single-statement
//! replaces, so callers never need cross-row transactions.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::Connection;

/// How long a writer waits on a locked database before reporting contention
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle to the runner's SQLite database
///
/// Cloning is cheap; clones share one connection. Separate runner processes
/// (or tests simulating them) open their own `Database` on the same file and
/// rely on SQLite locking for claim atomicity.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl Database {
    /// Open (or create) the database file and ensure the schema exists
    pub fn open(path: impl AsRef<Path>) -> rusqlite::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open(&path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Private in-memory database, used by tests and `check-config`
    pub fn open_in_memory() -> rusqlite::Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        };
        db.init_schema()?;
        Ok(db)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        // A panic while holding the guard cannot leave SQLite half-written
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn init_schema(&self) -> rusqlite::Result<()> {
        self.conn().execute_batch(
            r#"
            PRAGMA journal_mode = WAL;

            CREATE TABLE IF NOT EXISTS job_leases (
              run_id TEXT PRIMARY KEY,
              runner_group TEXT NOT NULL,
              execution_context TEXT NOT NULL,
              claimed_at_ms INTEGER,
              created_at_ms INTEGER NOT NULL,
              expires_at_ms INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_job_leases_claimable
              ON job_leases (runner_group, claimed_at_ms, created_at_ms);

            CREATE INDEX IF NOT EXISTS idx_job_leases_expiry
              ON job_leases (expires_at_ms);

            CREATE TABLE IF NOT EXISTS vm_registrations (
              address TEXT PRIMARY KEY,
              run_id TEXT NOT NULL,
              sandbox_token TEXT NOT NULL,
              record TEXT NOT NULL,
              registered_at_ms INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_vm_registrations_token
              ON vm_registrations (sandbox_token);

            CREATE TABLE IF NOT EXISTS telemetry_events (
              run_id TEXT NOT NULL,
              sequence_number INTEGER NOT NULL,
              event_type TEXT NOT NULL,
              payload TEXT NOT NULL,
              created_at_ms INTEGER NOT NULL,
              PRIMARY KEY (run_id, sequence_number)
            );

            CREATE TABLE IF NOT EXISTS run_status (
              run_id TEXT PRIMARY KEY,
              status TEXT NOT NULL,
              detail TEXT,
              updated_at_ms INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS telemetry_records (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              run_id TEXT NOT NULL,
              kind TEXT NOT NULL,
              payload TEXT NOT NULL,
              created_at_ms INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_telemetry_records_run
              ON telemetry_records (run_id, kind, id);
            "#,
        )
    }
}

pub(crate) fn dt_to_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

pub(crate) fn ms_to_dt(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}
