//! Job Lease Queue - durable, at-most-one-claim work queue
//!
//! The control plane enqueues one row per run. Runners in the matching group
//! claim rows atomically; a claimed row is never handed out again. Rows carry
//! a hard TTL and are purged by the sweeper whether or not they completed.
//!
//! ```text
//!  enqueue ──► [unclaimed] ──claim──► [claimed] ──complete──► (deleted)
//!                  ▲                      │
//!                  └──────requeue─────────┘
//!
//!  any state ──expires_at passed──► sweep ──► (deleted)
//! ```
//!
//! There is no heartbeat: the TTL is a hard ceiling on job duration and the
//! supervisor enforces a job deadline below it.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use rusqlite::{params, ErrorCode, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::db::{dt_to_ms, ms_to_dt, Database};
use crate::metrics::{LEASES_SWEPT, LEASE_CLAIMS};

/// A queued job and its claim state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobLease {
    pub run_id: String,
    pub runner_group: String,
    /// Opaque to the runner: secrets, variables and run parameters
    pub execution_context: serde_json::Value,
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl JobLease {
    pub fn is_claimed(&self) -> bool {
        self.claimed_at.is_some()
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Time left before the sweeper may delete this row
    pub fn remaining_ttl(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).to_std().unwrap_or(Duration::ZERO)
    }
}

#[derive(Error, Debug)]
pub enum QueueError {
    /// The store was locked by another runner; retry with backoff
    #[error("lease store busy: {0}")]
    Contention(String),

    #[error("run {0} is already queued")]
    Duplicate(String),

    #[error("invalid lease request: {0}")]
    Invalid(String),

    #[error("stored execution context is not valid JSON: {0}")]
    Context(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(rusqlite::Error),
}

impl QueueError {
    pub fn is_contention(&self) -> bool {
        matches!(self, QueueError::Contention(_))
    }
}

impl From<rusqlite::Error> for QueueError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(err, _)
                if matches!(err.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
            {
                QueueError::Contention(e.to_string())
            }
            _ => QueueError::Database(e),
        }
    }
}

pub type Result<T> = std::result::Result<T, QueueError>;

const LEASE_COLUMNS: &str =
    "run_id, runner_group, execution_context, claimed_at_ms, created_at_ms, expires_at_ms";

/// SQLite-backed lease queue
#[derive(Clone)]
pub struct JobQueue {
    db: Database,
}

impl JobQueue {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Queue a run for `runner_group`, expiring `ttl` from now
    pub fn enqueue(
        &self,
        run_id: &str,
        runner_group: &str,
        execution_context: &serde_json::Value,
        ttl: Duration,
    ) -> Result<JobLease> {
        self.enqueue_at(run_id, runner_group, execution_context, ttl, Utc::now())
    }

    pub fn enqueue_at(
        &self,
        run_id: &str,
        runner_group: &str,
        execution_context: &serde_json::Value,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<JobLease> {
        if run_id.trim().is_empty() {
            return Err(QueueError::Invalid("run id is empty".into()));
        }
        if runner_group.trim().is_empty() {
            return Err(QueueError::Invalid("runner group is empty".into()));
        }
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|_| QueueError::Invalid("ttl out of range".into()))?;
        if ttl <= chrono::Duration::zero() {
            return Err(QueueError::Invalid("ttl must be positive".into()));
        }

        let lease = JobLease {
            run_id: run_id.to_string(),
            runner_group: runner_group.to_string(),
            execution_context: execution_context.clone(),
            claimed_at: None,
            created_at: now,
            expires_at: now + ttl,
        };

        let context = serde_json::to_string(&lease.execution_context)?;
        let inserted = self.db.conn().execute(
            "INSERT INTO job_leases
               (run_id, runner_group, execution_context, claimed_at_ms, created_at_ms, expires_at_ms)
             VALUES (?1, ?2, ?3, NULL, ?4, ?5)",
            params![
                lease.run_id,
                lease.runner_group,
                context,
                dt_to_ms(lease.created_at),
                dt_to_ms(lease.expires_at)
            ],
        );

        match inserted {
            Ok(_) => {
                info!(run_id, runner_group, ttl_secs = ttl.num_seconds(), "job enqueued");
                Ok(lease)
            }
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == ErrorCode::ConstraintViolation =>
            {
                Err(QueueError::Duplicate(run_id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Claim the oldest unclaimed, unexpired lease of the group
    ///
    /// Selection and marking happen in one UPDATE statement, so two runners
    /// racing on the same row cannot both see it as unclaimed.
    pub fn claim(&self, runner_group: &str) -> Result<Option<JobLease>> {
        self.claim_at(runner_group, Utc::now())
    }

    pub fn claim_at(&self, runner_group: &str, now: DateTime<Utc>) -> Result<Option<JobLease>> {
        let sql = format!(
            "UPDATE job_leases SET claimed_at_ms = ?2
             WHERE run_id = (
               SELECT run_id FROM job_leases
               WHERE runner_group = ?1 AND claimed_at_ms IS NULL AND expires_at_ms > ?2
               ORDER BY created_at_ms, run_id
               LIMIT 1
             )
             AND claimed_at_ms IS NULL
             RETURNING {LEASE_COLUMNS}"
        );

        let claimed = self
            .db
            .conn()
            .query_row(&sql, params![runner_group, dt_to_ms(now)], read_row)
            .optional();

        match claimed {
            Ok(Some(raw)) => {
                LEASE_CLAIMS.with_label_values(&["claimed"]).inc();
                let lease = raw.into_lease()?;
                debug!(run_id = %lease.run_id, runner_group, "lease claimed");
                Ok(Some(lease))
            }
            Ok(None) => {
                LEASE_CLAIMS.with_label_values(&["empty"]).inc();
                Ok(None)
            }
            Err(e) => {
                let err = QueueError::from(e);
                if err.is_contention() {
                    LEASE_CLAIMS.with_label_values(&["contention"]).inc();
                }
                Err(err)
            }
        }
    }

    /// Delete a lease. Completing an unknown run is not an error.
    pub fn complete(&self, run_id: &str) -> Result<bool> {
        let deleted = self
            .db
            .conn()
            .execute("DELETE FROM job_leases WHERE run_id = ?1", params![run_id])?;
        if deleted > 0 {
            debug!(run_id, "lease completed");
        }
        Ok(deleted > 0)
    }

    /// Put a claimed lease back so another runner (or this one) can claim it
    pub fn requeue(&self, run_id: &str) -> Result<bool> {
        let updated = self.db.conn().execute(
            "UPDATE job_leases SET claimed_at_ms = NULL WHERE run_id = ?1",
            params![run_id],
        )?;
        if updated > 0 {
            info!(run_id, "lease returned to queue");
        }
        Ok(updated > 0)
    }

    /// Delete every lease whose TTL has passed, claimed or not
    pub fn sweep_expired(&self) -> Result<usize> {
        self.sweep_expired_at(Utc::now())
    }

    pub fn sweep_expired_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let deleted = self.db.conn().execute(
            "DELETE FROM job_leases WHERE expires_at_ms <= ?1",
            params![dt_to_ms(now)],
        )?;
        if deleted > 0 {
            LEASES_SWEPT.inc_by(deleted as f64);
            info!(deleted, "expired leases swept");
        }
        Ok(deleted)
    }

    pub fn get(&self, run_id: &str) -> Result<Option<JobLease>> {
        let sql = format!("SELECT {LEASE_COLUMNS} FROM job_leases WHERE run_id = ?1");
        let raw = self
            .db
            .conn()
            .query_row(&sql, params![run_id], read_row)
            .optional()?;
        raw.map(RawLease::into_lease).transpose()
    }

    /// Count of leases the group could claim right now
    pub fn pending_count(&self, runner_group: &str) -> Result<usize> {
        let count: i64 = self.db.conn().query_row(
            "SELECT COUNT(*) FROM job_leases
             WHERE runner_group = ?1 AND claimed_at_ms IS NULL AND expires_at_ms > ?2",
            params![runner_group, dt_to_ms(Utc::now())],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

struct RawLease {
    run_id: String,
    runner_group: String,
    execution_context: String,
    claimed_at_ms: Option<i64>,
    created_at_ms: i64,
    expires_at_ms: i64,
}

impl RawLease {
    fn into_lease(self) -> Result<JobLease> {
        Ok(JobLease {
            run_id: self.run_id,
            runner_group: self.runner_group,
            execution_context: serde_json::from_str(&self.execution_context)?,
            claimed_at: self.claimed_at_ms.map(ms_to_dt),
            created_at: ms_to_dt(self.created_at_ms),
            expires_at: ms_to_dt(self.expires_at_ms),
        })
    }
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<RawLease> {
    Ok(RawLease {
        run_id: row.get(0)?,
        runner_group: row.get(1)?,
        execution_context: row.get(2)?,
        claimed_at_ms: row.get(3)?,
        created_at_ms: row.get(4)?,
        expires_at_ms: row.get(5)?,
    })
}

/// Exponential backoff with full jitter for claim retries
///
/// Returns a random duration in `[0, min(max, base * 2^attempt)]`, so runners
/// that collided once spread out instead of colliding again.
pub fn jittered_backoff(attempt: u32, base: Duration, max: Duration) -> Duration {
    let exp = base.saturating_mul(1u32 << attempt.min(16));
    let ceiling = exp.min(max);
    let millis = ceiling.as_millis() as u64;
    if millis == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=millis))
}

/// Start the background TTL sweeper
pub fn start_sweeper(
    queue: Arc<JobQueue>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let queue = Arc::clone(&queue);
            match tokio::task::spawn_blocking(move || queue.sweep_expired()).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) if e.is_contention() => debug!(error = %e, "sweep deferred"),
                Ok(Err(e)) => warn!(error = %e, "lease sweep failed"),
                Err(e) => warn!(error = %e, "lease sweep task panicked"),
            }
        }
        debug!("lease sweeper stopped");
    })
}
