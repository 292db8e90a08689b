//! Instance-wide run leases.
//!
//! A job name maps to one lease row. Acquiring is a single conditional
//! upsert: it succeeds when no row exists or the existing lease has expired,
//! so a crashed holder blocks the job only until its lease runs out. Losing
//! a lease mid-run means another instance may duplicate some work, which the
//! checkpoint model already tolerates; a wedged job is the outcome the lease
//! exists to prevent.

use std::time::Duration;

use thiserror::Error;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::db::Database;

/// Lease errors.
#[derive(Error, Debug)]
pub enum LockError {
    /// Underlying database failure.
    #[error("run lock query failed: {0}")]
    Database(#[from] sqlx::Error),
}

/// Lease-based mutual exclusion for named jobs.
#[derive(Debug, Clone)]
pub struct RunLock {
    db: Database,
    /// Identity of this instance, written into every lease it takes.
    holder: Uuid,
    ttl: Duration,
}

impl RunLock {
    #[must_use]
    pub fn new(db: Database, ttl: Duration) -> Self {
        Self {
            db,
            holder: Uuid::new_v4(),
            ttl,
        }
    }

    /// This instance's lease identity.
    #[must_use]
    pub fn holder(&self) -> Uuid {
        self.holder
    }

    /// Tries to take the lease for `name`. Returns `false` when another
    /// holder's lease is still live.
    ///
    /// # Errors
    ///
    /// Returns `LockError::Database` if the upsert fails.
    pub async fn try_acquire(&self, name: &str) -> Result<bool, LockError> {
        let now = chrono::Utc::now().timestamp_millis();
        let expires_at = now + i64::try_from(self.ttl.as_millis()).unwrap_or(i64::MAX);

        let result = sqlx::query(
            "INSERT INTO run_locks (name, holder, acquired_at, expires_at) \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT (name) DO UPDATE SET \
                 holder = excluded.holder, \
                 acquired_at = excluded.acquired_at, \
                 expires_at = excluded.expires_at \
             WHERE run_locks.expires_at < ?3 OR run_locks.holder = ?2",
        )
        .bind(name)
        .bind(self.holder.to_string())
        .bind(now)
        .bind(expires_at)
        .execute(self.db.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Releases the lease if this instance still holds it.
    ///
    /// # Errors
    ///
    /// Returns `LockError::Database` if the delete fails.
    pub async fn release(&self, name: &str) -> Result<(), LockError> {
        sqlx::query("DELETE FROM run_locks WHERE name = ?1 AND holder = ?2")
            .bind(name)
            .bind(self.holder.to_string())
            .execute(self.db.pool())
            .await?;

        Ok(())
    }

    /// Runs `work` under the lease, or skips it when another instance holds
    /// the lease. A skip is normal operation, not an error.
    ///
    /// # Errors
    ///
    /// Returns `LockError::Database` if acquiring the lease fails.
    #[instrument(skip(self, work))]
    pub async fn with_lock<T, F, Fut>(&self, name: &str, work: F) -> Result<Option<T>, LockError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = T>,
    {
        if !self.try_acquire(name).await? {
            info!(lock = name, "already running elsewhere, skipping this trigger");
            return Ok(None);
        }

        let output = work().await;

        // The lease expires on its own if this delete is lost
        if let Err(e) = self.release(name).await {
            warn!(lock = name, error = %e, "failed to release run lock");
        }

        Ok(Some(output))
    }
}
