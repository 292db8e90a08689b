//! Durable per-job progress state.
//!
//! A checkpoint is an opaque map of scalar fields keyed by the owning
//! context id and a process name. The engine interprets only the `cursor`
//! field; everything else is pass-through state a source adapter may stash
//! alongside it (a derived watermark, a continuation token). Checkpoints are
//! read once at job start and rewritten once per processed chunk, inside the
//! chunk's transaction, so progress and side effects commit together.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use uuid::Uuid;

use crate::db::Database;
use crate::txn::{TxError, TxScope};

/// The one field name the engine interprets structurally.
pub const CURSOR_FIELD: &str = "cursor";

/// Opaque checkpoint state. Ordered map so encoded forms are stable.
pub type CheckpointFields = BTreeMap<String, serde_json::Value>;

/// Checkpoint persistence errors.
#[derive(Error, Debug)]
pub enum CheckpointError {
    /// Underlying database failure.
    #[error("checkpoint query failed: {0}")]
    Database(#[from] sqlx::Error),

    /// The stored field map could not be encoded or decoded.
    #[error("checkpoint fields are not valid JSON: {0}")]
    Fields(#[from] serde_json::Error),

    /// The write was attempted outside an open transaction.
    #[error(transparent)]
    Transaction(#[from] TxError),
}

/// A stored checkpoint row, for the operator status surface.
#[derive(Debug, Clone)]
pub struct CheckpointEntry {
    pub owner_id: Uuid,
    pub process: String,
    pub fields: CheckpointFields,
    pub updated_at_millis: i64,
}

/// Durable key-value progress store keyed by `(owner_id, process)`.
///
/// Reads are read-your-writes consistent within one instance; exclusion
/// across instances is the run lock's job, not this store's.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Loads the field map for an `(owner, process)` pair, if any run has
    /// ever persisted one.
    async fn get_state_map(
        &self,
        owner: Uuid,
        process: &str,
    ) -> Result<Option<CheckpointFields>, CheckpointError>;

    /// Replaces the stored field map inside the caller's open transaction.
    ///
    /// The scope must be transactional; a non-transactional scope is a
    /// contract violation and the write is refused.
    async fn update_state(
        &self,
        scope: &mut TxScope,
        owner: Uuid,
        process: &str,
        fields: &CheckpointFields,
    ) -> Result<(), CheckpointError>;
}

/// SQLite-backed checkpoint store.
#[derive(Debug, Clone)]
pub struct SqliteCheckpointStore {
    db: Database,
}

impl SqliteCheckpointStore {
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Lists all stored checkpoints, most recently updated first.
    ///
    /// # Errors
    ///
    /// Returns `CheckpointError::Database` if the query fails, or
    /// `CheckpointError::Fields` if a stored map fails to decode.
    pub async fn list(&self) -> Result<Vec<CheckpointEntry>, CheckpointError> {
        let rows: Vec<(String, String, String, i64)> = sqlx::query_as(
            "SELECT owner_id, process, fields, updated_at \
             FROM checkpoints ORDER BY updated_at DESC",
        )
        .fetch_all(self.db.pool())
        .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for (owner_id, process, fields, updated_at_millis) in rows {
            let owner_id = owner_id
                .parse::<Uuid>()
                .map_err(|e| CheckpointError::Database(sqlx::Error::Decode(Box::new(e))))?;
            entries.push(CheckpointEntry {
                owner_id,
                process,
                fields: serde_json::from_str(&fields)?,
                updated_at_millis,
            });
        }
        Ok(entries)
    }

    /// Deletes a checkpoint so the next run starts a fresh bootstrap.
    ///
    /// Returns `true` if a row existed. This is the explicit administrative
    /// reset; nothing in the engine itself ever deletes a checkpoint.
    ///
    /// # Errors
    ///
    /// Returns `CheckpointError::Database` if the delete fails.
    pub async fn reset(&self, owner: Uuid, process: &str) -> Result<bool, CheckpointError> {
        let result = sqlx::query("DELETE FROM checkpoints WHERE owner_id = ?1 AND process = ?2")
            .bind(owner.to_string())
            .bind(process)
            .execute(self.db.pool())
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn get_state_map(
        &self,
        owner: Uuid,
        process: &str,
    ) -> Result<Option<CheckpointFields>, CheckpointError> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT fields FROM checkpoints WHERE owner_id = ?1 AND process = ?2",
        )
        .bind(owner.to_string())
        .bind(process)
        .fetch_optional(self.db.pool())
        .await?;

        match row {
            Some((raw,)) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn update_state(
        &self,
        scope: &mut TxScope,
        owner: Uuid,
        process: &str,
        fields: &CheckpointFields,
    ) -> Result<(), CheckpointError> {
        let encoded = serde_json::to_string(fields)?;
        let now = Utc::now().timestamp_millis();

        let conn = scope.transaction()?;
        sqlx::query(
            "INSERT INTO checkpoints (owner_id, process, fields, updated_at) \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT (owner_id, process) DO UPDATE SET \
                 fields = excluded.fields, updated_at = excluded.updated_at",
        )
        .bind(owner.to_string())
        .bind(process)
        .bind(encoded)
        .bind(now)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }
}
