//! Storage for harvested bib records, availability snapshots, and run history.
//!
//! Bib upserts ride inside the chunk transaction so a chunk's records and its
//! checkpoint commit together. Availability writes go straight to the pool:
//! they are idempotent per record, and a snapshot surviving a rolled-back
//! chunk only means the record drops out of the stale set early, which the
//! at-least-once model tolerates.

use sqlx::FromRow;
use thiserror::Error;
use tracing::instrument;

use crate::db::Database;
use crate::source::{AvailabilitySnapshot, SourceRecord};
use crate::txn::{TxError, TxScope};

/// Record store errors.
#[derive(Error, Debug)]
pub enum RecordError {
    /// Underlying database failure.
    #[error("record query failed: {0}")]
    Database(#[from] sqlx::Error),

    /// The write was attempted outside an open transaction.
    #[error(transparent)]
    Transaction(#[from] TxError),
}

/// A harvested bibliographic record as stored.
#[derive(Debug, Clone, FromRow)]
pub struct BibRecord {
    /// Row id, referenced by the availability table.
    pub id: i64,
    /// Which host system the record came from.
    pub source_system: String,
    /// The record's id within its host system.
    pub source_record_id: String,
    /// Title when the source provided one.
    pub title: Option<String>,
    /// Author when the source provided one.
    pub author: Option<String>,
}

/// One finished run, for the operator status surface.
#[derive(Debug, Clone, FromRow)]
pub struct RunLogEntry {
    pub job: String,
    pub started_at: i64,
    pub finished_at: i64,
    pub chunks: i64,
    pub records: i64,
    pub errors: i64,
    pub outcome: String,
}

/// SQLite-backed store for records and their availability.
#[derive(Debug, Clone)]
pub struct RecordStore {
    db: Database,
}

impl RecordStore {
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Inserts or refreshes one harvested record inside the caller's open
    /// transaction. Re-harvesting an unchanged record is a no-op apart from
    /// the refreshed timestamp.
    ///
    /// # Errors
    ///
    /// Returns `RecordError::Transaction` when the scope is not
    /// transactional, or `RecordError::Database` when the write fails.
    pub async fn upsert_bib(
        &self,
        scope: &mut TxScope,
        source_system: &str,
        record: &SourceRecord,
    ) -> Result<(), RecordError> {
        let now = chrono::Utc::now().timestamp_millis();
        let raw = record.raw.to_string();

        let conn = scope.transaction()?;
        sqlx::query(
            "INSERT INTO bib_records \
                 (source_system, source_record_id, title, author, raw, first_seen_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6) \
             ON CONFLICT (source_system, source_record_id) DO UPDATE SET \
                 title = excluded.title, \
                 author = excluded.author, \
                 raw = excluded.raw, \
                 updated_at = excluded.updated_at",
        )
        .bind(source_system)
        .bind(&record.source_record_id)
        .bind(&record.title)
        .bind(&record.author)
        .bind(raw)
        .bind(now)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    /// Stores a fresh availability snapshot for one record.
    #[instrument(skip(self, snapshot))]
    pub async fn record_availability(
        &self,
        bib_id: i64,
        snapshot: &AvailabilitySnapshot,
    ) -> Result<(), RecordError> {
        let now = chrono::Utc::now().timestamp_millis();

        sqlx::query(
            "INSERT INTO availability \
                 (bib_id, copies_total, copies_available, status, error, checked_at) \
             VALUES (?1, ?2, ?3, ?4, NULL, ?5) \
             ON CONFLICT (bib_id) DO UPDATE SET \
                 copies_total = excluded.copies_total, \
                 copies_available = excluded.copies_available, \
                 status = excluded.status, \
                 error = NULL, \
                 checked_at = excluded.checked_at",
        )
        .bind(bib_id)
        .bind(snapshot.copies_total)
        .bind(snapshot.copies_available)
        .bind(&snapshot.status)
        .bind(now)
        .execute(self.db.pool())
        .await?;

        Ok(())
    }

    /// Stores a failed lookup as an error marker. The marker still advances
    /// `checked_at`, so a record that keeps failing leaves the stale set
    /// until the next sweep instead of wedging it.
    #[instrument(skip(self))]
    pub async fn record_availability_error(
        &self,
        bib_id: i64,
        error: &str,
    ) -> Result<(), RecordError> {
        let now = chrono::Utc::now().timestamp_millis();

        sqlx::query(
            "INSERT INTO availability \
                 (bib_id, copies_total, copies_available, status, error, checked_at) \
             VALUES (?1, 0, 0, 'error', ?2, ?3) \
             ON CONFLICT (bib_id) DO UPDATE SET \
                 copies_total = 0, \
                 copies_available = 0, \
                 status = 'error', \
                 error = excluded.error, \
                 checked_at = excluded.checked_at",
        )
        .bind(bib_id)
        .bind(error)
        .bind(now)
        .execute(self.db.pool())
        .await?;

        Ok(())
    }

    /// Records whose availability was last checked before the cutoff, or
    /// never checked at all, oldest check first. Every processed record gets
    /// a fresh `checked_at`, so repeated calls with the same cutoff walk a
    /// shrinking set until it empties.
    pub async fn stale_records(
        &self,
        checked_before_millis: i64,
        limit: u32,
    ) -> Result<Vec<BibRecord>, RecordError> {
        let rows = sqlx::query_as::<_, BibRecord>(
            "SELECT b.id, b.source_system, b.source_record_id, b.title, b.author \
             FROM bib_records b \
             LEFT JOIN availability a ON a.bib_id = b.id \
             WHERE a.checked_at IS NULL OR a.checked_at < ?1 \
             ORDER BY a.checked_at IS NOT NULL, a.checked_at, b.id \
             LIMIT ?2",
        )
        .bind(checked_before_millis)
        .bind(limit)
        .fetch_all(self.db.pool())
        .await?;

        Ok(rows)
    }

    /// Record counts per source system, for the status surface.
    pub async fn source_counts(&self) -> Result<Vec<(String, i64)>, RecordError> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            "SELECT source_system, COUNT(*) FROM bib_records \
             GROUP BY source_system ORDER BY source_system",
        )
        .fetch_all(self.db.pool())
        .await?;

        Ok(rows)
    }

    /// Appends one run to the history log.
    pub async fn log_run(&self, entry: &RunLogEntry) -> Result<(), RecordError> {
        sqlx::query(
            "INSERT INTO run_log \
                 (job, started_at, finished_at, chunks, records, errors, outcome) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(&entry.job)
        .bind(entry.started_at)
        .bind(entry.finished_at)
        .bind(entry.chunks)
        .bind(entry.records)
        .bind(entry.errors)
        .bind(&entry.outcome)
        .execute(self.db.pool())
        .await?;

        Ok(())
    }

    /// Most recent runs, newest first.
    pub async fn recent_runs(&self, limit: u32) -> Result<Vec<RunLogEntry>, RecordError> {
        let rows = sqlx::query_as::<_, RunLogEntry>(
            "SELECT job, started_at, finished_at, chunks, records, errors, outcome \
             FROM run_log ORDER BY started_at DESC, id DESC LIMIT ?1",
        )
        .bind(limit)
        .fetch_all(self.db.pool())
        .await?;

        Ok(rows)
    }
}
