//! Availability recheck job: refreshes stale holdings across all sources.
//!
//! The stale set is computed against a cutoff fixed at sweep start, and every
//! processed record gets a fresh `checked_at` whether the lookup succeeded or
//! not. Each batch query therefore returns a strictly shrinking set, so the
//! sweep needs no offset bookkeeping: it always reads "the next stale batch"
//! until the set runs dry.
//!
//! Lookups fan out through the throttled dispatcher so the sweep never
//! hammers host systems that are busy serving patrons; snapshots land
//! through the write throttle outside the chunk transaction, because an
//! availability row surviving a rolled-back chunk is harmless.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::checkpoint::{CURSOR_FIELD, CheckpointFields};
use crate::dispatch::{ItemOutcome, ThrottledDispatcher, WriteThrottle};
use crate::harvest::Cursor;
use crate::records::{BibRecord, RecordStore};
use crate::source::{SourceAdapter, SourceError};
use crate::txn::{Propagation, TxScope};

use super::{Chunk, ChunkFeed, ChunkKind, ChunkPayload, ChunkStats, JobError, SyncJob};

/// Checkpoint process name for recheck runs.
pub const RECHECK_PROCESS: &str = "availability-recheck";

/// Periodic refresh of availability snapshots for records whose last check
/// has aged out.
pub struct RecheckJob {
    adapters: Arc<HashMap<String, Arc<dyn SourceAdapter>>>,
    records: RecordStore,
    dispatcher: Arc<ThrottledDispatcher>,
    writes: WriteThrottle,
    batch_size: u32,
    grace: Duration,
}

impl RecheckJob {
    #[must_use]
    pub fn new(
        adapters: Arc<HashMap<String, Arc<dyn SourceAdapter>>>,
        records: RecordStore,
        dispatcher: Arc<ThrottledDispatcher>,
        writes: WriteThrottle,
        batch_size: u32,
        grace: Duration,
    ) -> Self {
        Self {
            adapters,
            records,
            dispatcher,
            writes,
            batch_size,
            grace,
        }
    }

    fn feed(&self, prior: Option<&CheckpointFields>) -> Box<dyn ChunkFeed> {
        let request_start = chrono::Utc::now().timestamp_millis();
        let grace_millis = i64::try_from(self.grace.as_millis()).unwrap_or(i64::MAX);

        // A mid-sweep checkpoint only carries how far the last sweep got;
        // the cutoff is always computed fresh so a resumed sweep never
        // rechecks what the interrupted one already covered
        let processed = match Cursor::from_fields(prior) {
            Cursor::Bootstrap { offset } => offset,
            Cursor::Delta { .. } => 0,
        };

        Box::new(RecheckFeed {
            records: self.records.clone(),
            batch_size: self.batch_size,
            cutoff_millis: request_start.saturating_sub(grace_millis),
            request_start_millis: request_start,
            processed,
            finished: false,
        })
    }
}

#[async_trait]
impl SyncJob for RecheckJob {
    fn name(&self) -> String {
        RECHECK_PROCESS.to_string()
    }

    fn owner_id(&self) -> Uuid {
        // The sweep spans every source, so its checkpoint lives under the
        // engine-wide nil owner rather than any one source's context
        Uuid::nil()
    }

    fn process_name(&self) -> &str {
        RECHECK_PROCESS
    }

    fn accepted_kinds(&self) -> &'static [ChunkKind] {
        &[ChunkKind::AvailabilityRecheck]
    }

    async fn start(&self) -> Result<Box<dyn ChunkFeed>, JobError> {
        Ok(self.feed(None))
    }

    async fn resume(&self, prior: CheckpointFields) -> Result<Box<dyn ChunkFeed>, JobError> {
        Ok(self.feed(Some(&prior)))
    }

    async fn process_chunk(
        &self,
        scope: &mut TxScope,
        chunk: &Chunk,
    ) -> Result<ChunkStats, JobError> {
        scope.check(Propagation::Mandatory)?;

        let ChunkPayload::Rechecks(rows) = &chunk.payload else {
            return Err(JobError::UnsupportedKind { kind: chunk.kind });
        };
        if rows.is_empty() {
            return Ok(ChunkStats::default());
        }

        // Phase one: fan the lookups out across sources under the throttles
        let items: Vec<(String, BibRecord)> = rows
            .iter()
            .map(|row| (row.source_system.clone(), row.clone()))
            .collect();
        let adapters = Arc::clone(&self.adapters);
        let outcomes = self
            .dispatcher
            .dispatch(items, move |system, row: BibRecord| {
                let adapters = Arc::clone(&adapters);
                async move {
                    let Some(adapter) = adapters.get(&system) else {
                        return Err(SourceError::disabled(&system));
                    };
                    adapter.fetch_availability(&row.source_record_id).await
                }
            })
            .await;

        let lookup_failures = outcomes.iter().filter(|o| !o.is_done()).count();
        if lookup_failures > 0 {
            debug!(
                failed = lookup_failures,
                total = rows.len(),
                "some availability lookups failed, storing error markers"
            );
        }

        // Phase two: persist snapshots and error markers in throttled batches
        let write_items: Vec<(i64, ItemOutcome<_>)> =
            rows.iter().map(|row| row.id).zip(outcomes).collect();
        let records = &self.records;
        let results = self
            .writes
            .run(write_items, move |(bib_id, outcome)| async move {
                match outcome {
                    ItemOutcome::Done(snapshot) => {
                        records.record_availability(bib_id, &snapshot).await
                    }
                    ItemOutcome::Failed { error } => {
                        records.record_availability_error(bib_id, &error).await
                    }
                }
            })
            .await;

        let write_failures = results.iter().filter(|o| !o.is_done()).count();
        if write_failures == rows.len() {
            return Err(JobError::ChunkWritesFailed { count: write_failures });
        }
        if write_failures > 0 {
            warn!(
                failed = write_failures,
                total = rows.len(),
                "some availability writes failed, those records stay stale"
            );
        }

        Ok(ChunkStats {
            records: rows.len() as u64,
            errors: (lookup_failures + write_failures) as u64,
        })
    }
}

/// Feeds batches of stale records until the stale set runs dry.
struct RecheckFeed {
    records: RecordStore,
    batch_size: u32,
    cutoff_millis: i64,
    request_start_millis: i64,
    processed: u64,
    finished: bool,
}

#[async_trait]
impl ChunkFeed for RecheckFeed {
    async fn next_chunk(&mut self) -> Result<Option<Chunk>, JobError> {
        if self.finished {
            return Ok(None);
        }

        let rows = self
            .records
            .stale_records(self.cutoff_millis, self.batch_size)
            .await?;

        let is_last = rows.len() < self.batch_size as usize;
        self.processed += rows.len() as u64;

        let cursor = if is_last {
            self.finished = true;
            Cursor::Delta {
                since_millis: self.request_start_millis,
                offset: 0,
            }
        } else {
            Cursor::Bootstrap {
                offset: self.processed,
            }
        };

        let mut checkpoint = CheckpointFields::new();
        checkpoint.insert(
            CURSOR_FIELD.to_string(),
            serde_json::Value::String(cursor.encode()),
        );

        Ok(Some(Chunk {
            job: RECHECK_PROCESS.to_string(),
            kind: ChunkKind::AvailabilityRecheck,
            is_last,
            checkpoint,
            payload: ChunkPayload::Rechecks(rows),
        }))
    }
}
