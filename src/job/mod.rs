//! Resumable sync jobs and the runner that drives them.
//!
//! A job turns into a feed of chunks; the runner processes each chunk inside
//! its own transaction and persists the chunk's checkpoint in that same
//! transaction, strictly after the chunk's work. A crash between chunks
//! replays at most one chunk on the next run. Duplicate work over lost work.

mod harvest;
mod recheck;
mod runner;

pub use harvest::{HARVEST_PROCESS, HarvestJob};
pub use recheck::{RECHECK_PROCESS, RecheckJob};
pub use runner::{JobRunner, RunOutcome, RunSummary};

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::checkpoint::{CheckpointError, CheckpointFields};
use crate::harvest::HarvestError;
use crate::records::{BibRecord, RecordError};
use crate::source::SourceRecord;
use crate::txn::{TxError, TxScope};

/// What kind of work a chunk carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    /// Harvested records to upsert.
    Harvest,
    /// Stored records whose availability needs rechecking.
    AvailabilityRecheck,
}

/// The records inside a chunk.
#[derive(Debug)]
pub enum ChunkPayload {
    Bibs(Vec<SourceRecord>),
    Rechecks(Vec<BibRecord>),
}

impl ChunkPayload {
    /// Number of records in the chunk.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Bibs(records) => records.len(),
            Self::Rechecks(rows) => rows.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One unit of work plus the checkpoint that makes it durable.
#[derive(Debug)]
pub struct Chunk {
    /// Job name, for logging.
    pub job: String,
    pub kind: ChunkKind,
    /// Hint that the feed is exhausted after this chunk. Purely advisory;
    /// the feed returning `None` is what actually ends the run.
    pub is_last: bool,
    /// Checkpoint fields to persist once this chunk is processed.
    pub checkpoint: CheckpointFields,
    pub payload: ChunkPayload,
}

/// Per-chunk processing counts.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChunkStats {
    /// Records processed in the chunk.
    pub records: u64,
    /// Per-item failures that were recorded as markers rather than aborting.
    pub errors: u64,
}

/// Job failures that end a run.
#[derive(Error, Debug)]
pub enum JobError {
    #[error(transparent)]
    Harvest(#[from] HarvestError),

    #[error(transparent)]
    Records(#[from] RecordError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Transaction(#[from] TxError),

    /// A chunk of a kind this job never produces reached it. This is a
    /// wiring bug, not a data problem.
    #[error("job cannot process a {kind:?} chunk")]
    UnsupportedKind { kind: ChunkKind },

    /// Every write in a chunk failed. Single failed writes are absorbed as
    /// markers; losing the whole chunk means the store itself is unhealthy.
    #[error("all {count} writes in the chunk failed")]
    ChunkWritesFailed { count: usize },
}

/// A stream of chunks for one run.
#[async_trait]
pub trait ChunkFeed: Send {
    /// Produces the next chunk, or `None` once the work is exhausted.
    async fn next_chunk(&mut self) -> Result<Option<Chunk>, JobError>;
}

/// A resumable sync job.
///
/// `process_chunk` is always called with an open transaction; the runner
/// commits the chunk's effects and its checkpoint together.
#[async_trait]
pub trait SyncJob: Send + Sync {
    /// Unique job name, also the run lock name.
    fn name(&self) -> String;

    /// Owning context the checkpoint is keyed under.
    fn owner_id(&self) -> Uuid;

    /// Process name the checkpoint is keyed under.
    fn process_name(&self) -> &str;

    /// Chunk kinds this job knows how to process.
    fn accepted_kinds(&self) -> &'static [ChunkKind];

    /// Builds the chunk feed for a first-ever run.
    async fn start(&self) -> Result<Box<dyn ChunkFeed>, JobError>;

    /// Builds the chunk feed resuming from persisted checkpoint fields.
    async fn resume(&self, prior: CheckpointFields) -> Result<Box<dyn ChunkFeed>, JobError>;

    /// Processes one chunk inside the runner's open transaction.
    async fn process_chunk(
        &self,
        scope: &mut TxScope,
        chunk: &Chunk,
    ) -> Result<ChunkStats, JobError>;
}
