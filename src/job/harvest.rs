//! Harvest job: pulls one source's records into the local store.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;
use uuid::Uuid;

use crate::checkpoint::CheckpointFields;
use crate::harvest::Paginator;
use crate::records::RecordStore;
use crate::source::SourceAdapter;
use crate::txn::{Propagation, TxScope};

use super::{Chunk, ChunkFeed, ChunkKind, ChunkPayload, ChunkStats, JobError, SyncJob};

/// Checkpoint process name for harvest runs.
pub const HARVEST_PROCESS: &str = "harvest";

/// Resumable harvest of one source.
#[derive(Debug)]
pub struct HarvestJob {
    adapter: Arc<dyn SourceAdapter>,
    records: RecordStore,
    page_size: u32,
}

impl HarvestJob {
    #[must_use]
    pub fn new(adapter: Arc<dyn SourceAdapter>, records: RecordStore, page_size: u32) -> Self {
        Self {
            adapter,
            records,
            page_size,
        }
    }

    fn feed(&self, prior: Option<&CheckpointFields>) -> Result<Box<dyn ChunkFeed>, JobError> {
        let paginator = Paginator::new(Arc::clone(&self.adapter), self.page_size, prior)?;
        Ok(Box::new(HarvestFeed {
            job: self.name(),
            paginator,
        }))
    }
}

#[async_trait]
impl SyncJob for HarvestJob {
    fn name(&self) -> String {
        format!("harvest:{}", self.adapter.system_id())
    }

    fn owner_id(&self) -> Uuid {
        self.adapter.owner_id()
    }

    fn process_name(&self) -> &str {
        HARVEST_PROCESS
    }

    fn accepted_kinds(&self) -> &'static [ChunkKind] {
        &[ChunkKind::Harvest]
    }

    async fn start(&self) -> Result<Box<dyn ChunkFeed>, JobError> {
        self.feed(None)
    }

    async fn resume(&self, prior: CheckpointFields) -> Result<Box<dyn ChunkFeed>, JobError> {
        self.feed(Some(&prior))
    }

    async fn process_chunk(
        &self,
        scope: &mut TxScope,
        chunk: &Chunk,
    ) -> Result<ChunkStats, JobError> {
        scope.check(Propagation::Mandatory).map_err(JobError::from)?;

        let ChunkPayload::Bibs(records) = &chunk.payload else {
            return Err(JobError::UnsupportedKind { kind: chunk.kind });
        };

        let system = self.adapter.system_id();
        for record in records {
            self.records.upsert_bib(scope, system, record).await?;
        }

        Ok(ChunkStats {
            records: records.len() as u64,
            errors: 0,
        })
    }
}

/// Adapts the paginator's pages into chunks.
struct HarvestFeed {
    job: String,
    paginator: Paginator,
}

#[async_trait]
impl ChunkFeed for HarvestFeed {
    async fn next_chunk(&mut self) -> Result<Option<Chunk>, JobError> {
        let Some(page) = self.paginator.next_page().await? else {
            return Ok(None);
        };

        if page.is_last && page.records.is_empty() {
            // Nothing left to write, but the exhaustion cursor still has to
            // land so the next run sweeps deltas instead of re-bootstrapping
            warn!(job = %self.job, "final page was empty");
        }

        Ok(Some(Chunk {
            job: self.job.clone(),
            kind: ChunkKind::Harvest,
            is_last: page.is_last,
            checkpoint: page.checkpoint,
            payload: ChunkPayload::Bibs(page.records),
        }))
    }
}
