//! Drives a job chunk by chunk with transactional checkpoints.

use std::sync::Arc;

use tracing::{debug, error, info, instrument, warn};

use crate::checkpoint::CheckpointStore;
use crate::db::Database;
use crate::harvest::Cursor;
use crate::records::{RecordStore, RunLogEntry};
use crate::txn::{Propagation, TxScope, UnitOutcome};

use super::SyncJob;

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The feed ran dry; the source is fully synced for now.
    Exhausted,
    /// The run stopped early at a chunk boundary and left a resumable
    /// checkpoint behind.
    Yielded,
    /// The run hit an error it could not absorb.
    Failed,
}

impl RunOutcome {
    /// Stable form stored in the run log.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Exhausted => "exhausted",
            Self::Yielded => "yielded",
            Self::Failed => "failed",
        }
    }
}

/// Counts and timing for one finished run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub job: String,
    pub outcome: RunOutcome,
    pub chunks: u64,
    pub records: u64,
    /// Per-item failures absorbed as markers during the run.
    pub errors: u64,
    pub started_at_millis: i64,
    pub finished_at_millis: i64,
}

impl RunSummary {
    /// Wall time the run took.
    #[must_use]
    pub fn elapsed_millis(&self) -> i64 {
        self.finished_at_millis - self.started_at_millis
    }
}

/// Runs jobs: loads their checkpoint, feeds chunks through per-chunk
/// transactions, and records the outcome.
pub struct JobRunner {
    db: Database,
    checkpoints: Arc<dyn CheckpointStore>,
    records: RecordStore,
}

impl JobRunner {
    #[must_use]
    pub fn new(db: Database, checkpoints: Arc<dyn CheckpointStore>, records: RecordStore) -> Self {
        Self {
            db,
            checkpoints,
            records,
        }
    }

    /// Runs one job to exhaustion, yield, or failure.
    ///
    /// `should_yield` is polled between chunks; returning `true` ends the
    /// run at the next chunk boundary with its checkpoint already durable.
    /// Failures are reported through the summary, never panicked.
    #[instrument(skip_all, fields(job = %job.name()))]
    pub async fn run<F>(&self, job: &dyn SyncJob, should_yield: F) -> RunSummary
    where
        F: Fn() -> bool,
    {
        let name = job.name();
        let started_at = chrono::Utc::now().timestamp_millis();
        let mut chunks: u64 = 0;
        let mut records: u64 = 0;
        let mut errors: u64 = 0;

        let outcome = self
            .drive(job, &should_yield, &mut chunks, &mut records, &mut errors)
            .await;

        let finished_at = chrono::Utc::now().timestamp_millis();
        let summary = RunSummary {
            job: name,
            outcome,
            chunks,
            records,
            errors,
            started_at_millis: started_at,
            finished_at_millis: finished_at,
        };

        // History row is best effort; losing it does not fail the run
        let entry = RunLogEntry {
            job: summary.job.clone(),
            started_at: summary.started_at_millis,
            finished_at: summary.finished_at_millis,
            chunks: i64::try_from(summary.chunks).unwrap_or(i64::MAX),
            records: i64::try_from(summary.records).unwrap_or(i64::MAX),
            errors: i64::try_from(summary.errors).unwrap_or(i64::MAX),
            outcome: summary.outcome.as_str().to_string(),
        };
        if let Err(e) = self.records.log_run(&entry).await {
            warn!(error = %e, "failed to write run log entry");
        }

        let elapsed_millis = summary.elapsed_millis().max(0);
        info!(
            outcome = summary.outcome.as_str(),
            chunks = summary.chunks,
            records = summary.records,
            errors = summary.errors,
            elapsed_ms = elapsed_millis,
            records_per_sec = summary.records.saturating_mul(1000)
                / u64::try_from(elapsed_millis.max(1)).unwrap_or(1),
            "run finished"
        );

        summary
    }

    async fn drive<F>(
        &self,
        job: &dyn SyncJob,
        should_yield: &F,
        chunks: &mut u64,
        records: &mut u64,
        errors: &mut u64,
    ) -> RunOutcome
    where
        F: Fn() -> bool,
    {
        let owner = job.owner_id();
        let process = job.process_name();

        let prior = match self.checkpoints.get_state_map(owner, process).await {
            Ok(prior) => prior,
            Err(e) => {
                error!(error = %e, "failed to load checkpoint");
                return RunOutcome::Failed;
            }
        };

        let feed = match prior {
            Some(fields) => {
                info!(cursor = %Cursor::from_fields(Some(&fields)), "resuming from checkpoint");
                job.resume(fields).await
            }
            None => {
                info!("no checkpoint, starting fresh");
                job.start().await
            }
        };
        let mut feed = match feed {
            Ok(feed) => feed,
            Err(e) => {
                error!(error = %e, "failed to open chunk feed");
                return RunOutcome::Failed;
            }
        };

        loop {
            if should_yield() {
                info!(chunks, "yielding at chunk boundary");
                return RunOutcome::Yielded;
            }

            let chunk = match feed.next_chunk().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => return RunOutcome::Exhausted,
                Err(e) => {
                    error!(error = %e, "chunk feed failed");
                    return RunOutcome::Failed;
                }
            };

            if !job.accepted_kinds().contains(&chunk.kind) {
                error!(kind = ?chunk.kind, "feed produced a chunk the job does not accept");
                return RunOutcome::Failed;
            }

            let mut scope = match TxScope::enter(&self.db, Propagation::RequiresNew).await {
                Ok(scope) => scope,
                Err(e) => {
                    error!(error = %e, "failed to open chunk transaction");
                    return RunOutcome::Failed;
                }
            };

            let stats = match job.process_chunk(&mut scope, &chunk).await {
                Ok(stats) => stats,
                Err(e) => {
                    error!(error = %e, "chunk processing failed, rolling back");
                    if let Err(e) = scope.complete(UnitOutcome::Failed { rollback: true }).await {
                        warn!(error = %e, "rollback failed");
                    }
                    return RunOutcome::Failed;
                }
            };

            // Progress becomes durable only together with the chunk's work.
            // A checkpoint that cannot be written rolls the work back too,
            // because replaying the chunk beats silently losing its position.
            if let Err(e) = self
                .checkpoints
                .update_state(&mut scope, owner, process, &chunk.checkpoint)
                .await
            {
                error!(error = %e, "checkpoint write failed, rolling back chunk");
                if let Err(e) = scope.complete(UnitOutcome::Failed { rollback: true }).await {
                    warn!(error = %e, "rollback failed");
                }
                return RunOutcome::Failed;
            }

            if let Err(e) = scope.complete(UnitOutcome::Completed).await {
                error!(error = %e, "chunk commit failed");
                return RunOutcome::Failed;
            }

            *chunks += 1;
            *records += stats.records;
            *errors += stats.errors;
            debug!(
                chunk = *chunks,
                records = stats.records,
                errors = stats.errors,
                "chunk committed"
            );

            if chunk.is_last {
                return RunOutcome::Exhausted;
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use uuid::Uuid;

    use crate::checkpoint::{CURSOR_FIELD, CheckpointFields, SqliteCheckpointStore};
    use crate::job::{Chunk, ChunkFeed, ChunkKind, ChunkPayload, ChunkStats, JobError, SyncJob};
    use crate::records::RecordError;
    use crate::txn::TxScope;

    use super::*;

    struct VecFeed(VecDeque<Chunk>);

    #[async_trait]
    impl ChunkFeed for VecFeed {
        async fn next_chunk(&mut self) -> Result<Option<Chunk>, JobError> {
            Ok(self.0.pop_front())
        }
    }

    /// Job that serves a scripted set of chunks and can fail on cue.
    struct ScriptedJob {
        owner: Uuid,
        total_chunks: usize,
        kind: ChunkKind,
        fail_on_chunk: Option<usize>,
        processed: AtomicUsize,
        resumed_with: Mutex<Option<CheckpointFields>>,
    }

    impl ScriptedJob {
        fn new(total_chunks: usize) -> Self {
            Self {
                owner: Uuid::new_v4(),
                total_chunks,
                kind: ChunkKind::Harvest,
                fail_on_chunk: None,
                processed: AtomicUsize::new(0),
                resumed_with: Mutex::new(None),
            }
        }

        fn chunk(&self, index: usize) -> Chunk {
            let mut checkpoint = CheckpointFields::new();
            checkpoint.insert(
                CURSOR_FIELD.to_string(),
                serde_json::json!(format!("bootstrap:{}", (index + 1) * 10)),
            );
            Chunk {
                job: "scripted".to_string(),
                kind: self.kind,
                is_last: index + 1 == self.total_chunks,
                checkpoint,
                payload: ChunkPayload::Bibs(Vec::new()),
            }
        }

        fn feed(&self) -> Box<dyn ChunkFeed> {
            Box::new(VecFeed(
                (0..self.total_chunks).map(|i| self.chunk(i)).collect(),
            ))
        }
    }

    #[async_trait]
    impl SyncJob for ScriptedJob {
        fn name(&self) -> String {
            "scripted".to_string()
        }

        fn owner_id(&self) -> Uuid {
            self.owner
        }

        fn process_name(&self) -> &str {
            "harvest"
        }

        fn accepted_kinds(&self) -> &'static [ChunkKind] {
            &[ChunkKind::Harvest]
        }

        async fn start(&self) -> Result<Box<dyn ChunkFeed>, JobError> {
            Ok(self.feed())
        }

        async fn resume(&self, prior: CheckpointFields) -> Result<Box<dyn ChunkFeed>, JobError> {
            *self.resumed_with.lock().unwrap() = Some(prior);
            Ok(self.feed())
        }

        async fn process_chunk(
            &self,
            scope: &mut TxScope,
            _chunk: &Chunk,
        ) -> Result<ChunkStats, JobError> {
            scope.check(crate::txn::Propagation::Mandatory)?;
            let index = self.processed.fetch_add(1, Ordering::SeqCst);
            if self.fail_on_chunk == Some(index) {
                return Err(JobError::Records(RecordError::Database(
                    sqlx::Error::RowNotFound,
                )));
            }
            Ok(ChunkStats {
                records: 10,
                errors: 0,
            })
        }
    }

    async fn harness() -> (Database, Arc<SqliteCheckpointStore>, JobRunner) {
        let db = Database::new_in_memory().await.unwrap();
        let store = Arc::new(SqliteCheckpointStore::new(db.clone()));
        let runner = JobRunner::new(
            db.clone(),
            Arc::clone(&store) as Arc<dyn CheckpointStore>,
            RecordStore::new(db.clone()),
        );
        (db, store, runner)
    }

    fn stored_cursor(fields: &CheckpointFields) -> &str {
        fields
            .get(CURSOR_FIELD)
            .and_then(|v| v.as_str())
            .unwrap()
    }

    #[tokio::test]
    async fn test_fresh_run_processes_to_exhaustion() {
        let (_db, store, runner) = harness().await;
        let job = ScriptedJob::new(3);

        let summary = runner.run(&job, || false).await;

        assert_eq!(summary.outcome, RunOutcome::Exhausted);
        assert_eq!(summary.chunks, 3);
        assert_eq!(summary.records, 30);

        let fields = store
            .get_state_map(job.owner, "harvest")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored_cursor(&fields), "bootstrap:30");
    }

    #[tokio::test]
    async fn test_resume_receives_persisted_fields() {
        let (_db, _store, runner) = harness().await;
        let job = ScriptedJob::new(2);

        runner.run(&job, || false).await;
        assert!(job.resumed_with.lock().unwrap().is_none());

        runner.run(&job, || false).await;
        let resumed = job.resumed_with.lock().unwrap().clone().unwrap();
        assert_eq!(stored_cursor(&resumed), "bootstrap:20");
    }

    #[tokio::test]
    async fn test_yield_stops_at_chunk_boundary_with_durable_progress() {
        let (_db, store, runner) = harness().await;
        let job = ScriptedJob::new(3);

        let polls = AtomicUsize::new(0);
        let summary = runner
            .run(&job, || polls.fetch_add(1, Ordering::SeqCst) >= 1)
            .await;

        assert_eq!(summary.outcome, RunOutcome::Yielded);
        assert_eq!(summary.chunks, 1);

        let fields = store
            .get_state_map(job.owner, "harvest")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored_cursor(&fields), "bootstrap:10");
    }

    #[tokio::test]
    async fn test_chunk_failure_rolls_back_and_keeps_prior_checkpoint() {
        let (_db, store, runner) = harness().await;
        let mut job = ScriptedJob::new(3);
        job.fail_on_chunk = Some(1);

        let summary = runner.run(&job, || false).await;

        assert_eq!(summary.outcome, RunOutcome::Failed);
        assert_eq!(summary.chunks, 1);

        // The failed chunk's checkpoint never landed
        let fields = store
            .get_state_map(job.owner, "harvest")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored_cursor(&fields), "bootstrap:10");
    }

    #[tokio::test]
    async fn test_unaccepted_chunk_kind_fails_the_run() {
        let (_db, store, runner) = harness().await;
        let mut job = ScriptedJob::new(1);
        job.kind = ChunkKind::AvailabilityRecheck;

        let summary = runner.run(&job, || false).await;

        assert_eq!(summary.outcome, RunOutcome::Failed);
        assert_eq!(summary.chunks, 0);
        assert!(store.get_state_map(job.owner, "harvest").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_every_run_lands_in_the_run_log() {
        let (db, _store, runner) = harness().await;
        let job = ScriptedJob::new(1);

        runner.run(&job, || false).await;

        let runs = RecordStore::new(db).recent_runs(5).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].job, "scripted");
        assert_eq!(runs[0].outcome, "exhausted");
    }
}
