//! Periodic job scheduling with cooperative shutdown.
//!
//! Each scheduled job gets its own timer task. A trigger that finds the
//! job's run lock held elsewhere is a silent no-op; a trigger inside office
//! hours holds off-peak jobs back. Shutdown never cancels a run mid-chunk:
//! the yield signal asks running jobs to stop at their next chunk boundary,
//! and the scheduler waits out a bounded drain window before reporting
//! stragglers.

mod hours;

pub use hours::HoursGate;

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use crate::job::{JobRunner, SyncJob};
use crate::lock::RunLock;

/// How often the drain loop re-checks in-flight runs.
const DRAIN_POLL: Duration = Duration::from_millis(250);

/// One job's cadence.
pub struct JobSchedule {
    pub job: Arc<dyn SyncJob>,
    /// Time between trigger attempts.
    pub period: Duration,
    /// Delay before the first trigger, so a fleet restarting together does
    /// not stampede the host systems.
    pub initial_delay: Duration,
    /// Hold this job back during office hours.
    pub off_peak_only: bool,
}

/// Drives scheduled jobs until shutdown.
pub struct Scheduler {
    runner: Arc<JobRunner>,
    lock: RunLock,
    hours: Arc<HoursGate>,
    /// Job names the operator disabled without editing the schedule.
    skip_jobs: HashSet<String>,
    shutdown_wait: Duration,
}

impl Scheduler {
    #[must_use]
    pub fn new(
        runner: Arc<JobRunner>,
        lock: RunLock,
        hours: HoursGate,
        skip_jobs: HashSet<String>,
        shutdown_wait: Duration,
    ) -> Self {
        Self {
            runner,
            lock,
            hours: Arc::new(hours),
            skip_jobs,
            shutdown_wait,
        }
    }

    /// Runs all schedules until `shutdown` flips to `true`, then drains.
    ///
    /// Returns once every job has stopped or the drain window has elapsed.
    #[instrument(skip_all, fields(jobs = schedules.len()))]
    pub async fn run(&self, schedules: Vec<JobSchedule>, shutdown: watch::Receiver<bool>) {
        let mut running = Vec::with_capacity(schedules.len());

        for schedule in schedules {
            let name = schedule.job.name();
            let flag = Arc::new(AtomicBool::new(false));
            running.push((name.clone(), Arc::clone(&flag)));

            if self.skip_jobs.contains(&name) {
                info!(job = %name, "job is on the skip list, not scheduling");
                continue;
            }

            info!(
                job = %name,
                period_secs = schedule.period.as_secs(),
                initial_delay_secs = schedule.initial_delay.as_secs(),
                off_peak_only = schedule.off_peak_only,
                "scheduling job"
            );

            tokio::spawn(Self::drive_schedule(
                schedule,
                Arc::clone(&self.runner),
                self.lock.clone(),
                Arc::clone(&self.hours),
                flag,
                shutdown.clone(),
            ));
        }

        // Park until shutdown is requested
        let mut rx = shutdown;
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }

        self.drain(&running).await;
    }

    async fn drive_schedule(
        schedule: JobSchedule,
        runner: Arc<JobRunner>,
        lock: RunLock,
        hours: Arc<HoursGate>,
        flag: Arc<AtomicBool>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let name = schedule.job.name();

        tokio::select! {
            () = tokio::time::sleep(schedule.initial_delay) => {}
            _ = shutdown.changed() => return,
        }

        let mut ticker = tokio::time::interval(schedule.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => return,
            }
            if *shutdown.borrow() {
                return;
            }

            if schedule.off_peak_only && !hours.off_peak_now() {
                info!(job = %name, "inside office hours, holding this trigger");
                continue;
            }

            flag.store(true, Ordering::SeqCst);
            let job = Arc::clone(&schedule.job);
            let yield_rx = shutdown.clone();
            let yield_hours = Arc::clone(&hours);
            let off_peak_only = schedule.off_peak_only;

            let result = lock
                .with_lock(&name, || {
                    runner.run(job.as_ref(), move || {
                        *yield_rx.borrow()
                            || (off_peak_only && !yield_hours.off_peak_now())
                    })
                })
                .await;
            flag.store(false, Ordering::SeqCst);

            match result {
                Ok(Some(summary)) => {
                    debug!(job = %name, outcome = summary.outcome.as_str(), "trigger finished");
                }
                Ok(None) => {
                    // Lock contention, already logged at info by the lock
                }
                Err(e) => {
                    error!(job = %name, error = %e, "trigger failed to take the run lock");
                }
            }
        }
    }

    /// Waits for in-flight runs to reach a chunk boundary and stop. Runs
    /// still going when the window closes are reported, never cancelled;
    /// their checkpoints make the eventual kill safe anyway.
    async fn drain(&self, running: &[(String, Arc<AtomicBool>)]) {
        info!("shutdown requested, draining in-flight runs");
        let deadline = tokio::time::Instant::now() + self.shutdown_wait;

        loop {
            let busy: Vec<&str> = running
                .iter()
                .filter(|(_, flag)| flag.load(Ordering::SeqCst))
                .map(|(name, _)| name.as_str())
                .collect();

            if busy.is_empty() {
                info!("all jobs stopped cleanly");
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                for name in busy {
                    warn!(job = %name, "job still running at shutdown deadline");
                }
                return;
            }

            tokio::time::sleep(DRAIN_POLL).await;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use uuid::Uuid;

    use crate::checkpoint::{CheckpointFields, SqliteCheckpointStore};
    use crate::db::Database;
    use crate::job::{Chunk, ChunkFeed, ChunkKind, ChunkPayload, ChunkStats, JobError};
    use crate::records::RecordStore;
    use crate::txn::TxScope;

    use super::*;

    /// Job that counts its runs and exhausts after one empty chunk.
    struct TickJob {
        name: String,
        owner: Uuid,
        runs: Arc<AtomicUsize>,
    }

    impl TickJob {
        fn new(name: &str) -> (Arc<Self>, Arc<AtomicUsize>) {
            let runs = Arc::new(AtomicUsize::new(0));
            let job = Arc::new(Self {
                name: name.to_string(),
                owner: Uuid::new_v4(),
                runs: Arc::clone(&runs),
            });
            (job, runs)
        }
    }

    struct OneChunkFeed(Option<Chunk>);

    #[async_trait]
    impl ChunkFeed for OneChunkFeed {
        async fn next_chunk(&mut self) -> Result<Option<Chunk>, JobError> {
            Ok(self.0.take())
        }
    }

    #[async_trait]
    impl crate::job::SyncJob for TickJob {
        fn name(&self) -> String {
            self.name.clone()
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
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(OneChunkFeed(Some(Chunk {
                job: self.name.clone(),
                kind: ChunkKind::Harvest,
                is_last: true,
                checkpoint: CheckpointFields::new(),
                payload: ChunkPayload::Bibs(Vec::new()),
            }))))
        }

        async fn resume(&self, _prior: CheckpointFields) -> Result<Box<dyn ChunkFeed>, JobError> {
            self.start().await
        }

        async fn process_chunk(
            &self,
            scope: &mut TxScope,
            _chunk: &Chunk,
        ) -> Result<ChunkStats, JobError> {
            scope.check(crate::txn::Propagation::Mandatory)?;
            Ok(ChunkStats::default())
        }
    }

    async fn scheduler(db: &Database, skip: &[&str]) -> Scheduler {
        let runner = Arc::new(JobRunner::new(
            db.clone(),
            Arc::new(SqliteCheckpointStore::new(db.clone())),
            RecordStore::new(db.clone()),
        ));
        Scheduler::new(
            runner,
            RunLock::new(db.clone(), Duration::from_secs(60)),
            HoursGate::disabled(),
            skip.iter().map(ToString::to_string).collect(),
            Duration::from_secs(1),
        )
    }

    fn schedule(job: Arc<TickJob>, off_peak_only: bool) -> JobSchedule {
        JobSchedule {
            job,
            period: Duration::from_millis(50),
            initial_delay: Duration::from_millis(10),
            off_peak_only,
        }
    }

    #[tokio::test]
    async fn test_scheduled_job_runs_repeatedly_until_shutdown() {
        let db = Database::new_in_memory().await.unwrap();
        let scheduler = scheduler(&db, &[]).await;
        let (job, runs) = TickJob::new("harvest:demo");
        let (tx, rx) = watch::channel(false);

        let driver = tokio::spawn(async move {
            scheduler.run(vec![schedule(job, false)], rx).await;
        });

        tokio::time::sleep(Duration::from_millis(300)).await;
        tx.send(true).unwrap();
        driver.await.unwrap();

        assert!(runs.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_skip_listed_job_never_triggers() {
        let db = Database::new_in_memory().await.unwrap();
        let scheduler = scheduler(&db, &["harvest:demo"]).await;
        let (job, runs) = TickJob::new("harvest:demo");
        let (tx, rx) = watch::channel(false);

        let driver = tokio::spawn(async move {
            scheduler.run(vec![schedule(job, false)], rx).await;
        });

        tokio::time::sleep(Duration::from_millis(200)).await;
        tx.send(true).unwrap();
        driver.await.unwrap();

        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_office_hours_hold_off_peak_jobs() {
        let db = Database::new_in_memory().await.unwrap();
        let runner = Arc::new(JobRunner::new(
            db.clone(),
            Arc::new(SqliteCheckpointStore::new(db.clone())),
            RecordStore::new(db.clone()),
        ));
        // A window covering the whole day means it is always office hours
        let scheduler = Scheduler::new(
            runner,
            RunLock::new(db.clone(), Duration::from_secs(60)),
            HoursGate::new(Some(&crate::config::OfficeHoursConfig {
                start_hour: 0,
                end_hour: 24,
            })),
            HashSet::new(),
            Duration::from_secs(1),
        );
        let (job, runs) = TickJob::new("availability-recheck");
        let (tx, rx) = watch::channel(false);

        let driver = tokio::spawn(async move {
            scheduler.run(vec![schedule(job, true)], rx).await;
        });

        tokio::time::sleep(Duration::from_millis(200)).await;
        tx.send(true).unwrap();
        driver.await.unwrap();

        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_shutdown_before_first_trigger_returns_quickly() {
        let db = Database::new_in_memory().await.unwrap();
        let scheduler = scheduler(&db, &[]).await;
        let (job, runs) = TickJob::new("harvest:demo");
        let (tx, rx) = watch::channel(false);

        let mut long_delay = schedule(job, false);
        long_delay.initial_delay = Duration::from_secs(3600);

        let driver = tokio::spawn(async move {
            scheduler.run(vec![long_delay], rx).await;
        });

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), driver)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_contended_lock_skips_the_trigger() {
        let db = Database::new_in_memory().await.unwrap();
        // Another instance already holds the lease for this job
        let other = RunLock::new(db.clone(), Duration::from_secs(60));
        assert!(other.try_acquire("harvest:demo").await.unwrap());

        let scheduler = scheduler(&db, &[]).await;
        let (job, runs) = TickJob::new("harvest:demo");
        let (tx, rx) = watch::channel(false);

        let driver = tokio::spawn(async move {
            scheduler.run(vec![schedule(job, false)], rx).await;
        });

        tokio::time::sleep(Duration::from_millis(200)).await;
        tx.send(true).unwrap();
        driver.await.unwrap();

        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }
}
