//! CLI entry point for the interlend broker.

use std::collections::HashMap;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use interlend_core::job::RECHECK_PROCESS;
use interlend_core::{
    CheckpointStore, Cursor, Database, FileConfig, HarvestJob, HoursGate, JobRunner, JobSchedule,
    RecheckJob, RecordStore, RetryPolicy, RunLock, RunOutcome, Scheduler, SourceAdapter,
    SqliteCheckpointStore, SyncJob, ThrottledDispatcher, WriteThrottle, build_registry,
};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

mod cli;

use cli::{Args, Command};

/// Database file used when `--db` is not given.
const DEFAULT_DB_PATH: &str = "interlend.db";

/// Run history rows shown by `status`.
const RECENT_RUNS_SHOWN: u32 = 10;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Determine log level based on verbose/quiet flags
    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    debug!(?args, "CLI arguments parsed");

    let config = FileConfig::load(args.config.as_deref())?;

    // The sources listing needs no database; everything else opens it
    if matches!(args.command, Command::Sources) {
        show_sources(&config);
        return Ok(());
    }

    let db_path = args
        .db
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_PATH));
    let broker = Broker::open(config, &db_path).await?;

    match &args.command {
        Command::Run => run_daemon(&broker).await?,
        Command::Sync { source } => run_sync(&broker, source.as_deref(), args.quiet).await?,
        Command::Recheck => run_recheck(&broker, args.quiet).await?,
        Command::Status => show_status(&broker).await?,
        Command::Reset {
            source,
            process,
            yes,
        } => reset_checkpoint(&broker, source.as_deref(), process, *yes).await?,
        // Handled before the database was opened
        Command::Sources => {}
    }

    broker.close().await;
    Ok(())
}

/// Shared handles every data-touching subcommand needs.
struct Broker {
    config: FileConfig,
    db: Database,
    records: RecordStore,
    checkpoints: Arc<SqliteCheckpointStore>,
    runner: Arc<JobRunner>,
    adapters: Vec<Arc<dyn SourceAdapter>>,
}

impl Broker {
    async fn open(config: FileConfig, db_path: &Path) -> Result<Self> {
        let db = Database::new(db_path)
            .await
            .with_context(|| format!("failed to open database at {}", db_path.display()))?;
        let records = RecordStore::new(db.clone());
        let checkpoints = Arc::new(SqliteCheckpointStore::new(db.clone()));
        let runner = Arc::new(JobRunner::new(
            db.clone(),
            Arc::clone(&checkpoints) as Arc<dyn CheckpointStore>,
            records.clone(),
        ));

        let retry = RetryPolicy::with_max_attempts(config.engine.max_attempts);
        let adapters = build_registry(&config.sources, config.engine.request_timeout(), &retry);

        Ok(Self {
            config,
            db,
            records,
            checkpoints,
            runner,
            adapters,
        })
    }

    fn lock(&self) -> RunLock {
        RunLock::new(
            self.db.clone(),
            Duration::from_secs(self.config.scheduler.lock_ttl_secs),
        )
    }

    fn harvest_job(&self, adapter: &Arc<dyn SourceAdapter>) -> HarvestJob {
        HarvestJob::new(
            Arc::clone(adapter),
            self.records.clone(),
            self.config.engine.page_size,
        )
    }

    fn recheck_job(&self) -> RecheckJob {
        let by_system: HashMap<String, Arc<dyn SourceAdapter>> = self
            .adapters
            .iter()
            .map(|adapter| (adapter.system_id().to_string(), Arc::clone(adapter)))
            .collect();

        let dispatcher = Arc::new(ThrottledDispatcher::new(
            self.config.concurrency.per_source,
            self.config.concurrency.pacing(),
            self.config.instance_cap(),
        ));
        let writes = WriteThrottle::new(
            self.config.concurrency.write_batch,
            self.config.concurrency.write_concurrency,
        );

        RecheckJob::new(
            Arc::new(by_system),
            self.records.clone(),
            dispatcher,
            writes,
            self.config.engine.page_size,
            self.config.recheck.grace_period(),
        )
    }

    async fn close(self) {
        self.db.close().await;
    }
}

/// Schedules every enabled harvest plus the availability sweep and runs them
/// until a shutdown signal arrives.
async fn run_daemon(broker: &Broker) -> Result<()> {
    if broker.adapters.is_empty() {
        warn!("no enabled sources configured; only the availability sweep will run");
    }

    let cadence = &broker.config.scheduler;
    let mut schedules = Vec::with_capacity(broker.adapters.len() + 1);
    for adapter in &broker.adapters {
        schedules.push(JobSchedule {
            job: Arc::new(broker.harvest_job(adapter)),
            period: Duration::from_secs(cadence.harvest_period_secs),
            initial_delay: Duration::from_secs(cadence.harvest_initial_delay_secs),
            off_peak_only: false,
        });
    }
    schedules.push(JobSchedule {
        job: Arc::new(broker.recheck_job()),
        period: Duration::from_secs(cadence.recheck_period_secs),
        initial_delay: Duration::from_secs(cadence.recheck_initial_delay_secs),
        off_peak_only: true,
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = shutdown_signal().await {
            error!(error = %e, "signal handler setup failed, shutting down");
        }
        let _ = shutdown_tx.send(true);
    });

    let scheduler = Scheduler::new(
        Arc::clone(&broker.runner),
        broker.lock(),
        HoursGate::new(cadence.office_hours.as_ref()),
        cadence.skip_set(),
        Duration::from_secs(cadence.shutdown_wait_secs),
    );

    info!(
        version = env!("CARGO_PKG_VERSION"),
        jobs = schedules.len(),
        "interlend scheduler starting"
    );
    scheduler.run(schedules, shutdown_rx).await;
    info!("interlend scheduler stopped");
    Ok(())
}

/// One-shot harvest of all enabled sources, or just the one named.
async fn run_sync(broker: &Broker, only: Option<&str>, quiet: bool) -> Result<()> {
    let targets: Vec<Arc<dyn SourceAdapter>> = match only {
        Some(system_id) => {
            let adapter = broker
                .adapters
                .iter()
                .find(|a| a.system_id() == system_id)
                .with_context(|| format!("source {system_id:?} is not configured and enabled"))?;
            vec![Arc::clone(adapter)]
        }
        None => broker.adapters.clone(),
    };

    if targets.is_empty() {
        info!("no enabled sources to sync");
        return Ok(());
    }

    let lock = broker.lock();
    let use_spinner = !quiet && std::io::stderr().is_terminal();
    let mut failures = Vec::new();

    for adapter in targets {
        let system = adapter.system_id().to_string();
        let job = broker.harvest_job(&adapter);
        let name = job.name();

        let spinner = spawn_spinner(use_spinner, format!("syncing {system}..."));
        let outcome = lock
            .with_lock(&name, || broker.runner.run(&job, || false))
            .await?;
        if let Some(bar) = spinner {
            bar.finish_and_clear();
        }

        match outcome {
            Some(summary) => {
                println!(
                    "{system}: {} ({} records, {} errors in {}ms)",
                    summary.outcome.as_str(),
                    summary.records,
                    summary.errors,
                    summary.elapsed_millis()
                );
                if summary.outcome == RunOutcome::Failed {
                    failures.push(system);
                }
            }
            None => println!("{system}: skipped, another instance is running this job"),
        }
    }

    if !failures.is_empty() {
        bail!("sync failed for {}", failures.join(", "));
    }
    Ok(())
}

/// One-shot availability sweep over every stale record.
async fn run_recheck(broker: &Broker, quiet: bool) -> Result<()> {
    let job = broker.recheck_job();
    let name = job.name();
    let lock = broker.lock();

    let use_spinner = !quiet && std::io::stderr().is_terminal();
    let spinner = spawn_spinner(use_spinner, "rechecking availability...".to_string());
    let outcome = lock
        .with_lock(&name, || broker.runner.run(&job, || false))
        .await?;
    if let Some(bar) = spinner {
        bar.finish_and_clear();
    }

    match outcome {
        Some(summary) => {
            println!(
                "{RECHECK_PROCESS}: {} ({} records, {} errors in {}ms)",
                summary.outcome.as_str(),
                summary.records,
                summary.errors,
                summary.elapsed_millis()
            );
            if summary.outcome == RunOutcome::Failed {
                bail!("availability recheck failed");
            }
        }
        None => println!("{RECHECK_PROCESS}: skipped, another instance is running it"),
    }
    Ok(())
}

/// Prints checkpoints, per-source record counts, and recent run history.
async fn show_status(broker: &Broker) -> Result<()> {
    let owner_labels: HashMap<Uuid, &str> = broker
        .config
        .sources
        .iter()
        .map(|s| (s.owner_id, s.system_id.as_str()))
        .collect();

    let entries = broker.checkpoints.list().await?;
    if entries.is_empty() {
        println!("No checkpoints stored; every job will bootstrap from scratch.");
    } else {
        println!("Checkpoints:");
        for entry in &entries {
            let owner = if entry.owner_id.is_nil() {
                "broker"
            } else {
                owner_labels
                    .get(&entry.owner_id)
                    .copied()
                    .unwrap_or("unknown")
            };
            let cursor = Cursor::from_fields(Some(&entry.fields));
            println!(
                "  {:<20} {:<24} cursor={:<34} updated={}",
                owner,
                entry.process,
                cursor.encode(),
                format_millis(entry.updated_at_millis)
            );
        }
    }

    let counts = broker.records.source_counts().await?;
    if !counts.is_empty() {
        println!("\nRecords:");
        for (system, count) in &counts {
            println!("  {system:<20} {count}");
        }
    }

    let runs = broker.records.recent_runs(RECENT_RUNS_SHOWN).await?;
    if !runs.is_empty() {
        println!("\nRecent runs:");
        for run in &runs {
            println!(
                "  {} {:<28} {:<10} chunks={:<4} records={:<7} errors={}",
                format_millis(run.started_at),
                run.job,
                run.outcome,
                run.chunks,
                run.records,
                run.errors
            );
        }
    }
    Ok(())
}

/// Prints the configured sources and their enabled state.
fn show_sources(config: &FileConfig) {
    if config.sources.is_empty() {
        println!("No sources configured.");
        return;
    }

    println!("{:<20} {:<10} {:<9} owner", "system", "kind", "state");
    for source in &config.sources {
        println!(
            "{:<20} {:<10} {:<9} {}",
            source.system_id,
            source.kind,
            if source.enabled { "enabled" } else { "disabled" },
            source.owner_id
        );
    }
}

/// Deletes one checkpoint after an explicit `--yes`.
async fn reset_checkpoint(
    broker: &Broker,
    source: Option<&str>,
    process: &str,
    yes: bool,
) -> Result<()> {
    if !yes {
        bail!("reset deletes durable sync progress; pass --yes to confirm");
    }

    let owner = match source {
        Some(system_id) => broker
            .config
            .sources
            .iter()
            .find(|s| s.system_id == system_id)
            .map(|s| s.owner_id)
            .with_context(|| format!("source {system_id:?} is not in the configuration"))?,
        // The availability sweep checkpoints under the broker-wide nil owner
        None if process == RECHECK_PROCESS => Uuid::nil(),
        None => bail!("--source is required when resetting the {process:?} process"),
    };

    if broker.checkpoints.reset(owner, process).await? {
        info!(process, "checkpoint deleted");
        println!("Checkpoint deleted; the next {process} run starts a fresh bootstrap.");
    } else {
        println!("No checkpoint stored for that owner and process.");
    }
    Ok(())
}

/// Starts a steady-tick spinner when the terminal wants one.
fn spawn_spinner(enabled: bool, message: String) -> Option<ProgressBar> {
    if !enabled {
        return None;
    }

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::with_template("{spinner} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner.set_message(message);
    Some(spinner)
}

/// Formats an epoch-milliseconds timestamp for operator output.
fn format_millis(millis: i64) -> String {
    chrono::DateTime::from_timestamp_millis(millis)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| millis.to_string())
}

/// Waits for a shutdown signal (SIGINT or SIGTERM on Unix).
#[cfg(unix)]
async fn shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint =
        signal(SignalKind::interrupt()).context("failed to set up SIGINT handler")?;
    let mut sigterm =
        signal(SignalKind::terminate()).context("failed to set up SIGTERM handler")?;

    tokio::select! {
        _ = sigint.recv() => info!(signal = "SIGINT", "shutdown signal received"),
        _ = sigterm.recv() => info!(signal = "SIGTERM", "shutdown signal received"),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!(signal = "ctrl-c", "shutdown signal received");
    Ok(())
}
