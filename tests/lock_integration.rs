//! Run-lease coordination between two broker instances sharing one
//! database file, each with its own connection pool.

use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::oneshot;

use interlend_core::{Database, RunLock};

async fn two_instances(
    ttl: Duration,
) -> Result<(RunLock, RunLock, TempDir), Box<dyn std::error::Error>> {
    let temp_dir = TempDir::new()?;
    let db_path = temp_dir.path().join("shared.db");

    // Separate pools over the same file, as two broker processes would hold
    let first = RunLock::new(Database::new(&db_path).await?, ttl);
    let second = RunLock::new(Database::new(&db_path).await?, ttl);
    Ok((first, second, temp_dir))
}

#[tokio::test]
async fn test_only_one_instance_runs_a_named_job() -> Result<(), Box<dyn std::error::Error>> {
    let (first, second, _temp_dir) = two_instances(Duration::from_secs(600)).await?;

    let (entered_tx, entered_rx) = oneshot::channel();
    let (release_tx, release_rx) = oneshot::channel::<()>();

    let holder = tokio::spawn(async move {
        first
            .with_lock("harvest:sierra-main", move || async move {
                entered_tx.send(()).ok();
                release_rx.await.ok();
                "finished"
            })
            .await
    });

    entered_rx.await?;

    // The other instance sees the live lease and skips the trigger
    let contended = second
        .with_lock("harvest:sierra-main", || async { "ran" })
        .await?;
    assert_eq!(contended, None);

    release_tx.send(()).ok();
    let held = holder.await??;
    assert_eq!(held, Some("finished"));

    // Released, so the second instance runs the next trigger
    let after = second
        .with_lock("harvest:sierra-main", || async { "ran" })
        .await?;
    assert_eq!(after, Some("ran"));
    Ok(())
}

#[tokio::test]
async fn test_different_jobs_do_not_contend() -> Result<(), Box<dyn std::error::Error>> {
    let (first, second, _temp_dir) = two_instances(Duration::from_secs(600)).await?;

    assert!(first.try_acquire("harvest:sierra-main").await?);

    let ran = second
        .with_lock("availability-recheck", || async { 7 })
        .await?;
    assert_eq!(ran, Some(7));

    first.release("harvest:sierra-main").await?;
    Ok(())
}

#[tokio::test]
async fn test_crashed_holder_lease_expires_for_takeover() -> Result<(), Box<dyn std::error::Error>>
{
    let temp_dir = TempDir::new()?;
    let db_path = temp_dir.path().join("shared.db");

    let crashed = RunLock::new(Database::new(&db_path).await?, Duration::from_millis(50));
    let survivor = RunLock::new(Database::new(&db_path).await?, Duration::from_secs(600));

    // The crashed instance takes the lease and never releases it
    assert!(crashed.try_acquire("harvest:polaris-east").await?);
    let blocked = survivor
        .with_lock("harvest:polaris-east", || async { 1 })
        .await?;
    assert_eq!(blocked, None);

    tokio::time::sleep(Duration::from_millis(80)).await;

    // The lease has aged out, the survivor takes the job over
    let taken = survivor
        .with_lock("harvest:polaris-east", || async { 1 })
        .await?;
    assert_eq!(taken, Some(1));
    Ok(())
}
