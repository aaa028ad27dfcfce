//! Sync cycles between the job repository and the job database.


use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use jobdb::database::{DbJob, DbRun, InMemoryJobRepository};
use jobdb::error::JobDbError;
use jobdb::jobdb::JobDb;
use jobdb::sync::{run_sync_loop, SyncCycle, TransitionCounts};
use test_harness::*;

fn setup() -> (Arc<JobDb>, Arc<InMemoryJobRepository>, SyncCycle) {
    let db = Arc::new(test_db().db);
    let repo = Arc::new(InMemoryJobRepository::new());
    let cycle = SyncCycle::new(Arc::clone(&db), repo.clone());
    (db, repo, cycle)
}

#[test]
fn test_cycle_applies_new_jobs_and_advances_cursors() {
    let (db, repo, mut cycle) = setup();
    repo.upsert_jobs([db_job("j1"), db_job("j2")]);

    let outcome = cycle.run_once().unwrap();
    assert_eq!(outcome.transitions.len(), 2);
    assert_eq!(outcome.counts.queued, 2);
    assert_eq!(outcome.deleted, 0);
    assert_eq!(cycle.cursors(), (2, 0));

    let txn = db.read_txn();
    assert_eq!(txn.len(), 2);
    assert_eq!(txn.queued_jobs(QUEUE).len(), 2);
    txn.assert_all().unwrap();
    drop(txn);

    // Nothing new: nothing to do.
    let outcome = cycle.run_once().unwrap();
    assert!(outcome.transitions.is_empty());
    assert_eq!(outcome.counts, TransitionCounts::default());
}

#[test]
fn test_cycle_follows_job_through_lifecycle() {
    let (db, repo, mut cycle) = setup();
    repo.upsert_jobs([db_job("j1")]);
    cycle.run_once().unwrap();

    repo.upsert_jobs([DbJob {
        queued: false,
        queued_version: 1,
        ..db_job("j1")
    }]);
    repo.upsert_runs([DbRun {
        pending: true,
        running: true,
        ..db_run("r1", "j1", START_NANOS)
    }]);
    let outcome = cycle.run_once().unwrap();
    assert_eq!(outcome.counts.leased, 1);
    assert_eq!(outcome.counts.running, 1);
    let txn = db.read_txn();
    assert!(!txn.has_queued_jobs(QUEUE));
    assert_eq!(txn.get_by_run_id("r1").map(|j| j.id()), Some("j1"));
    txn.assert_all().unwrap();
    drop(txn);

    repo.upsert_jobs([DbJob {
        queued: false,
        queued_version: 1,
        succeeded: true,
        ..db_job("j1")
    }]);
    repo.upsert_runs([DbRun {
        running: true,
        succeeded: true,
        ..db_run("r1", "j1", START_NANOS)
    }]);
    let outcome = cycle.run_once().unwrap();
    assert_eq!(outcome.counts.succeeded, 1);
    assert_eq!(outcome.deleted, 1);
    assert!(outcome.transitions[0].job.succeeded());
    assert!(db.read_txn().is_empty());

    // A late run update for the removed job is ignored.
    repo.upsert_runs([DbRun {
        run_attempted: true,
        ..db_run("r1", "j1", START_NANOS)
    }]);
    let outcome = cycle.run_once().unwrap();
    assert!(outcome.transitions.is_empty());
}

#[test]
fn test_failed_cycle_keeps_cursors_and_retries() {
    let (db, repo, mut cycle) = setup();
    repo.upsert_jobs([db_job("j1")]);
    repo.fail_next_fetch("connection reset");

    assert!(matches!(cycle.run_once(), Err(JobDbError::Repository(_))));
    assert_eq!(cycle.cursors(), (0, 0));
    assert!(db.read_txn().is_empty());

    cycle.run_once().unwrap();
    assert_eq!(cycle.cursors(), (1, 0));
    assert_eq!(db.read_txn().len(), 1);
}

#[test]
fn test_corrupt_record_leaves_database_untouched() {
    let (db, repo, mut cycle) = setup();
    repo.upsert_jobs([
        db_job("j1"),
        DbJob {
            scheduling_info: vec![0xff, 0xff],
            ..db_job("j2")
        },
    ]);

    assert!(matches!(
        cycle.run_once(),
        Err(JobDbError::SchedulingInfoDecode { .. })
    ));
    assert!(db.read_txn().is_empty());
    assert_eq!(cycle.cursors(), (0, 0));

    // The write lock was released by the aborted cycle.
    let txn = db.write_txn();
    txn.abort();
}

#[tokio::test]
async fn test_sync_loop_publishes_outcomes_until_cancelled() {
    let (db, repo, cycle) = setup();
    repo.upsert_jobs([db_job("j1")]);

    let token = CancellationToken::new();
    let (tx, mut rx) = mpsc::channel(16);
    let handle = tokio::spawn(run_sync_loop(
        cycle,
        Duration::from_millis(10),
        token.clone(),
        tx,
    ));

    let first = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("sync loop produced no outcome")
        .unwrap();
    assert_eq!(first.counts.queued, 1);

    repo.upsert_jobs([DbJob {
        cancel_requested: true,
        cancelled: true,
        ..db_job("j1")
    }]);
    let cancelled = loop {
        let outcome = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("sync loop produced no outcome")
            .unwrap();
        if !outcome.transitions.is_empty() {
            break outcome;
        }
    };
    assert_eq!(cancelled.deleted, 1);
    assert!(db.read_txn().is_empty());

    token.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("sync loop did not stop")
        .unwrap();
}

#[tokio::test]
async fn test_sync_loop_waits_for_configured_interval() {
    let (_db, repo, cycle) = setup();
    let interval = test_config().with_sync_interval_ms(200).sync.interval();

    let token = CancellationToken::new();
    let (tx, mut rx) = mpsc::channel(16);
    let handle = tokio::spawn(run_sync_loop(cycle, interval, token.clone(), tx));

    // The first cycle runs immediately; the next only after the interval.
    rx.recv().await.unwrap();
    repo.upsert_jobs([db_job("j1")]);
    let started = tokio::time::Instant::now();
    let outcome = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("sync loop produced no outcome")
        .unwrap();
    assert!(started.elapsed() >= Duration::from_millis(150));
    assert_eq!(outcome.counts.queued, 1);

    token.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_sync_loop_survives_repository_errors() {
    let (db, repo, cycle) = setup();
    repo.fail_next_fetch("timeout");
    repo.upsert_jobs([db_job("j1")]);

    let interval = test_config().with_sync_interval_ms(10).sync.interval();
    let token = CancellationToken::new();
    let (tx, mut rx) = mpsc::channel(16);
    let handle = tokio::spawn(run_sync_loop(cycle, interval, token.clone(), tx));

    let outcome = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("sync loop produced no outcome")
        .unwrap();
    assert_eq!(outcome.counts.queued, 1);
    assert_eq!(db.read_txn().len(), 1);

    token.cancel();
    handle.await.unwrap();
}
