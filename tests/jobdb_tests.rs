//! Transactions and indexes of the job database.


use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use jobdb::error::JobDbError;
use jobdb::jobdb::JobDb;
use test_harness::*;

#[test]
fn test_read_txn_sees_committed_state_only() {
    let t = test_db();
    let job = queued_job(&t.db);

    let mut write = t.db.write_txn();
    write.upsert([job.clone()]).unwrap();
    assert!(write.get_by_id(job.id()).is_some());

    let read = t.db.read_txn();
    assert!(read.get_by_id(job.id()).is_none());

    write.commit().unwrap();
    // A snapshot taken before the commit keeps its view.
    assert!(read.get_by_id(job.id()).is_none());
    assert_eq!(t.db.read_txn().get_by_id(job.id()), Some(&job));
}

#[test]
fn test_dropping_write_txn_aborts() {
    let t = test_db();
    let job = queued_job(&t.db);

    {
        let mut txn = t.db.write_txn();
        txn.upsert([job.clone()]).unwrap();
    }
    let mut txn = t.db.write_txn();
    txn.upsert([queued_job(&t.db)]).unwrap();
    txn.abort();

    assert!(t.db.read_txn().is_empty());
}

#[test]
fn test_read_txn_rejects_writes() {
    let t = test_db();
    let mut txn = t.db.read_txn();
    assert!(txn.read_only());
    assert!(matches!(txn.upsert([queued_job(&t.db)]), Err(JobDbError::ReadOnlyTxn)));
    assert!(matches!(txn.delete(&["missing"]), Err(JobDbError::ReadOnlyTxn)));
    assert!(matches!(txn.commit(), Err(JobDbError::ReadOnlyTxn)));
}

#[test]
fn test_second_writer_waits_for_first() {
    let t = test_db();
    let db = Arc::new(t.db);
    let job = queued_job(&db);

    let txn = db.write_txn();
    let (tx, rx) = mpsc::channel();
    let handle = {
        let db = Arc::clone(&db);
        let job = job.clone();
        thread::spawn(move || {
            let mut txn = db.write_txn();
            tx.send(()).unwrap();
            txn.upsert([job]).unwrap();
            txn.commit().unwrap();
        })
    };

    // The second writer cannot start while the first is open.
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    // Readers are not blocked by the open writer.
    assert!(db.read_txn().is_empty());

    drop(txn);
    rx.recv_timeout(Duration::from_secs(5)).unwrap();
    handle.join().unwrap();
    assert!(db.read_txn().get_by_id(job.id()).is_some());
}

#[test]
fn test_get_by_run_id() {
    let t = test_db();
    let job = leased_job(&t.db);
    let run_id = job.latest_run().unwrap().id().to_string();
    commit_jobs(&t.db, [job.clone()]);

    let txn = t.db.read_txn();
    assert_eq!(txn.get_by_run_id(&run_id).map(|j| j.id()), Some(job.id()));
    assert!(txn.get_by_run_id("no-such-run").is_none());
}

#[test]
fn test_gang_index() {
    let t = test_db();
    let gang = gang_jobs(&t.db, "gang-1", 3);
    let other = gang_jobs(&t.db, "gang-2", 2);
    commit_jobs(&t.db, gang.iter().chain(&other).cloned());

    let txn = t.db.read_txn();
    let mut expected: Vec<String> = gang.iter().map(|j| j.id().to_string()).collect();
    expected.sort();
    assert_eq!(txn.get_gang_job_ids_by_gang_id(QUEUE, "gang-1"), expected);
    assert_eq!(txn.get_gang_job_ids_by_gang_id(QUEUE, "gang-2").len(), 2);
    assert!(txn.get_gang_job_ids_by_gang_id("other-queue", "gang-1").is_empty());
    drop(txn);

    let mut txn = t.db.write_txn();
    txn.delete(&[gang[0].id()]).unwrap();
    assert_eq!(txn.get_gang_job_ids_by_gang_id(QUEUE, "gang-1").len(), 2);
    txn.commit().unwrap();
}

#[test]
fn test_queued_jobs_are_ordered_by_priority_then_submission() {
    let t = test_db();
    let late = queued_job(&t.db).with_submitted_time(START_NANOS + 10);
    let early = queued_job(&t.db).with_submitted_time(START_NANOS);
    let urgent = queued_job(&t.db)
        .with_priority(0)
        .with_submitted_time(START_NANOS + 20);
    let leased = leased_job(&t.db);
    commit_jobs(&t.db, [late.clone(), early.clone(), urgent.clone(), leased]);

    let txn = t.db.read_txn();
    let ids: Vec<&str> = txn.queued_jobs(QUEUE).iter().map(|j| j.id()).collect();
    assert_eq!(ids, vec![urgent.id(), early.id(), late.id()]);
    assert!(txn.has_queued_jobs(QUEUE));
    assert!(!txn.has_queued_jobs("other-queue"));
    assert_eq!(txn.len(), 4);
}

#[test]
fn test_upsert_reindexes_changed_job() {
    let t = test_db();
    let job = queued_job(&t.db).with_validated(false);
    commit_jobs(&t.db, [job.clone()]);
    assert_eq!(t.db.read_txn().unvalidated_jobs().len(), 1);

    let leased = lease(job.with_validated(true));
    commit_jobs(&t.db, [leased.clone()]);

    let txn = t.db.read_txn();
    assert!(txn.queued_jobs(QUEUE).is_empty());
    assert!(txn.unvalidated_jobs().is_empty());
    assert_eq!(txn.get_by_id(job.id()), Some(&leased));
    txn.assert_all().unwrap();
}

#[test]
fn test_delete_removes_from_every_index() {
    let t = test_db();
    let queued = queued_job(&t.db).with_validated(false);
    let leased = leased_job(&t.db);
    let run_id = leased.latest_run().unwrap().id().to_string();
    commit_jobs(&t.db, [queued.clone(), leased.clone()]);

    let mut txn = t.db.write_txn();
    txn.delete(&[queued.id(), leased.id(), "unknown"]).unwrap();
    assert!(txn.is_empty());
    assert!(txn.get_by_run_id(&run_id).is_none());
    assert!(!txn.has_queued_jobs(QUEUE));
    assert!(txn.unvalidated_jobs().is_empty());
    txn.assert_all().unwrap();
    txn.commit().unwrap();
}

#[test]
fn test_assert_all_reports_invalid_jobs() {
    let t = test_db();
    let broken = queued_job(&t.db).with_succeeded(true);
    commit_jobs(&t.db, [broken.clone(), leased_job(&t.db)]);

    match t.db.read_txn().assert_all() {
        Err(JobDbError::InvalidTxn(violations)) => {
            assert!(violations.contains(broken.id()));
            assert!(violations.contains("queued and succeeded"));
        }
        other => panic!("expected invalid txn, got {other:?}"),
    };
}

#[test]
fn test_invalid_config_is_rejected() {
    let config = test_config().with_default_priority_class("missing");
    assert!(matches!(JobDb::new(&config), Err(JobDbError::Config(_))));
}
