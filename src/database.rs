//! Records read from the persistent job repository, and the repository
//! interface the sync loop polls.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{JobDbError, Result};

/// A job as stored in the repository.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DbJob {
    pub job_id: String,
    pub job_set: String,
    pub queue: String,
    pub priority: i64,
    /// Serialized [`crate::proto::JobSchedulingInfo`]
    pub scheduling_info: Vec<u8>,
    pub scheduling_info_version: u32,
    pub queued: bool,
    pub queued_version: i32,
    pub cancel_requested: bool,
    pub cancel_by_jobset_requested: bool,
    pub cancel_user: Option<String>,
    pub cancelled: bool,
    pub succeeded: bool,
    pub failed: bool,
    /// Submission time in nanoseconds since the epoch
    pub submitted: i64,
    pub validated: bool,
    pub pools: Vec<String>,
    pub price_band: i32,
    /// Position in the repository's change log
    pub serial: i64,
}

/// A job run as stored in the repository. Each timestamp is present iff the
/// corresponding event happened.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DbRun {
    pub run_id: String,
    pub job_id: String,
    /// Creation time in nanoseconds since the epoch
    pub created: i64,
    pub executor: String,
    pub node: String,
    pub pool: String,
    pub scheduled_at_priority: Option<i32>,
    pub leased_timestamp: Option<DateTime<Utc>>,
    pub pending_timestamp: Option<DateTime<Utc>>,
    pub running_timestamp: Option<DateTime<Utc>>,
    pub preempted_timestamp: Option<DateTime<Utc>>,
    pub terminated_timestamp: Option<DateTime<Utc>>,
    pub pending: bool,
    pub running: bool,
    pub preempt_requested: bool,
    pub preempted: bool,
    pub succeeded: bool,
    pub failed: bool,
    pub cancelled: bool,
    pub returned: bool,
    pub run_attempted: bool,
    pub serial: i64,
}

/// Source of job and run changes.
pub trait JobRepository: Send + Sync {
    /// Every job with a serial greater than `job_serial` and every run with a
    /// serial greater than `run_serial`, each in ascending serial order.
    fn fetch_job_updates(&self, job_serial: i64, run_serial: i64)
        -> Result<(Vec<DbJob>, Vec<DbRun>)>;
}

#[derive(Debug, Default)]
struct RepositoryState {
    jobs: HashMap<String, DbJob>,
    runs: HashMap<String, DbRun>,
    last_serial: i64,
    fail_next_fetch: Option<String>,
}

/// A [`JobRepository`] backed by maps. Every write assigns the record the
/// next serial, replacing any earlier version of the same job or run.
#[derive(Debug, Default)]
pub struct InMemoryJobRepository {
    state: Mutex<RepositoryState>,
}

impl InMemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert_jobs(&self, jobs: impl IntoIterator<Item = DbJob>) {
        let mut state = self.lock();
        for mut job in jobs {
            state.last_serial += 1;
            job.serial = state.last_serial;
            state.jobs.insert(job.job_id.clone(), job);
        }
    }

    pub fn upsert_runs(&self, runs: impl IntoIterator<Item = DbRun>) {
        let mut state = self.lock();
        for mut run in runs {
            state.last_serial += 1;
            run.serial = state.last_serial;
            state.runs.insert(run.run_id.clone(), run);
        }
    }

    /// Make the next fetch fail with `reason`.
    pub fn fail_next_fetch(&self, reason: impl Into<String>) {
        self.lock().fail_next_fetch = Some(reason.into());
    }

    /// The serial of the most recent write.
    pub fn last_serial(&self) -> i64 {
        self.lock().last_serial
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RepositoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl JobRepository for InMemoryJobRepository {
    fn fetch_job_updates(
        &self,
        job_serial: i64,
        run_serial: i64,
    ) -> Result<(Vec<DbJob>, Vec<DbRun>)> {
        let mut state = self.lock();
        if let Some(reason) = state.fail_next_fetch.take() {
            return Err(JobDbError::Repository(reason));
        }

        let mut jobs: Vec<DbJob> = state
            .jobs
            .values()
            .filter(|job| job.serial > job_serial)
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.serial);

        let mut runs: Vec<DbRun> = state
            .runs
            .values()
            .filter(|run| run.serial > run_serial)
            .cloned()
            .collect();
        runs.sort_by_key(|run| run.serial);

        Ok((jobs, runs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(id: &str) -> DbJob {
        DbJob {
            job_id: id.to_string(),
            queue: "queue-a".to_string(),
            job_set: "set-a".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn fetch_returns_records_after_cursor_in_serial_order() {
        let repo = InMemoryJobRepository::new();
        repo.upsert_jobs([job("b"), job("a")]);
        repo.upsert_runs([DbRun {
            run_id: "r1".to_string(),
            job_id: "a".to_string(),
            ..Default::default()
        }]);

        let (jobs, runs) = repo.fetch_job_updates(0, 0).unwrap();
        let ids: Vec<_> = jobs.iter().map(|j| j.job_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].serial, 3);

        let (jobs, runs) = repo.fetch_job_updates(1, 3).unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].job_id, "a");
        assert!(runs.is_empty());
    }

    #[test]
    fn rewriting_a_job_replaces_it_with_a_newer_serial() {
        let repo = InMemoryJobRepository::new();
        repo.upsert_jobs([job("a")]);
        repo.upsert_jobs([DbJob {
            cancel_requested: true,
            ..job("a")
        }]);

        let (jobs, _) = repo.fetch_job_updates(0, 0).unwrap();
        assert_eq!(jobs.len(), 1);
        assert!(jobs[0].cancel_requested);
        assert_eq!(jobs[0].serial, 2);
    }

    #[test]
    fn injected_failure_applies_once() {
        let repo = InMemoryJobRepository::new();
        repo.fail_next_fetch("connection reset");
        assert!(matches!(
            repo.fetch_job_updates(0, 0),
            Err(JobDbError::Repository(reason)) if reason == "connection reset"
        ));
        assert!(repo.fetch_job_updates(0, 0).is_ok());
    }
}
