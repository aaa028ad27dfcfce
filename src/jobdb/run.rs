use chrono::{DateTime, Utc};

use crate::error::{InvariantViolations, JobDbError, Result};

/// Fields for [`crate::jobdb::JobDb::create_run`].
#[derive(Debug, Clone, Default)]
pub struct NewRun {
    pub id: String,
    pub job_id: String,
    /// Creation time in nanoseconds since the epoch
    pub created: i64,
    pub executor: String,
    pub node_id: String,
    pub node_name: String,
    pub pool: String,
    pub scheduled_at_priority: Option<i32>,
    pub leased: bool,
    pub pending: bool,
    pub running: bool,
    pub preempt_requested: bool,
    pub preempted: bool,
    pub succeeded: bool,
    pub failed: bool,
    pub cancelled: bool,
    pub leased_time: Option<DateTime<Utc>>,
    pub pending_time: Option<DateTime<Utc>>,
    pub running_time: Option<DateTime<Utc>>,
    pub preempted_time: Option<DateTime<Utc>>,
    pub terminated_time: Option<DateTime<Utc>>,
    pub returned: bool,
    pub run_attempted: bool,
}

/// One attempt to execute a job on one executor.
///
/// Runs are values: every `with_*` method returns a modified copy and leaves
/// the receiver untouched, so a run may be shared freely between snapshots.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRun {
    id: String,
    job_id: String,
    created: i64,
    executor: String,
    node_id: String,
    node_name: String,
    pool: String,
    scheduled_at_priority: Option<i32>,
    leased: bool,
    leased_time: Option<DateTime<Utc>>,
    pending: bool,
    pending_time: Option<DateTime<Utc>>,
    running: bool,
    running_time: Option<DateTime<Utc>>,
    preempt_requested: bool,
    preempted: bool,
    preempted_time: Option<DateTime<Utc>>,
    succeeded: bool,
    failed: bool,
    cancelled: bool,
    terminated_time: Option<DateTime<Utc>>,
    returned: bool,
    run_attempted: bool,
}

impl JobRun {
    pub(crate) fn from_new(run: NewRun) -> Self {
        Self {
            id: run.id,
            job_id: run.job_id,
            created: run.created,
            executor: run.executor,
            node_id: run.node_id,
            node_name: run.node_name,
            pool: run.pool,
            scheduled_at_priority: run.scheduled_at_priority,
            leased: run.leased,
            leased_time: run.leased_time,
            pending: run.pending,
            pending_time: run.pending_time,
            running: run.running,
            running_time: run.running_time,
            preempt_requested: run.preempt_requested,
            preempted: run.preempted,
            preempted_time: run.preempted_time,
            succeeded: run.succeeded,
            failed: run.failed,
            cancelled: run.cancelled,
            terminated_time: run.terminated_time,
            returned: run.returned,
            run_attempted: run.run_attempted,
        }
    }

    /// Check the run is internally consistent, collecting every violation.
    pub fn assert(&self) -> Result<()> {
        let mut violations = InvariantViolations::new();
        if self.id.is_empty() {
            violations.push("run has an empty id");
        }
        if self.job_id.is_empty() {
            violations.push("run has an empty jobId");
        }
        let terminal = [self.succeeded, self.failed, self.cancelled, self.preempted]
            .iter()
            .filter(|&&t| t)
            .count();
        if terminal > 1 {
            violations.push(format!("run is in {terminal} terminal states at once"));
        }
        if violations.is_empty() {
            Ok(())
        } else {
            Err(JobDbError::InvalidRun {
                run_id: self.id.clone(),
                violations,
            })
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn created(&self) -> i64 {
        self.created
    }

    pub fn executor(&self) -> &str {
        &self.executor
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn pool(&self) -> &str {
        &self.pool
    }

    /// Priority the run was placed at; `None` until scheduled.
    pub fn scheduled_at_priority(&self) -> Option<i32> {
        self.scheduled_at_priority
    }

    pub fn leased(&self) -> bool {
        self.leased
    }

    pub fn leased_time(&self) -> Option<DateTime<Utc>> {
        self.leased_time
    }

    pub fn pending(&self) -> bool {
        self.pending
    }

    pub fn pending_time(&self) -> Option<DateTime<Utc>> {
        self.pending_time
    }

    pub fn running(&self) -> bool {
        self.running
    }

    pub fn running_time(&self) -> Option<DateTime<Utc>> {
        self.running_time
    }

    pub fn preempt_requested(&self) -> bool {
        self.preempt_requested
    }

    pub fn preempted(&self) -> bool {
        self.preempted
    }

    pub fn preempted_time(&self) -> Option<DateTime<Utc>> {
        self.preempted_time
    }

    pub fn succeeded(&self) -> bool {
        self.succeeded
    }

    pub fn failed(&self) -> bool {
        self.failed
    }

    pub fn cancelled(&self) -> bool {
        self.cancelled
    }

    pub fn terminated_time(&self) -> Option<DateTime<Utc>> {
        self.terminated_time
    }

    /// True if the executor handed the run back without running it to completion.
    pub fn returned(&self) -> bool {
        self.returned
    }

    pub fn run_attempted(&self) -> bool {
        self.run_attempted
    }

    pub fn in_terminal_state(&self) -> bool {
        self.succeeded || self.failed || self.cancelled || self.preempted
    }

    pub fn with_leased(&self, leased: bool) -> JobRun {
        JobRun {
            leased,
            ..self.clone()
        }
    }

    pub fn with_leased_time(&self, time: Option<DateTime<Utc>>) -> JobRun {
        JobRun {
            leased_time: time,
            ..self.clone()
        }
    }

    pub fn with_pending(&self, pending: bool) -> JobRun {
        JobRun {
            pending,
            ..self.clone()
        }
    }

    pub fn with_pending_time(&self, time: Option<DateTime<Utc>>) -> JobRun {
        JobRun {
            pending_time: time,
            ..self.clone()
        }
    }

    pub fn with_running(&self, running: bool) -> JobRun {
        JobRun {
            running,
            ..self.clone()
        }
    }

    pub fn with_running_time(&self, time: Option<DateTime<Utc>>) -> JobRun {
        JobRun {
            running_time: time,
            ..self.clone()
        }
    }

    pub fn with_preempt_requested(&self, preempt_requested: bool) -> JobRun {
        JobRun {
            preempt_requested,
            ..self.clone()
        }
    }

    pub fn with_preempted(&self, preempted: bool) -> JobRun {
        JobRun {
            preempted,
            ..self.clone()
        }
    }

    pub fn with_preempted_time(&self, time: Option<DateTime<Utc>>) -> JobRun {
        JobRun {
            preempted_time: time,
            ..self.clone()
        }
    }

    pub fn with_succeeded(&self, succeeded: bool) -> JobRun {
        JobRun {
            succeeded,
            ..self.clone()
        }
    }

    pub fn with_failed(&self, failed: bool) -> JobRun {
        JobRun {
            failed,
            ..self.clone()
        }
    }

    pub fn with_cancelled(&self, cancelled: bool) -> JobRun {
        JobRun {
            cancelled,
            ..self.clone()
        }
    }

    pub fn with_terminated_time(&self, time: Option<DateTime<Utc>>) -> JobRun {
        JobRun {
            terminated_time: time,
            ..self.clone()
        }
    }

    pub fn with_returned(&self, returned: bool) -> JobRun {
        JobRun {
            returned,
            ..self.clone()
        }
    }

    pub fn with_attempted(&self, run_attempted: bool) -> JobRun {
        JobRun {
            run_attempted,
            ..self.clone()
        }
    }

    /// A copy with every terminal flag cleared. Timestamps are kept.
    pub fn without_terminal(&self) -> JobRun {
        JobRun {
            succeeded: false,
            failed: false,
            cancelled: false,
            preempted: false,
            ..self.clone()
        }
    }

    /// A fully independent copy. Runs own all their data, so this is a clone.
    pub fn deep_copy(&self) -> JobRun {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_run() -> JobRun {
        JobRun::from_new(NewRun {
            id: "run-1".to_string(),
            job_id: "job-1".to_string(),
            created: 100,
            executor: "executor-a".to_string(),
            node_id: "executor-a-node-1".to_string(),
            node_name: "node-1".to_string(),
            pool: "cpu".to_string(),
            scheduled_at_priority: Some(5),
            ..Default::default()
        })
    }

    #[test]
    fn with_methods_copy_on_write() {
        let run = base_run();
        let running = run.with_running(true);
        assert!(!run.running());
        assert!(running.running());
        assert_eq!(running.id(), "run-1");
        assert_eq!(running.scheduled_at_priority(), Some(5));
    }

    #[test]
    fn without_terminal_clears_only_terminal_flags() {
        let run = base_run()
            .with_succeeded(true)
            .with_failed(true)
            .with_returned(true);
        let cleared = run.without_terminal();
        assert!(!cleared.in_terminal_state());
        assert!(cleared.returned());
    }

    #[test]
    fn assert_reports_every_violation() {
        let run = JobRun::from_new(NewRun::default())
            .with_succeeded(true)
            .with_cancelled(true);
        match run.assert() {
            Err(JobDbError::InvalidRun { violations, .. }) => {
                assert_eq!(violations.len(), 3);
                assert!(violations.contains("terminal states"));
            }
            other => panic!("expected invalid run, got {other:?}"),
        }
        assert!(base_run().assert().is_ok());
    }
}
