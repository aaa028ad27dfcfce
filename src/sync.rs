//! Keeps a [`JobDb`] in step with the job repository.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::database::JobRepository;
use crate::error::Result;
use crate::jobdb::{JobDb, JobStateTransitions};

/// Number of jobs that went through each kind of transition in one cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransitionCounts {
    pub queued: usize,
    pub leased: usize,
    pub pending: usize,
    pub running: usize,
    pub cancelled: usize,
    pub preemption_requested: usize,
    pub preempted: usize,
    pub failed: usize,
    pub succeeded: usize,
}

impl TransitionCounts {
    pub fn from_transitions(jsts: &[JobStateTransitions]) -> Self {
        let mut counts = Self::default();
        for jst in jsts {
            counts.record(jst);
        }
        counts
    }

    pub fn record(&mut self, jst: &JobStateTransitions) {
        self.queued += usize::from(jst.queued);
        self.leased += usize::from(jst.leased);
        self.pending += usize::from(jst.pending);
        self.running += usize::from(jst.running);
        self.cancelled += usize::from(jst.cancelled);
        self.preemption_requested += usize::from(jst.preemption_requested);
        self.preempted += usize::from(jst.preempted);
        self.failed += usize::from(jst.failed);
        self.succeeded += usize::from(jst.succeeded);
    }

    pub fn total(&self) -> usize {
        self.queued
            + self.leased
            + self.pending
            + self.running
            + self.cancelled
            + self.preemption_requested
            + self.preempted
            + self.failed
            + self.succeeded
    }
}

/// The result of one successful sync cycle.
#[derive(Debug, Clone)]
pub struct CycleOutcome {
    pub transitions: Vec<JobStateTransitions>,
    pub counts: TransitionCounts,
    /// Jobs removed from the database because they reached a terminal state
    pub deleted: usize,
}

/// Fetches repository changes and reconciles them into a [`JobDb`].
///
/// The cursors only advance when a cycle commits, so a failed cycle is
/// retried in full by the next one.
pub struct SyncCycle {
    job_db: Arc<JobDb>,
    repository: Arc<dyn JobRepository>,
    job_serial: i64,
    run_serial: i64,
}

impl SyncCycle {
    pub fn new(job_db: Arc<JobDb>, repository: Arc<dyn JobRepository>) -> Self {
        Self {
            job_db,
            repository,
            job_serial: 0,
            run_serial: 0,
        }
    }

    pub fn job_db(&self) -> &Arc<JobDb> {
        &self.job_db
    }

    /// Serials of the last job and run record applied.
    pub fn cursors(&self) -> (i64, i64) {
        (self.job_serial, self.run_serial)
    }

    pub fn run_once(&mut self) -> Result<CycleOutcome> {
        let (jobs, runs) = self
            .repository
            .fetch_job_updates(self.job_serial, self.run_serial)?;

        // Dropping the transaction on any error below discards the batch.
        let mut txn = self.job_db.write_txn();
        let transitions = self.job_db.reconcile_differences(&txn, &jobs, &runs)?;

        let mut terminal = Vec::new();
        let mut live = Vec::new();
        for jst in &transitions {
            if jst.job.in_terminal_state() {
                terminal.push(jst.job.id().to_string());
            } else {
                live.push(jst.job.clone());
            }
        }
        txn.upsert(live)?;
        txn.delete(&terminal)?;
        txn.commit()?;

        if let Some(serial) = jobs.iter().map(|j| j.serial).max() {
            self.job_serial = self.job_serial.max(serial);
        }
        if let Some(serial) = runs.iter().map(|r| r.serial).max() {
            self.run_serial = self.run_serial.max(serial);
        }

        let counts = TransitionCounts::from_transitions(&transitions);
        tracing::debug!(
            jobs = jobs.len(),
            runs = runs.len(),
            updated = transitions.len(),
            deleted = terminal.len(),
            transitions = counts.total(),
            job_serial = self.job_serial,
            run_serial = self.run_serial,
            "Sync cycle committed"
        );

        Ok(CycleOutcome {
            transitions,
            counts,
            deleted: terminal.len(),
        })
    }
}

/// Run sync cycles every `interval` until `shutdown` is cancelled.
///
/// Outcomes are forwarded to `outcomes` for event publishing; a closed
/// receiver is not an error. A failed cycle is logged and retried on the
/// next tick.
pub async fn run_sync_loop(
    mut cycle: SyncCycle,
    interval: Duration,
    shutdown: CancellationToken,
    outcomes: mpsc::Sender<CycleOutcome>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    tracing::info!(interval_ms = interval.as_millis() as u64, "Job database sync started");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                break;
            }
            _ = ticker.tick() => {
                match cycle.run_once() {
                    Ok(outcome) => {
                        if !outcomes.is_closed() && outcomes.send(outcome).await.is_err() {
                            tracing::debug!("Sync outcome receiver dropped");
                        }
                    }
                    Err(e) => {
                        let (job_serial, run_serial) = cycle.cursors();
                        tracing::warn!(error = %e, job_serial, run_serial, "Sync cycle failed, retrying next tick");
                    }
                }
            }
        }
    }

    tracing::info!("Job database sync stopped");
}
