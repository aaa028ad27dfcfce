//! Folding repository updates into the job database.

use std::collections::{BTreeMap, HashMap};

use tracing::{debug, trace};

use crate::database::{DbJob, DbRun};
use crate::error::Result;
use crate::internaltypes::JobSchedulingInfo;
use crate::jobdb::{Job, JobDb, JobRun, NewJob, NewRun, Txn};
use crate::pricing::PriceBand;

/// An updated job together with every state transition applied to produce it.
///
/// Flags are cumulative: a job that went queued -> leased -> queued ->
/// running -> failed between two reconciliations has queued, leased, running
/// and failed all set.
#[derive(Debug, Clone, PartialEq)]
pub struct JobStateTransitions {
    pub job: Job,

    pub queued: bool,
    pub leased: bool,
    pub pending: bool,
    pub running: bool,
    pub cancelled: bool,
    pub preemption_requested: bool,
    pub preempted: bool,
    pub failed: bool,
    pub succeeded: bool,
}

impl JobStateTransitions {
    /// A record for `job` with no transitions.
    pub fn new(job: Job) -> Self {
        Self {
            job,
            queued: false,
            leased: false,
            pending: false,
            running: false,
            cancelled: false,
            preemption_requested: false,
            preempted: false,
            failed: false,
            succeeded: false,
        }
    }

    /// Fold the transitions of one of the job's runs into the job's. A
    /// returned run puts the job back on the queue.
    pub fn apply_run_state_transitions(&mut self, rst: &RunStateTransitions) {
        self.queued |= rst.returned;
        self.leased |= rst.leased;
        self.pending |= rst.pending;
        self.running |= rst.running;
        self.cancelled |= rst.cancelled;
        self.preemption_requested |= rst.preemption_requested;
        self.preempted |= rst.preempted;
        self.failed |= rst.failed;
        self.succeeded |= rst.succeeded;
    }

    /// Names of the transitions that are set, in lifecycle order.
    pub fn kinds(&self) -> Vec<&'static str> {
        [
            (self.queued, "queued"),
            (self.leased, "leased"),
            (self.pending, "pending"),
            (self.running, "running"),
            (self.preemption_requested, "preemption_requested"),
            (self.preempted, "preempted"),
            (self.cancelled, "cancelled"),
            (self.failed, "failed"),
            (self.succeeded, "succeeded"),
        ]
        .into_iter()
        .filter_map(|(set, kind)| set.then_some(kind))
        .collect()
    }
}

/// An updated run together with the transitions applied to produce it.
#[derive(Debug, Clone, PartialEq)]
pub struct RunStateTransitions {
    pub job_run: JobRun,

    pub leased: bool,
    pub returned: bool,
    pub pending: bool,
    pub running: bool,
    pub cancelled: bool,
    pub preemption_requested: bool,
    pub preempted: bool,
    pub failed: bool,
    pub succeeded: bool,
}

impl RunStateTransitions {
    fn new(job_run: JobRun) -> Self {
        Self {
            job_run,
            leased: false,
            returned: false,
            pending: false,
            running: false,
            cancelled: false,
            preemption_requested: false,
            preempted: false,
            failed: false,
            succeeded: false,
        }
    }
}

impl JobDb {
    /// Reconcile the jobs in `txn` with records read from the job repository.
    ///
    /// Returns one entry per job that was created or touched, ordered by job
    /// id. Nothing is written to `txn`; callers upsert the returned jobs.
    /// Fails without partial results if a scheduling-info payload cannot be
    /// decoded or a new job cannot be constructed.
    pub fn reconcile_differences(
        &self,
        txn: &Txn<'_>,
        job_repo_jobs: &[DbJob],
        job_repo_runs: &[DbRun],
    ) -> Result<Vec<JobStateTransitions>> {
        // Jobs only reached through an updated run map to None.
        let mut repo_jobs_by_id: BTreeMap<&str, Option<&DbJob>> = BTreeMap::new();
        for run in job_repo_runs {
            repo_jobs_by_id.entry(run.job_id.as_str()).or_insert(None);
        }
        for job in job_repo_jobs {
            repo_jobs_by_id.insert(job.job_id.as_str(), Some(job));
        }

        let mut repo_runs_by_job_id: HashMap<&str, Vec<&DbRun>> = HashMap::new();
        for run in job_repo_runs {
            repo_runs_by_job_id
                .entry(run.job_id.as_str())
                .or_default()
                .push(run);
        }

        let mut jsts: BTreeMap<String, JobStateTransitions> = BTreeMap::new();
        let mut job_ids_to_mark_as_preemption_requested = Vec::new();

        for (job_id, repo_job) in repo_jobs_by_id {
            let job = txn.get_by_id(job_id).cloned();
            let repo_runs = repo_runs_by_job_id
                .get(job_id)
                .map(Vec::as_slice)
                .unwrap_or_default();

            // None when a run arrives for a job deleted before the update was seen.
            let Some(jst) = self.reconcile_job_differences(job, repo_job, repo_runs)? else {
                trace!(job_id, "Ignoring run update for unknown job");
                continue;
            };
            if jst.preemption_requested && jst.job.is_in_gang() {
                job_ids_to_mark_as_preemption_requested.extend(
                    txn.get_gang_job_ids_by_gang_id(jst.job.queue(), jst.job.gang_info().id()),
                );
            }
            jsts.insert(job_id.to_string(), jst);
        }

        let propagated =
            mark_jobs_as_preemption_requested(txn, &job_ids_to_mark_as_preemption_requested, &mut jsts);

        debug!(
            jobs = job_repo_jobs.len(),
            runs = job_repo_runs.len(),
            transitions = jsts.len(),
            gang_propagations = propagated,
            "Reconciled job repository updates"
        );
        Ok(jsts.into_values().collect())
    }

    /// Reconcile one job. `job` is the job currently in the database and
    /// `repo_job` its repository record; either may be absent. Returns `None`
    /// if both are.
    ///
    /// Job-level pending, running and preempted are not tracked here; they
    /// are only ever derived from the job's runs.
    pub fn reconcile_job_differences(
        &self,
        job: Option<Job>,
        repo_job: Option<&DbJob>,
        repo_runs: &[&DbRun],
    ) -> Result<Option<JobStateTransitions>> {
        let mut jst = match (job, repo_job) {
            (None, None) => return Ok(None),
            (None, Some(repo_job)) => {
                let mut jst = JobStateTransitions::new(self.scheduler_job_from_database_job(repo_job)?);
                jst.queued = true;
                jst
            }
            (Some(job), None) => JobStateTransitions::new(job),
            (Some(job), Some(repo_job)) => JobStateTransitions::new(fold_job_record(job, repo_job)?),
        };

        for repo_run in repo_runs {
            let rst = self.reconcile_run_differences(jst.job.run_by_id(&repo_run.run_id), repo_run);
            jst.apply_run_state_transitions(&rst);
            jst.job = jst.job.with_updated_run(rst.job_run);
        }
        Ok(Some(jst))
    }

    /// Reconcile one run with its repository record. Flags only ever move
    /// from false to true; a run seen for the first time reports every flag
    /// the record has set.
    pub fn reconcile_run_differences(
        &self,
        job_run: Option<&JobRun>,
        repo_run: &DbRun,
    ) -> RunStateTransitions {
        let Some(run) = job_run else {
            let mut rst = RunStateTransitions::new(self.scheduler_run_from_database_run(repo_run));
            rst.returned = repo_run.returned;
            rst.pending = repo_run.pending;
            rst.leased = repo_run.leased_timestamp.is_some();
            rst.running = repo_run.running;
            rst.preemption_requested = repo_run.preempt_requested;
            rst.preempted = repo_run.preempted;
            rst.cancelled = repo_run.cancelled;
            rst.failed = repo_run.failed;
            rst.succeeded = repo_run.succeeded;
            let run = enforce_terminal_state_exclusivity(None, rst.job_run.clone(), &mut rst);
            rst.job_run = run;
            return rst;
        };

        let prior = run;
        let mut run = prior.clone();
        let mut rst = RunStateTransitions::new(run.clone());
        if repo_run.leased_timestamp.is_some() && !run.leased() {
            run = run
                .with_leased(true)
                .with_leased_time(repo_run.leased_timestamp);
            rst.leased = true;
        }
        if repo_run.pending && !run.pending() {
            run = run
                .with_pending(true)
                .with_pending_time(repo_run.pending_timestamp);
            rst.pending = true;
        }
        if repo_run.running && !run.running() {
            run = run
                .with_running(true)
                .with_running_time(repo_run.running_timestamp);
            rst.running = true;
        }
        if repo_run.preempt_requested && !run.preempt_requested() {
            run = run.with_preempt_requested(true);
            rst.preemption_requested = true;
        }
        if repo_run.preempted && !run.preempted() {
            run = run
                .with_preempted(true)
                .with_running(false)
                .with_preempted_time(repo_run.preempted_timestamp);
            rst.preempted = true;
        }
        if repo_run.cancelled && !run.cancelled() {
            run = run
                .with_cancelled(true)
                .with_running(false)
                .with_terminated_time(repo_run.terminated_timestamp);
            rst.cancelled = true;
        }
        if repo_run.failed && !run.failed() {
            run = run
                .with_failed(true)
                .with_running(false)
                .with_terminated_time(repo_run.terminated_timestamp);
            rst.failed = true;
        }
        if repo_run.succeeded && !run.succeeded() {
            run = run
                .with_succeeded(true)
                .with_running(false)
                .with_terminated_time(repo_run.terminated_timestamp);
            rst.succeeded = true;
        }
        if repo_run.returned && !run.returned() {
            run = run.with_returned(true).with_running(false);
            rst.returned = true;
        }
        if repo_run.run_attempted && !run.run_attempted() {
            run = run.with_attempted(true);
        }

        rst.job_run = enforce_terminal_state_exclusivity(Some(prior), run, &mut rst);
        rst
    }

    /// Build a job from a repository record it has not been seen in before.
    pub fn scheduler_job_from_database_job(&self, db_job: &DbJob) -> Result<Job> {
        let scheduling_info = JobSchedulingInfo::decode(&db_job.job_id, &db_job.scheduling_info)?;
        let priority = priority_from_db(db_job.priority);

        let mut job = self.new_job(NewJob {
            id: db_job.job_id.clone(),
            job_set: db_job.job_set.clone(),
            queue: db_job.queue.clone(),
            priority,
            scheduling_info,
            queued: db_job.queued,
            queued_version: db_job.queued_version,
            cancel_requested: db_job.cancel_requested,
            cancel_by_jobset_requested: db_job.cancel_by_jobset_requested,
            cancelled: db_job.cancelled,
            submitted_time: db_job.submitted,
            validated: db_job.validated,
            pools: db_job.pools.clone(),
            price_band: PriceBand::from(db_job.price_band),
        })?;

        if db_job.failed {
            job = job.with_failed(true);
        }
        if db_job.succeeded {
            job = job.with_succeeded(true);
        }
        if db_job.cancel_user.is_some() {
            job = job.with_cancel_user(db_job.cancel_user.as_deref());
        }
        if priority != job.requested_priority() {
            job = job.with_requested_priority(priority);
        }
        Ok(job)
    }

    /// Build a run from a repository record it has not been seen in before.
    pub fn scheduler_run_from_database_run(&self, db_run: &DbRun) -> JobRun {
        self.create_run(NewRun {
            id: db_run.run_id.clone(),
            job_id: db_run.job_id.clone(),
            created: db_run.created,
            executor: db_run.executor.clone(),
            node_id: node_id_from_executor_and_node_name(&db_run.executor, &db_run.node),
            node_name: db_run.node.clone(),
            pool: db_run.pool.clone(),
            scheduled_at_priority: db_run.scheduled_at_priority,
            leased: db_run.leased_timestamp.is_some(),
            pending: db_run.pending,
            running: db_run.running,
            preempt_requested: db_run.preempt_requested,
            preempted: db_run.preempted,
            succeeded: db_run.succeeded,
            failed: db_run.failed,
            cancelled: db_run.cancelled,
            leased_time: db_run.leased_timestamp,
            pending_time: db_run.pending_timestamp,
            running_time: db_run.running_timestamp,
            preempted_time: db_run.preempted_timestamp,
            terminated_time: db_run.terminated_timestamp,
            returned: db_run.returned,
            run_attempted: db_run.run_attempted,
        })
    }
}

/// Apply a repository record to an existing job. Booleans only move from
/// false to true; the cancelling user is set at most once.
fn fold_job_record(mut job: Job, repo_job: &DbJob) -> Result<Job> {
    if repo_job.validated && !job.validated() {
        job = job.with_validated(true).with_pools(&repo_job.pools);
    }
    if repo_job.cancel_requested && !job.cancel_requested() {
        job = job.with_cancel_requested(true);
    }
    if repo_job.cancel_by_jobset_requested && !job.cancel_by_jobset_requested() {
        job = job.with_cancel_by_jobset_requested(true);
    }
    if repo_job.cancel_user.is_some() && job.cancel_user().is_none() {
        job = job.with_cancel_user(repo_job.cancel_user.as_deref());
    }
    if repo_job.cancelled && !job.cancelled() {
        job = job.with_cancelled(true);
    }
    if repo_job.succeeded && !job.succeeded() {
        job = job.with_succeeded(true);
    }
    if repo_job.failed && !job.failed() {
        job = job.with_failed(true);
    }
    let requested_priority = priority_from_db(repo_job.priority);
    if requested_priority != job.requested_priority() {
        job = job.with_requested_priority(requested_priority);
    }
    if repo_job.scheduling_info_version > job.job_scheduling_info().version {
        let scheduling_info = JobSchedulingInfo::decode(&repo_job.job_id, &repo_job.scheduling_info)?;
        job = job.with_job_scheduling_info(scheduling_info);
    }
    // A stale record must not undo a more recent queue transition.
    if repo_job.queued_version > job.queued_version() {
        job = job
            .with_queued_version(repo_job.queued_version)
            .with_queued(repo_job.queued);
    }
    Ok(job)
}

/// Leave at most one terminal flag set on `job_run`, by precedence
/// succeeded > failed > cancelled > preempted, and make `rst` agree.
///
/// `prior` is the run before this pass folded the repository record into
/// it, or `None` for a run seen for the first time. The winning state is
/// reported only if `prior` was not already in it.
pub fn enforce_terminal_state_exclusivity(
    prior: Option<&JobRun>,
    job_run: JobRun,
    rst: &mut RunStateTransitions,
) -> JobRun {
    let terminal = [
        job_run.succeeded(),
        job_run.failed(),
        job_run.cancelled(),
        job_run.preempted(),
    ];
    if terminal.iter().filter(|&&t| t).count() > 1 {
        trace!(run_id = job_run.id(), ?terminal, "Run reported in several terminal states");
    }

    (rst.succeeded, rst.failed, rst.cancelled, rst.preempted) = (false, false, false, false);
    if job_run.succeeded() {
        rst.succeeded = !prior.is_some_and(JobRun::succeeded);
        return job_run.without_terminal().with_succeeded(true);
    }
    if job_run.failed() {
        rst.failed = !prior.is_some_and(JobRun::failed);
        return job_run.without_terminal().with_failed(true);
    }
    if job_run.cancelled() {
        rst.cancelled = !prior.is_some_and(JobRun::cancelled);
        return job_run.without_terminal().with_cancelled(true);
    }
    if job_run.preempted() {
        rst.preempted = !prior.is_some_and(JobRun::preempted);
        return job_run.without_terminal().with_preempted(true);
    }
    job_run
}

/// Request preemption of the latest run of every listed job that has not
/// already had it requested. Returns the number of jobs marked.
fn mark_jobs_as_preemption_requested(
    txn: &Txn<'_>,
    job_ids: &[String],
    jsts: &mut BTreeMap<String, JobStateTransitions>,
) -> usize {
    let mut marked = 0;
    for job_id in job_ids {
        let (mut jst, touched) = match jsts.remove(job_id) {
            Some(jst) => (jst, true),
            None => match txn.get_by_id(job_id) {
                Some(job) => (JobStateTransitions::new(job.clone()), false),
                None => continue,
            },
        };
        let run = jst
            .job
            .latest_run()
            .filter(|run| !jst.preemption_requested && !run.preempt_requested())
            .map(|run| run.with_preempt_requested(true));
        let marked_now = run.is_some();
        if let Some(run) = run {
            jst.job = jst.job.with_updated_run(run);
            jst.preemption_requested = true;
            marked += 1;
        }
        if touched || marked_now {
            jsts.insert(job_id.clone(), jst);
        }
    }
    marked
}

fn priority_from_db(priority: i64) -> u32 {
    priority.clamp(0, i64::from(u32::MAX)) as u32
}

/// The node id the scheduler uses for a node of an executor.
pub fn node_id_from_executor_and_node_name(executor: &str, node_name: &str) -> String {
    format!("{executor}-{node_name}")
}
