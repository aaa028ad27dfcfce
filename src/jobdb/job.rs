use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::{InvariantViolations, JobDbError, Result};
use crate::internaltypes::{
    JobSchedulingInfo, PodRequirements, PriorityClass, ResourceList, ResourceType, SchedulingKey,
};
use crate::jobdb::gang::GangInfo;
use crate::jobdb::run::{JobRun, NewRun};
use crate::jobdb::JobDbContext;
use crate::pricing::{Bid, PriceBand, NON_PREEMPTIBLE_RUNNING_PRICE};
use crate::proto;

/// Fields for [`crate::jobdb::JobDb::new_job`].
#[derive(Debug, Clone, Default)]
pub struct NewJob {
    pub id: String,
    pub job_set: String,
    pub queue: String,
    pub priority: u32,
    pub scheduling_info: JobSchedulingInfo,
    pub queued: bool,
    pub queued_version: i32,
    pub cancel_requested: bool,
    pub cancel_by_jobset_requested: bool,
    pub cancelled: bool,
    /// Submission time in nanoseconds since the epoch
    pub submitted_time: i64,
    pub validated: bool,
    pub pools: Vec<String>,
    pub price_band: PriceBand,
}

/// The scheduler's view of a submitted job.
///
/// Jobs are immutable values. Every `with_*` method returns a new job and
/// leaves the receiver untouched; unchanged nested data (runs, scheduling
/// info, pools, bids) is shared between the two. A job held by a read
/// transaction therefore never changes underneath it.
///
/// Exactly one of queued, running, succeeded, cancelled and failed describes a
/// job at any time. Running is not stored: it is the absence of the other four.
#[derive(Clone)]
pub struct Job {
    ctx: Arc<JobDbContext>,
    id: Arc<str>,
    queue: Arc<str>,
    job_set: Arc<str>,
    priority: u32,
    // May lag `priority` while a reprioritisation is in flight.
    requested_priority: u32,
    submitted_time: i64,
    scheduling_key: SchedulingKey,
    validated: bool,
    queued: bool,
    // Bumped on every queued <-> leased transition.
    queued_version: i32,
    scheduling_info: Arc<JobSchedulingInfo>,
    all_resource_requirements: ResourceList,
    kubernetes_resource_requirements: ResourceList,
    priority_class: Arc<PriorityClass>,
    cancel_requested: bool,
    cancel_user: Option<Arc<str>>,
    cancel_by_jobset_requested: bool,
    cancelled: bool,
    failed: bool,
    succeeded: bool,
    runs_by_id: Arc<HashMap<String, JobRun>>,
    // Key into runs_by_id of the run with the greatest creation time.
    active_run_id: Option<String>,
    active_run_timestamp: i64,
    pools: Arc<[String]>,
    price_band: PriceBand,
    bid_prices_pool: Arc<HashMap<String, Bid>>,
    gang_info: Arc<GangInfo>,
}

impl Job {
    pub(crate) fn new(ctx: Arc<JobDbContext>, params: NewJob) -> Result<Job> {
        let construction_error = |source: JobDbError| JobDbError::JobConstruction {
            job_id: params.id.clone(),
            source: Box::new(source),
        };

        let priority_class = ctx.priority_class(&params.scheduling_info.priority_class_name);
        let all_resource_requirements = ctx
            .resource_requirements(&params.scheduling_info)
            .map_err(construction_error)?;
        let gang_info = GangInfo::from_annotations(&params.scheduling_info.pod_requirements.annotations)
            .map_err(construction_error)?;
        let scheduling_key = ctx.scheduling_key(&params.scheduling_info);

        Ok(Job {
            kubernetes_resource_requirements: all_resource_requirements
                .of_type(ResourceType::Kubernetes),
            all_resource_requirements,
            scheduling_key,
            priority_class,
            gang_info: Arc::new(gang_info),
            ctx,
            id: params.id.into(),
            queue: params.queue.into(),
            job_set: params.job_set.into(),
            priority: params.priority,
            requested_priority: params.priority,
            submitted_time: params.submitted_time,
            validated: params.validated,
            queued: params.queued,
            queued_version: params.queued_version,
            scheduling_info: Arc::new(params.scheduling_info),
            cancel_requested: params.cancel_requested,
            cancel_user: None,
            cancel_by_jobset_requested: params.cancel_by_jobset_requested,
            cancelled: params.cancelled,
            failed: false,
            succeeded: false,
            runs_by_id: Arc::new(HashMap::new()),
            active_run_id: None,
            active_run_timestamp: 0,
            pools: params.pools.into(),
            price_band: params.price_band,
            bid_prices_pool: Arc::new(HashMap::new()),
        })
    }

    /// Check every job invariant and return all violations found.
    ///
    /// Intended for tests and debugging, not the scheduling hot path.
    ///
    /// Valid job state transitions are:
    /// - queued -> {running, cancelled, failed}
    /// - running -> {queued, cancelled, failed, succeeded}
    /// - succeeded, cancelled, failed -> {}
    ///
    /// `queued_version` starts at 0 and is bumped on every change of the queued
    /// flag, so it is `2 * runs` while queued, `2 * runs - 1` while running or
    /// succeeded, and either of the two once cancelled or failed.
    pub fn assert(&self) -> Result<()> {
        let mut v = InvariantViolations::new();

        if self.id.is_empty() {
            v.push("job has an empty id");
        }
        if self.queue.is_empty() {
            v.push("job has an empty queue");
        }
        if self.job_set.is_empty() {
            v.push("job has an empty jobSet");
        }

        let latest_run = self.latest_run();
        for (run_id, run) in self.runs_by_id.iter() {
            if run_id != run.id() {
                v.push(format!("run {} is keyed by {run_id}", run.id()));
            }
            if let Some(latest) = latest_run {
                if run.created() > latest.created() {
                    v.push(format!("run {} is more recent than latestRun", run.id()));
                }
            }
            if run.job_id() != self.id() {
                v.push(format!("run {} has a conflicting jobId", run.id()));
            }
            if let Err(JobDbError::InvalidRun { violations, .. }) = run.assert() {
                v.extend(violations);
            }
        }
        if !self.runs_by_id.is_empty() && latest_run.is_none() {
            v.push("job has runs but no latestRun");
        }

        let num_runs = self.runs_by_id.len() as i32;
        let qv = self.queued_version;
        if self.queued {
            if self.succeeded {
                v.push("job is marked as both queued and succeeded");
            }
            if self.cancelled {
                v.push("job is marked as both queued and cancelled");
            }
            if self.failed {
                v.push("job is marked as both queued and failed");
            }
            if 2 * num_runs != qv {
                v.push(format!(
                    "job is queued but queuedVersion ({qv}) is not 2x the number of runs ({num_runs})"
                ));
            }
            if let Some(run) = latest_run {
                if run.running() {
                    v.push("job is queued but latestRun is running");
                } else if run.succeeded() {
                    v.push("job is queued but latestRun is succeeded");
                } else if run.cancelled() {
                    v.push("job is queued but latestRun is cancelled");
                }
            }
        } else if self.succeeded {
            if self.cancelled {
                v.push("job is marked as both succeeded and cancelled");
            }
            if self.failed {
                v.push("job is marked as both succeeded and failed");
            }
            if 2 * num_runs - 1 != qv {
                v.push(format!(
                    "job is succeeded but queuedVersion ({qv}) is not one less than 2x the number of runs ({num_runs})"
                ));
            }
            match latest_run {
                Some(run) if !run.succeeded() => v.push("job is succeeded but latestRun is not"),
                Some(_) => {}
                None => v.push("job is succeeded but has no associated runs"),
            }
        } else if self.cancelled {
            if !self.cancel_requested && !self.cancel_by_jobset_requested {
                v.push("job is cancelled but not marked as cancel requested");
            }
            if self.failed {
                v.push("job is marked as both cancelled and failed");
            }
            if 2 * num_runs != qv && 2 * num_runs - 1 != qv {
                v.push(format!(
                    "job is cancelled but queuedVersion ({qv}) is not either equal to or one less than 2x the number of runs ({num_runs})"
                ));
            }
            if latest_run.is_some_and(|run| !run.in_terminal_state()) {
                v.push("job is cancelled but has an active run");
            }
        } else if self.failed {
            if 2 * num_runs != qv && 2 * num_runs - 1 != qv {
                v.push(format!(
                    "job is failed but queuedVersion ({qv}) is not either equal to or one less than 2x the number of runs ({num_runs})"
                ));
            }
            if latest_run.is_some_and(|run| !run.in_terminal_state()) {
                v.push("job is failed but has an active run");
            }
        } else {
            // Running: none of the other states apply.
            if 2 * num_runs - 1 != qv {
                v.push(format!(
                    "job is running but queuedVersion ({qv}) is not one less than 2x the number of runs ({num_runs})"
                ));
            }
            match latest_run {
                Some(run) if run.cancelled() => v.push("job is running but latestRun is cancelled"),
                Some(run) if run.failed() => v.push("job is running but latestRun is failed"),
                Some(run) if run.succeeded() => v.push("job is running but latestRun is succeeded"),
                Some(run) if run.returned() => v.push("job is running but latestRun is returned"),
                Some(_) => {}
                None => v.push("job is running but has no associated run"),
            }
        }

        if v.is_empty() {
            Ok(())
        } else {
            Err(JobDbError::InvalidJob {
                job_id: self.id.to_string(),
                violations: v,
            })
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn job_set(&self) -> &str {
        &self.job_set
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn requested_priority(&self) -> u32 {
        self.requested_priority
    }

    pub fn priority_class(&self) -> &PriorityClass {
        &self.priority_class
    }

    /// Priority class name as submitted. May differ from `priority_class().name`
    /// when the submitted name was unknown and the default class was used.
    pub fn priority_class_name(&self) -> &str {
        &self.scheduling_info.priority_class_name
    }

    pub fn scheduling_key(&self) -> SchedulingKey {
        self.scheduling_key
    }

    /// Submission time in nanoseconds since the epoch.
    pub fn created(&self) -> i64 {
        self.submitted_time
    }

    pub fn submit_time(&self) -> DateTime<Utc> {
        self.scheduling_info.submit_time
    }

    pub fn job_scheduling_info(&self) -> &JobSchedulingInfo {
        &self.scheduling_info
    }

    pub fn pod_requirements(&self) -> &PodRequirements {
        &self.scheduling_info.pod_requirements
    }

    pub fn annotations(&self) -> &std::collections::BTreeMap<String, String> {
        &self.scheduling_info.pod_requirements.annotations
    }

    pub fn node_selector(&self) -> &std::collections::BTreeMap<String, String> {
        &self.scheduling_info.pod_requirements.node_selector
    }

    pub fn affinity(&self) -> Option<&proto::Affinity> {
        self.scheduling_info.pod_requirements.affinity.as_ref()
    }

    pub fn tolerations(&self) -> &[proto::Toleration] {
        &self.scheduling_info.pod_requirements.tolerations
    }

    /// All requested resources, floating ones included.
    pub fn all_resource_requirements(&self) -> &ResourceList {
        &self.all_resource_requirements
    }

    pub fn kubernetes_resource_requirements(&self) -> &ResourceList {
        &self.kubernetes_resource_requirements
    }

    pub fn requests_floating_resources(&self) -> bool {
        !self
            .all_resource_requirements
            .of_type(ResourceType::Floating)
            .all_zero()
    }

    /// True if the job should be considered for scheduling.
    pub fn queued(&self) -> bool {
        self.queued
    }

    pub fn queued_version(&self) -> i32 {
        self.queued_version
    }

    pub fn validated(&self) -> bool {
        self.validated
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel_requested
    }

    pub fn cancel_by_jobset_requested(&self) -> bool {
        self.cancel_by_jobset_requested
    }

    /// The first user who asked for this job to be cancelled.
    pub fn cancel_user(&self) -> Option<&str> {
        self.cancel_user.as_deref()
    }

    pub fn cancelled(&self) -> bool {
        self.cancelled
    }

    pub fn failed(&self) -> bool {
        self.failed
    }

    pub fn succeeded(&self) -> bool {
        self.succeeded
    }

    pub fn in_terminal_state(&self) -> bool {
        self.succeeded || self.cancelled || self.failed
    }

    /// If this returns true, `latest_run` is guaranteed to be `Some`.
    pub fn has_runs(&self) -> bool {
        self.active_run_id.is_some()
    }

    /// The run with the greatest creation time, if any.
    pub fn latest_run(&self) -> Option<&JobRun> {
        self.active_run_id
            .as_deref()
            .and_then(|id| self.runs_by_id.get(id))
    }

    pub fn active_run_timestamp(&self) -> i64 {
        self.active_run_timestamp
    }

    pub fn run_by_id(&self, run_id: &str) -> Option<&JobRun> {
        self.runs_by_id.get(run_id)
    }

    pub fn all_runs(&self) -> Vec<&JobRun> {
        self.runs_by_id.values().collect()
    }

    /// Number of runs the executors handed back. O(runs).
    pub fn num_returned(&self) -> usize {
        self.runs_by_id.values().filter(|r| r.returned()).count()
    }

    /// Number of runs an executor actually tried to start. O(runs).
    pub fn num_attempts(&self) -> usize {
        self.runs_by_id.values().filter(|r| r.run_attempted()).count()
    }

    /// Priority the latest run was scheduled at, if it has been scheduled.
    pub fn scheduled_at_priority(&self) -> Option<i32> {
        self.latest_run().and_then(JobRun::scheduled_at_priority)
    }

    /// Pools the job is eligible for.
    pub fn pools(&self) -> &[String] {
        &self.pools
    }

    /// The pools the job can run in while queued; once leased, only the pool
    /// of the active run.
    pub fn resolved_pools(&self) -> Vec<String> {
        match self.latest_run() {
            Some(run) if !self.queued => vec![run.pool().to_string()],
            _ => self.pools.to_vec(),
        }
    }

    pub fn price_band(&self) -> PriceBand {
        self.price_band
    }

    /// The bid used for scheduling and preemption decisions in `pool`.
    ///
    /// Running jobs that cannot be preempted bid
    /// [`NON_PREEMPTIBLE_RUNNING_PRICE`] so they never lose a price comparison.
    pub fn get_bid_price(&self, pool: &str) -> f64 {
        if !self.queued && !self.priority_class.preemptible {
            return NON_PREEMPTIBLE_RUNNING_PRICE;
        }
        self.get_raw_bid_price(pool)
    }

    /// The stored bid for `pool`, ignoring preemptibility. Diagnostics only;
    /// use [`Job::get_bid_price`] for decisions.
    pub fn get_raw_bid_price(&self, pool: &str) -> f64 {
        match self.bid_prices_pool.get(pool) {
            None => 0.0,
            Some(bid) if self.queued => bid.queued_bid,
            Some(bid) => bid.running_bid,
        }
    }

    pub fn all_bid_prices(&self) -> HashMap<String, Bid> {
        (*self.bid_prices_pool).clone()
    }

    pub fn gang_info(&self) -> &GangInfo {
        &self.gang_info
    }

    pub fn is_in_gang(&self) -> bool {
        self.gang_info.is_gang()
    }

    pub fn with_priority(&self, priority: u32) -> Job {
        Job {
            priority,
            ..self.clone()
        }
    }

    pub fn with_requested_priority(&self, requested_priority: u32) -> Job {
        Job {
            requested_priority,
            ..self.clone()
        }
    }

    pub fn with_priority_class(&self, priority_class: PriorityClass) -> Job {
        Job {
            priority_class: Arc::new(priority_class),
            ..self.clone()
        }
    }

    pub fn with_pools(&self, pools: &[String]) -> Job {
        Job {
            pools: pools.into(),
            ..self.clone()
        }
    }

    pub fn with_submitted_time(&self, submitted_time: i64) -> Job {
        Job {
            submitted_time,
            ..self.clone()
        }
    }

    pub fn with_queued(&self, queued: bool) -> Job {
        Job {
            queued,
            ..self.clone()
        }
    }

    pub fn with_queued_version(&self, queued_version: i32) -> Job {
        Job {
            queued_version,
            ..self.clone()
        }
    }

    pub fn with_validated(&self, validated: bool) -> Job {
        Job {
            validated,
            ..self.clone()
        }
    }

    pub fn with_cancel_requested(&self, cancel_requested: bool) -> Job {
        Job {
            cancel_requested,
            ..self.clone()
        }
    }

    pub fn with_cancel_by_jobset_requested(&self, cancel_by_jobset_requested: bool) -> Job {
        Job {
            cancel_by_jobset_requested,
            ..self.clone()
        }
    }

    pub fn with_cancel_user(&self, cancel_user: Option<&str>) -> Job {
        Job {
            cancel_user: cancel_user.map(Arc::from),
            ..self.clone()
        }
    }

    pub fn with_cancelled(&self, cancelled: bool) -> Job {
        Job {
            cancelled,
            ..self.clone()
        }
    }

    pub fn with_succeeded(&self, succeeded: bool) -> Job {
        Job {
            succeeded,
            ..self.clone()
        }
    }

    pub fn with_failed(&self, failed: bool) -> Job {
        Job {
            failed,
            ..self.clone()
        }
    }

    pub fn without_terminal(&self) -> Job {
        Job {
            cancelled: false,
            failed: false,
            succeeded: false,
            ..self.clone()
        }
    }

    pub fn with_job_set(&self, job_set: &str) -> Job {
        Job {
            job_set: job_set.into(),
            ..self.clone()
        }
    }

    pub fn with_queue(&self, queue: &str) -> Job {
        Job {
            queue: queue.into(),
            ..self.clone()
        }
    }

    pub fn with_bid_prices(&self, bids: HashMap<String, Bid>) -> Job {
        Job {
            bid_prices_pool: Arc::new(bids),
            ..self.clone()
        }
    }

    pub fn with_price_band(&self, price_band: PriceBand) -> Job {
        Job {
            price_band,
            ..self.clone()
        }
    }

    pub fn with_gang_info(&self, gang_info: GangInfo) -> Job {
        Job {
            gang_info: Arc::new(gang_info),
            ..self.clone()
        }
    }

    /// Replace the scheduling requirements, recomputing the scheduling key and
    /// resource requirements derived from them. Requests for resource types
    /// the database does not know are ignored.
    pub fn with_job_scheduling_info(&self, scheduling_info: JobSchedulingInfo) -> Job {
        let all_resource_requirements = self.ctx.known_resource_requirements(&scheduling_info);
        Job {
            scheduling_key: self.ctx.scheduling_key(&scheduling_info),
            kubernetes_resource_requirements: all_resource_requirements
                .of_type(ResourceType::Kubernetes),
            all_resource_requirements,
            scheduling_info: Arc::new(scheduling_info),
            ..self.clone()
        }
    }

    /// A copy with a freshly leased run on the given node.
    pub fn with_new_run(
        &self,
        executor: &str,
        node_id: &str,
        node_name: &str,
        pool: &str,
        scheduled_at_priority: i32,
    ) -> Job {
        let now = self.ctx.clock.now();
        let run = self.ctx.create_run(NewRun {
            id: self.ctx.id_generator.next_id(),
            job_id: self.id.to_string(),
            created: now.timestamp_nanos_opt().unwrap_or(i64::MAX),
            executor: executor.to_string(),
            node_id: node_id.to_string(),
            node_name: node_name.to_string(),
            pool: pool.to_string(),
            scheduled_at_priority: Some(scheduled_at_priority),
            leased_time: Some(now),
            ..Default::default()
        });
        self.with_updated_run(run)
    }

    /// A copy with `run` upserted. The run becomes the active run unless an
    /// existing run was created strictly later; on equal creation times the
    /// most recently applied run wins.
    pub fn with_updated_run(&self, run: JobRun) -> Job {
        let mut job = self.clone();
        if job.active_run_id.is_none() || run.created() >= job.active_run_timestamp {
            job.active_run_timestamp = run.created();
            job.active_run_id = Some(run.id().to_string());
        }
        Arc::make_mut(&mut job.runs_by_id).insert(run.id().to_string(), run);
        job
    }

    /// A copy that shares no nested data with this job.
    pub fn deep_copy(&self) -> Job {
        let runs: HashMap<String, JobRun> = self
            .runs_by_id
            .iter()
            .map(|(id, run)| (id.clone(), run.deep_copy()))
            .collect();
        Job {
            id: Arc::from(&*self.id),
            queue: Arc::from(&*self.queue),
            job_set: Arc::from(&*self.job_set),
            scheduling_info: Arc::new((*self.scheduling_info).clone()),
            scheduling_key: self.ctx.scheduling_key(&self.scheduling_info),
            priority_class: Arc::new((*self.priority_class).clone()),
            cancel_user: self.cancel_user.as_deref().map(Arc::from),
            runs_by_id: Arc::new(runs),
            pools: self.pools.to_vec().into(),
            bid_prices_pool: Arc::new((*self.bid_prices_pool).clone()),
            gang_info: Arc::new((*self.gang_info).clone()),
            ..self.clone()
        }
    }
}

/// Structural equality. Scheduling requirements are compared through the
/// cached scheduling key rather than field by field.
impl PartialEq for Job {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.queue == other.queue
            && self.job_set == other.job_set
            && self.priority == other.priority
            && self.requested_priority == other.requested_priority
            && self.submitted_time == other.submitted_time
            && self.scheduling_key == other.scheduling_key
            && self.queued == other.queued
            && self.queued_version == other.queued_version
            && self.priority_class == other.priority_class
            && self.validated == other.validated
            && self.cancel_requested == other.cancel_requested
            && self.cancel_by_jobset_requested == other.cancel_by_jobset_requested
            && self.cancel_user == other.cancel_user
            && self.cancelled == other.cancelled
            && self.failed == other.failed
            && self.succeeded == other.succeeded
            && self.latest_run() == other.latest_run()
            && self.active_run_timestamp == other.active_run_timestamp
            && self.pools == other.pools
            && self.price_band == other.price_band
            && self.bid_prices_pool == other.bid_prices_pool
            && self.gang_info == other.gang_info
            && self.runs_by_id == other.runs_by_id
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("queue", &self.queue)
            .field("job_set", &self.job_set)
            .field("priority", &self.priority)
            .field("requested_priority", &self.requested_priority)
            .field("priority_class", &self.priority_class.name)
            .field("scheduling_key", &self.scheduling_key)
            .field("queued", &self.queued)
            .field("queued_version", &self.queued_version)
            .field("validated", &self.validated)
            .field("cancel_requested", &self.cancel_requested)
            .field("cancel_by_jobset_requested", &self.cancel_by_jobset_requested)
            .field("cancel_user", &self.cancel_user)
            .field("cancelled", &self.cancelled)
            .field("failed", &self.failed)
            .field("succeeded", &self.succeeded)
            .field("active_run", &self.active_run_id)
            .field("runs", &self.runs_by_id.len())
            .field("pools", &self.pools)
            .field("gang", &self.gang_info)
            .finish()
    }
}
