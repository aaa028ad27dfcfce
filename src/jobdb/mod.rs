//! The in-memory job database.
//!
//! Jobs and runs are immutable values; the database holds an index of the
//! current jobs and hands out snapshot transactions over it. Any number of
//! read transactions may be open while a single write transaction prepares
//! the next snapshot.

pub mod gang;
pub mod job;
pub mod providers;
pub mod reconciliation;
pub mod run;
pub mod txn;

pub use gang::GangInfo;
pub use job::{Job, NewJob};
pub use providers::{Clock, IdGenerator, ManualClock, SystemClock, UuidGenerator};
pub use reconciliation::{JobStateTransitions, RunStateTransitions};
pub use run::{JobRun, NewRun};
pub use txn::Txn;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tracing::debug;

use crate::config::JobDbConfig;
use crate::error::{JobDbError, Result};
use crate::internaltypes::{
    JobSchedulingInfo, PriorityClass, ResourceList, ResourceListFactory, SchedulingKey,
    SchedulingKeyGenerator,
};
use txn::JobIndex;

/// State shared by every job created from one database.
#[derive(Debug)]
pub(crate) struct JobDbContext {
    priority_classes: HashMap<String, Arc<PriorityClass>>,
    default_priority_class: Arc<PriorityClass>,
    resource_list_factory: Arc<ResourceListFactory>,
    scheduling_key_generator: SchedulingKeyGenerator,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) id_generator: Arc<dyn IdGenerator>,
}

impl JobDbContext {
    /// The named priority class, or the default class if the name is unknown.
    pub(crate) fn priority_class(&self, name: &str) -> Arc<PriorityClass> {
        self.priority_classes
            .get(name)
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.default_priority_class))
    }

    pub(crate) fn resource_requirements(&self, info: &JobSchedulingInfo) -> Result<ResourceList> {
        self.resource_list_factory
            .from_job_resource_list_fail_on_unknown(&info.pod_requirements.requests)
    }

    pub(crate) fn known_resource_requirements(&self, info: &JobSchedulingInfo) -> ResourceList {
        self.resource_list_factory
            .from_job_resource_list(&info.pod_requirements.requests)
    }

    pub(crate) fn scheduling_key(&self, info: &JobSchedulingInfo) -> SchedulingKey {
        let reqs = &info.pod_requirements;
        self.scheduling_key_generator.key(
            &reqs.node_selector,
            reqs.affinity.as_ref(),
            &reqs.tolerations,
            &reqs.requests,
            &info.priority_class_name,
        )
    }

    pub(crate) fn create_run(&self, run: NewRun) -> JobRun {
        JobRun::from_new(run)
    }
}

/// A transactional store of jobs.
#[derive(Debug)]
pub struct JobDb {
    ctx: Arc<JobDbContext>,
    committed: RwLock<JobIndex>,
    // Held for the lifetime of a write transaction.
    write_lock: Mutex<()>,
}

impl JobDb {
    /// Create an empty database using the system clock and random run ids.
    pub fn new(config: &JobDbConfig) -> Result<Self> {
        Self::with_providers(config, Arc::new(SystemClock), Arc::new(UuidGenerator))
    }

    pub fn with_providers(
        config: &JobDbConfig,
        clock: Arc<dyn Clock>,
        id_generator: Arc<dyn IdGenerator>,
    ) -> Result<Self> {
        config.validate()?;

        let priority_classes: HashMap<String, Arc<PriorityClass>> = config
            .priority_classes
            .iter()
            .map(|pc| (pc.name.clone(), Arc::new(PriorityClass::from(pc))))
            .collect();
        let default_priority_class = priority_classes
            .get(&config.default_priority_class)
            .cloned()
            .ok_or_else(|| {
                JobDbError::Config(format!(
                    "default priority class {} is not defined",
                    config.default_priority_class
                ))
            })?;
        let resource_list_factory =
            ResourceListFactory::new(&config.resources, &config.floating_resources)?;

        debug!(
            priority_classes = priority_classes.len(),
            resources = resource_list_factory.len(),
            "Created job database"
        );

        Ok(Self {
            ctx: Arc::new(JobDbContext {
                priority_classes,
                default_priority_class,
                resource_list_factory,
                scheduling_key_generator: SchedulingKeyGenerator::new(),
                clock,
                id_generator,
            }),
            committed: RwLock::new(JobIndex::default()),
            write_lock: Mutex::new(()),
        })
    }

    /// Build a job bound to this database. The job is not inserted; upsert it
    /// through a write transaction.
    ///
    /// Fails if the job requests an unknown resource type or carries
    /// malformed gang annotations.
    pub fn new_job(&self, params: NewJob) -> Result<Job> {
        Job::new(Arc::clone(&self.ctx), params)
    }

    /// The only way to build a [`JobRun`].
    pub fn create_run(&self, run: NewRun) -> JobRun {
        self.ctx.create_run(run)
    }

    pub fn resource_list_factory(&self) -> &Arc<ResourceListFactory> {
        &self.ctx.resource_list_factory
    }

    /// The priority class jobs with this name are assigned.
    pub fn priority_class(&self, name: &str) -> PriorityClass {
        (*self.ctx.priority_class(name)).clone()
    }

    /// A read-only snapshot of the committed state. Never blocks on writers.
    pub fn read_txn(&self) -> Txn<'_> {
        Txn::new(self, self.snapshot(), None)
    }

    /// A writable snapshot. Blocks while another write transaction is open.
    ///
    /// Changes become visible to new transactions on [`Txn::commit`]; dropping
    /// the transaction discards them.
    pub fn write_txn(&self) -> Txn<'_> {
        let guard = self
            .write_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Txn::new(self, self.snapshot(), Some(guard))
    }

    fn snapshot(&self) -> JobIndex {
        self.committed
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn publish(&self, index: JobIndex) {
        *self
            .committed
            .write()
            .unwrap_or_else(PoisonError::into_inner) = index;
    }
}
