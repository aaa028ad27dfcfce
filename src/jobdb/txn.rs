use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, MutexGuard};

use crate::error::{InvariantViolations, JobDbError, Result};
use crate::jobdb::{Job, JobDb};

/// Position of a job in its queue: lowest priority value first, then oldest.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct QueuedKey {
    priority: u32,
    submitted: i64,
    id: Arc<str>,
}

impl QueuedKey {
    fn of(job: &Job) -> Self {
        Self {
            priority: job.priority(),
            submitted: job.created(),
            id: job.id().into(),
        }
    }
}

type GangKey = (Arc<str>, Arc<str>);

/// One snapshot of the database. Cloning only bumps reference counts; a
/// write transaction copies an index map the first time it modifies it.
#[derive(Debug, Clone, Default)]
pub(crate) struct JobIndex {
    jobs_by_id: Arc<HashMap<Arc<str>, Job>>,
    job_ids_by_run_id: Arc<HashMap<Arc<str>, Arc<str>>>,
    job_ids_by_gang: Arc<HashMap<GangKey, BTreeSet<Arc<str>>>>,
    queued_jobs_by_queue: Arc<HashMap<Arc<str>, BTreeSet<QueuedKey>>>,
    unvalidated_jobs: Arc<BTreeSet<Arc<str>>>,
}

impl JobIndex {
    fn insert(&mut self, job: Job) {
        let id: Arc<str> = job.id().into();

        let runs = Arc::make_mut(&mut self.job_ids_by_run_id);
        for run in job.all_runs() {
            runs.insert(run.id().into(), Arc::clone(&id));
        }
        if job.is_in_gang() {
            Arc::make_mut(&mut self.job_ids_by_gang)
                .entry(gang_key(&job))
                .or_default()
                .insert(Arc::clone(&id));
        }
        if job.queued() {
            Arc::make_mut(&mut self.queued_jobs_by_queue)
                .entry(job.queue().into())
                .or_default()
                .insert(QueuedKey::of(&job));
        }
        if !job.validated() {
            Arc::make_mut(&mut self.unvalidated_jobs).insert(Arc::clone(&id));
        }
        Arc::make_mut(&mut self.jobs_by_id).insert(id, job);
    }

    fn remove(&mut self, id: &str) -> Option<Job> {
        let job = Arc::make_mut(&mut self.jobs_by_id).remove(id)?;

        if job.has_runs() {
            let runs = Arc::make_mut(&mut self.job_ids_by_run_id);
            for run in job.all_runs() {
                runs.remove(run.id());
            }
        }
        if job.is_in_gang() {
            let gangs = Arc::make_mut(&mut self.job_ids_by_gang);
            let key = gang_key(&job);
            if let Some(members) = gangs.get_mut(&key) {
                members.remove(id);
                if members.is_empty() {
                    gangs.remove(&key);
                }
            }
        }
        if job.queued() {
            let queues = Arc::make_mut(&mut self.queued_jobs_by_queue);
            if let Some(queued) = queues.get_mut(job.queue()) {
                queued.remove(&QueuedKey::of(&job));
                if queued.is_empty() {
                    queues.remove(job.queue());
                }
            }
        }
        if !job.validated() {
            Arc::make_mut(&mut self.unvalidated_jobs).remove(id);
        }
        Some(job)
    }
}

fn gang_key(job: &Job) -> GangKey {
    (job.queue().into(), job.gang_info().id().into())
}

/// A consistent view of the job database.
///
/// Read transactions see the state committed when they were opened for their
/// whole lifetime. Write transactions additionally see their own changes and
/// publish them on [`Txn::commit`]; dropping one without committing discards
/// every change.
pub struct Txn<'a> {
    db: &'a JobDb,
    index: JobIndex,
    write_guard: Option<MutexGuard<'a, ()>>,
}

impl<'a> Txn<'a> {
    pub(crate) fn new(db: &'a JobDb, index: JobIndex, write_guard: Option<MutexGuard<'a, ()>>) -> Self {
        Self {
            db,
            index,
            write_guard,
        }
    }

    pub fn read_only(&self) -> bool {
        self.write_guard.is_none()
    }

    pub fn get_by_id(&self, id: &str) -> Option<&Job> {
        self.index.jobs_by_id.get(id)
    }

    /// The job owning the run with this id.
    pub fn get_by_run_id(&self, run_id: &str) -> Option<&Job> {
        self.index
            .job_ids_by_run_id
            .get(run_id)
            .and_then(|id| self.get_by_id(id))
    }

    /// Ids of every job in `queue` belonging to the gang `gang_id`, sorted.
    pub fn get_gang_job_ids_by_gang_id(&self, queue: &str, gang_id: &str) -> Vec<String> {
        let key: GangKey = (queue.into(), gang_id.into());
        self.index
            .job_ids_by_gang
            .get(&key)
            .map(|ids| ids.iter().map(|id| id.to_string()).collect())
            .unwrap_or_default()
    }

    /// Every job, in no particular order.
    pub fn get_all(&self) -> Vec<&Job> {
        self.index.jobs_by_id.values().collect()
    }

    /// Queued jobs of `queue` in scheduling order.
    pub fn queued_jobs(&self, queue: &str) -> Vec<&Job> {
        self.index
            .queued_jobs_by_queue
            .get(queue)
            .map(|keys| {
                keys.iter()
                    .filter_map(|key| self.get_by_id(&key.id))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn has_queued_jobs(&self, queue: &str) -> bool {
        self.index
            .queued_jobs_by_queue
            .get(queue)
            .is_some_and(|keys| !keys.is_empty())
    }

    /// Jobs the scheduler has not yet checked for schedulability, by id.
    pub fn unvalidated_jobs(&self) -> Vec<&Job> {
        self.index
            .unvalidated_jobs
            .iter()
            .filter_map(|id| self.get_by_id(id))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.index.jobs_by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.jobs_by_id.is_empty()
    }

    /// Insert jobs, replacing any existing job with the same id.
    pub fn upsert(&mut self, jobs: impl IntoIterator<Item = Job>) -> Result<()> {
        self.ensure_writable()?;
        for job in jobs {
            self.index.remove(job.id());
            self.index.insert(job);
        }
        Ok(())
    }

    /// Remove jobs by id. Unknown ids are ignored.
    pub fn delete<S: AsRef<str>>(&mut self, job_ids: &[S]) -> Result<()> {
        self.ensure_writable()?;
        for id in job_ids {
            self.index.remove(id.as_ref());
        }
        Ok(())
    }

    /// Publish this transaction's changes and release the write lock.
    pub fn commit(self) -> Result<()> {
        self.ensure_writable()?;
        self.db.publish(self.index);
        Ok(())
    }

    /// Discard this transaction. Equivalent to dropping it.
    pub fn abort(self) {}

    /// Check every job's invariants and the consistency of the indexes,
    /// reporting every violation found.
    pub fn assert_all(&self) -> Result<()> {
        let mut v = InvariantViolations::new();

        for (id, job) in self.index.jobs_by_id.iter() {
            if **id != *job.id() {
                v.push(format!("job {} is keyed by {id}", job.id()));
            }
            if let Err(JobDbError::InvalidJob { job_id, violations }) = job.assert() {
                for violation in violations.iter() {
                    v.push(format!("job {job_id}: {violation}"));
                }
            }
            for run in job.all_runs() {
                match self.index.job_ids_by_run_id.get(run.id()) {
                    Some(owner) if owner == id => {}
                    _ => v.push(format!("run {} of job {id} is not indexed", run.id())),
                }
            }
            let queued_indexed = self
                .index
                .queued_jobs_by_queue
                .get(job.queue())
                .is_some_and(|keys| keys.contains(&QueuedKey::of(job)));
            if job.queued() != queued_indexed {
                v.push(format!("job {id} queued={} disagrees with the queue index", job.queued()));
            }
            if job.validated() == self.index.unvalidated_jobs.contains(id) {
                v.push(format!(
                    "job {id} validated={} disagrees with the unvalidated index",
                    job.validated()
                ));
            }
            if job.is_in_gang() {
                let in_gang = self
                    .index
                    .job_ids_by_gang
                    .get(&gang_key(job))
                    .is_some_and(|ids| ids.contains(id));
                if !in_gang {
                    v.push(format!("job {id} is missing from gang {}", job.gang_info().id()));
                }
            }
        }

        for (run_id, job_id) in self.index.job_ids_by_run_id.iter() {
            if self.get_by_id(job_id).and_then(|job| job.run_by_id(run_id)).is_none() {
                v.push(format!("run index entry {run_id} points at missing job {job_id}"));
            }
        }
        let queued: usize = self.index.queued_jobs_by_queue.values().map(BTreeSet::len).sum();
        let expected = self.index.jobs_by_id.values().filter(|j| j.queued()).count();
        if queued != expected {
            v.push(format!("queue index holds {queued} jobs but {expected} are queued"));
        }

        if v.is_empty() {
            Ok(())
        } else {
            Err(JobDbError::InvalidTxn(v))
        }
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.read_only() {
            Err(JobDbError::ReadOnlyTxn)
        } else {
            Ok(())
        }
    }
}

impl fmt::Debug for Txn<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Txn")
            .field("read_only", &self.read_only())
            .field("jobs", &self.len())
            .finish()
    }
}
