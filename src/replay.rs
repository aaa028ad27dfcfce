//! JSON fixtures of repository changes, replayed batch by batch through a
//! sync cycle by the `jobdb replay` command.

use std::path::Path;

use prost::Message;
use serde::{Deserialize, Serialize};

use crate::database::{DbJob, DbRun};
use crate::error::{JobDbError, Result};
use crate::jobdb::Job;
use crate::proto;

/// A job record whose scheduling info is spelled out rather than encoded.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FixtureJob {
    pub job_id: String,
    pub job_set: String,
    pub queue: String,
    pub priority: i64,
    pub scheduling_info: proto::JobSchedulingInfo,
    pub queued: bool,
    pub queued_version: i32,
    pub cancel_requested: bool,
    pub cancel_by_jobset_requested: bool,
    pub cancel_user: Option<String>,
    pub cancelled: bool,
    pub succeeded: bool,
    pub failed: bool,
    pub submitted: i64,
    pub validated: bool,
    pub pools: Vec<String>,
    pub price_band: i32,
}

impl FixtureJob {
    /// The repository record, with the scheduling info encoded and its
    /// version taken from the message.
    pub fn into_db_job(self) -> DbJob {
        DbJob {
            scheduling_info_version: self.scheduling_info.version,
            scheduling_info: self.scheduling_info.encode_to_vec(),
            job_id: self.job_id,
            job_set: self.job_set,
            queue: self.queue,
            priority: self.priority,
            queued: self.queued,
            queued_version: self.queued_version,
            cancel_requested: self.cancel_requested,
            cancel_by_jobset_requested: self.cancel_by_jobset_requested,
            cancel_user: self.cancel_user,
            cancelled: self.cancelled,
            succeeded: self.succeeded,
            failed: self.failed,
            submitted: self.submitted,
            validated: self.validated,
            pools: self.pools,
            price_band: self.price_band,
            serial: 0,
        }
    }
}

/// Changes that reach the repository together.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ReplayBatch {
    pub jobs: Vec<FixtureJob>,
    pub runs: Vec<DbRun>,
}

impl ReplayBatch {
    pub fn into_records(self) -> (Vec<DbJob>, Vec<DbRun>) {
        (
            self.jobs.into_iter().map(FixtureJob::into_db_job).collect(),
            self.runs,
        )
    }
}

pub fn load_fixture(path: impl AsRef<Path>) -> Result<Vec<ReplayBatch>> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)
        .map_err(|e| JobDbError::Config(format!("reading {}: {e}", path.display())))?;
    serde_json::from_str(&raw)
        .map_err(|e| JobDbError::Config(format!("parsing {}: {e}", path.display())))
}

/// Summary of one job after a replayed batch.
#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub job_id: String,
    pub queue: String,
    pub state: &'static str,
    pub transitions: Vec<&'static str>,
    pub latest_run: Option<String>,
}

/// The job's current state in the queued / running / terminal lifecycle.
pub fn job_state(job: &Job) -> &'static str {
    if job.queued() {
        "queued"
    } else if job.succeeded() {
        "succeeded"
    } else if job.cancelled() {
        "cancelled"
    } else if job.failed() {
        "failed"
    } else {
        "running"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn fixture_jobs_encode_their_scheduling_info() {
        let fixture = r#"[
            {
                "jobs": [{
                    "job_id": "01j0",
                    "queue": "queue-a",
                    "job_set": "set-a",
                    "priority": 3,
                    "queued": true,
                    "scheduling_info": {
                        "priority_class_name": "armada-default",
                        "version": 2,
                        "pod_requirements": {
                            "resource_requirements": { "requests": { "cpu": "500m" } }
                        }
                    }
                }]
            },
            { "runs": [{ "run_id": "r1", "job_id": "01j0", "created": 10 }] }
        ]"#;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(fixture.as_bytes()).unwrap();

        let batches = load_fixture(file.path()).unwrap();
        assert_eq!(batches.len(), 2);

        let (jobs, runs) = batches[0].clone().into_records();
        assert!(runs.is_empty());
        assert_eq!(jobs[0].scheduling_info_version, 2);
        let decoded = proto::JobSchedulingInfo::decode(jobs[0].scheduling_info.as_slice()).unwrap();
        assert_eq!(decoded.priority_class_name, "armada-default");

        let (jobs, runs) = batches[1].clone().into_records();
        assert!(jobs.is_empty());
        assert_eq!(runs[0].job_id, "01j0");
    }

    #[test]
    fn malformed_fixture_is_a_config_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"{not json").unwrap();
        assert!(matches!(load_fixture(file.path()), Err(JobDbError::Config(_))));
    }
}
