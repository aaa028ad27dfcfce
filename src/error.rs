use std::fmt;

use thiserror::Error;

/// Every invariant violation found by a single `assert` pass.
///
/// Violations are collected rather than short-circuited so that a broken job
/// reports all of its problems at once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvariantViolations(Vec<String>);

impl InvariantViolations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, violation: impl Into<String>) {
        self.0.push(violation.into());
    }

    pub fn extend(&mut self, other: InvariantViolations) {
        self.0.extend(other.0);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.0.iter().any(|v| v.contains(needle))
    }
}

impl fmt::Display for InvariantViolations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} violation(s): ", self.0.len())?;
        for (i, violation) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{violation}")?;
        }
        Ok(())
    }
}

#[derive(Error, Debug)]
pub enum JobDbError {
    #[error("Unknown resource type: {name}")]
    UnknownResource { name: String },

    #[error("Invalid quantity {quantity:?} for resource {name}")]
    InvalidQuantity { name: String, quantity: String },

    #[error("Scheduling info has no pod requirements")]
    MissingPodRequirements,

    #[error("Invalid gang info for gang {gang_id}: {reason}")]
    InvalidGang { gang_id: String, reason: String },

    #[error("Error unmarshalling scheduling info for job {job_id}: {source}")]
    SchedulingInfoDecode {
        job_id: String,
        #[source]
        source: prost::DecodeError,
    },

    #[error("Error converting scheduling info for job {job_id}: {source}")]
    SchedulingInfoConvert {
        job_id: String,
        #[source]
        source: Box<JobDbError>,
    },

    #[error("Error constructing job {job_id}: {source}")]
    JobConstruction {
        job_id: String,
        #[source]
        source: Box<JobDbError>,
    },

    #[error("Invalid job {job_id}: {violations}")]
    InvalidJob {
        job_id: String,
        violations: InvariantViolations,
    },

    #[error("Invalid run {run_id}: {violations}")]
    InvalidRun {
        run_id: String,
        violations: InvariantViolations,
    },

    #[error("Invalid job database: {0}")]
    InvalidTxn(InvariantViolations),

    #[error("Cannot modify a read-only transaction")]
    ReadOnlyTxn,

    #[error("Job repository error: {0}")]
    Repository(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, JobDbError>;
