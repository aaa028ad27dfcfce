//! Wire messages for the serialized scheduling requirements stored alongside
//! each job in the job repository.
//!
//! The messages also derive serde so that fixtures and tooling can describe a
//! payload as JSON before encoding it.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Scheduling requirements of a job, as persisted by the submit path.
#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct JobSchedulingInfo {
    #[prost(string, tag = "1")]
    pub priority_class_name: String,
    /// Submission time in nanoseconds since the epoch
    #[prost(int64, tag = "2")]
    pub submit_time_ns: i64,
    #[prost(uint32, tag = "3")]
    pub priority: u32,
    #[prost(message, optional, tag = "4")]
    pub pod_requirements: Option<PodRequirements>,
    /// Incremented every time the scheduling requirements are rewritten
    #[prost(uint32, tag = "5")]
    pub version: u32,
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct PodRequirements {
    #[prost(map = "string, string", tag = "1")]
    pub node_selector: HashMap<String, String>,
    #[prost(message, optional, tag = "2")]
    pub affinity: Option<Affinity>,
    #[prost(message, repeated, tag = "3")]
    pub tolerations: Vec<Toleration>,
    #[prost(map = "string, string", tag = "4")]
    pub annotations: HashMap<String, String>,
    #[prost(message, optional, tag = "5")]
    pub resource_requirements: Option<ResourceRequirements>,
}

/// Required node affinity; a node matches if it matches any term.
#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct Affinity {
    #[prost(message, repeated, tag = "1")]
    pub node_selector_terms: Vec<NodeSelectorTerm>,
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSelectorTerm {
    #[prost(message, repeated, tag = "1")]
    pub match_expressions: Vec<NodeSelectorRequirement>,
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSelectorRequirement {
    #[prost(string, tag = "1")]
    pub key: String,
    #[prost(string, tag = "2")]
    pub operator: String,
    #[prost(string, repeated, tag = "3")]
    pub values: Vec<String>,
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct Toleration {
    #[prost(string, tag = "1")]
    pub key: String,
    #[prost(string, tag = "2")]
    pub operator: String,
    #[prost(string, tag = "3")]
    pub value: String,
    #[prost(string, tag = "4")]
    pub effect: String,
    #[prost(int64, optional, tag = "5")]
    pub toleration_seconds: Option<i64>,
}

/// Resource quantities in Kubernetes notation, e.g. `{"cpu": "500m"}`.
#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceRequirements {
    #[prost(map = "string, string", tag = "1")]
    pub requests: HashMap<String, String>,
    #[prost(map = "string, string", tag = "2")]
    pub limits: HashMap<String, String>,
}
