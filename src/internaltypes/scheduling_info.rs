use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::error::{JobDbError, Result};
use crate::internaltypes::Quantity;
use crate::proto;

/// Pod-level scheduling constraints with quantities already parsed.
///
/// Maps are ordered so that hashing and comparison are independent of the
/// order the submitter listed entries in.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PodRequirements {
    pub node_selector: BTreeMap<String, String>,
    pub affinity: Option<proto::Affinity>,
    pub tolerations: Vec<proto::Toleration>,
    pub annotations: BTreeMap<String, String>,
    pub requests: BTreeMap<String, Quantity>,
    pub limits: BTreeMap<String, Quantity>,
}

/// Typed scheduling requirements of a job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSchedulingInfo {
    pub priority_class_name: String,
    pub submit_time: DateTime<Utc>,
    pub priority: u32,
    pub pod_requirements: PodRequirements,
    pub version: u32,
}

impl Default for JobSchedulingInfo {
    fn default() -> Self {
        Self {
            priority_class_name: String::new(),
            submit_time: DateTime::from_timestamp_nanos(0),
            priority: 0,
            pod_requirements: PodRequirements::default(),
            version: 0,
        }
    }
}

impl JobSchedulingInfo {
    /// Convert the wire message, parsing every resource quantity.
    pub fn from_proto(info: &proto::JobSchedulingInfo) -> Result<Self> {
        let pod = info
            .pod_requirements
            .as_ref()
            .ok_or(JobDbError::MissingPodRequirements)?;

        let (requests, limits) = match &pod.resource_requirements {
            Some(rr) => (parse_quantities(&rr.requests)?, parse_quantities(&rr.limits)?),
            None => (BTreeMap::new(), BTreeMap::new()),
        };

        Ok(Self {
            priority_class_name: info.priority_class_name.clone(),
            submit_time: DateTime::from_timestamp_nanos(info.submit_time_ns),
            priority: info.priority,
            pod_requirements: PodRequirements {
                node_selector: pod.node_selector.clone().into_iter().collect(),
                affinity: pod.affinity.clone(),
                tolerations: pod.tolerations.clone(),
                annotations: pod.annotations.clone().into_iter().collect(),
                requests,
                limits,
            },
            version: info.version,
        })
    }

    /// Decode the serialized payload stored by the job repository.
    pub fn decode(job_id: &str, bytes: &[u8]) -> Result<Self> {
        use prost::Message;

        let info = proto::JobSchedulingInfo::decode(bytes).map_err(|source| {
            JobDbError::SchedulingInfoDecode {
                job_id: job_id.to_string(),
                source,
            }
        })?;
        Self::from_proto(&info).map_err(|e| JobDbError::SchedulingInfoConvert {
            job_id: job_id.to_string(),
            source: Box::new(e),
        })
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.pod_requirements
            .annotations
            .get(key)
            .map(String::as_str)
    }
}

fn parse_quantities(
    raw: &std::collections::HashMap<String, String>,
) -> Result<BTreeMap<String, Quantity>> {
    raw.iter()
        .map(|(name, quantity)| {
            Quantity::parse(quantity)
                .map(|q| (name.clone(), q))
                .ok_or_else(|| JobDbError::InvalidQuantity {
                    name: name.clone(),
                    quantity: quantity.clone(),
                })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;
    use std::collections::HashMap;

    fn proto_info(requests: &[(&str, &str)]) -> proto::JobSchedulingInfo {
        proto::JobSchedulingInfo {
            priority_class_name: "armada-default".to_string(),
            submit_time_ns: 1_000,
            priority: 3,
            pod_requirements: Some(proto::PodRequirements {
                node_selector: HashMap::from([("zone".to_string(), "a".to_string())]),
                resource_requirements: Some(proto::ResourceRequirements {
                    requests: requests
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                    limits: HashMap::new(),
                }),
                ..Default::default()
            }),
            version: 2,
        }
    }

    #[test]
    fn decode_parses_payload() {
        let bytes = proto_info(&[("cpu", "500m")]).encode_to_vec();
        let info = JobSchedulingInfo::decode("job-1", &bytes).unwrap();
        assert_eq!(info.version, 2);
        assert_eq!(info.priority, 3);
        assert_eq!(info.submit_time.timestamp_nanos_opt(), Some(1_000));
        assert_eq!(info.pod_requirements.requests["cpu"], Quantity::from_milli(500));
        assert_eq!(info.pod_requirements.node_selector["zone"], "a");
    }

    #[test]
    fn decode_rejects_garbage_bytes() {
        let err = JobSchedulingInfo::decode("job-1", &[0xff, 0xff, 0xff]).unwrap_err();
        assert!(matches!(err, JobDbError::SchedulingInfoDecode { .. }));
        assert!(err.to_string().contains("job-1"));
    }

    #[test]
    fn decode_wraps_conversion_failures() {
        let bytes = proto_info(&[("cpu", "lots")]).encode_to_vec();
        let err = JobSchedulingInfo::decode("job-2", &bytes).unwrap_err();
        match err {
            JobDbError::SchedulingInfoConvert { job_id, source } => {
                assert_eq!(job_id, "job-2");
                assert!(matches!(*source, JobDbError::InvalidQuantity { .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn missing_pod_requirements_is_a_conversion_error() {
        let info = proto::JobSchedulingInfo::default();
        assert!(matches!(
            JobSchedulingInfo::from_proto(&info),
            Err(JobDbError::MissingPodRequirements)
        ));
    }
}
