use std::collections::BTreeMap;

use crate::error::{JobDbError, Result};

pub const GANG_ID_ANNOTATION: &str = "armadaproject.io/gangId";
pub const GANG_CARDINALITY_ANNOTATION: &str = "armadaproject.io/gangCardinality";
pub const GANG_NODE_UNIFORMITY_LABEL_ANNOTATION: &str = "armadaproject.io/gangNodeUniformityLabel";

/// Gang membership of a job. Members of a gang are scheduled and preempted
/// together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GangInfo {
    is_gang: bool,
    id: String,
    cardinality: u32,
    node_uniformity: String,
}

impl Default for GangInfo {
    fn default() -> Self {
        Self::basic()
    }
}

impl GangInfo {
    /// Gang info of a job that is not part of a gang.
    pub fn basic() -> Self {
        Self {
            is_gang: false,
            id: String::new(),
            cardinality: 1,
            node_uniformity: String::new(),
        }
    }

    pub fn new(id: impl Into<String>, cardinality: u32, node_uniformity: impl Into<String>) -> Self {
        Self {
            is_gang: true,
            id: id.into(),
            cardinality,
            node_uniformity: node_uniformity.into(),
        }
    }

    /// Derive gang info from job annotations. Jobs without a gang id are not gangs.
    pub fn from_annotations(annotations: &BTreeMap<String, String>) -> Result<Self> {
        let Some(gang_id) = annotations.get(GANG_ID_ANNOTATION).filter(|id| !id.is_empty()) else {
            return Ok(Self::basic());
        };

        let cardinality = match annotations.get(GANG_CARDINALITY_ANNOTATION) {
            None => 1,
            Some(raw) => raw.parse::<u32>().map_err(|e| JobDbError::InvalidGang {
                gang_id: gang_id.clone(),
                reason: format!("cardinality {raw:?}: {e}"),
            })?,
        };
        if cardinality == 0 {
            return Err(JobDbError::InvalidGang {
                gang_id: gang_id.clone(),
                reason: "cardinality must be at least 1".to_string(),
            });
        }

        let node_uniformity = annotations
            .get(GANG_NODE_UNIFORMITY_LABEL_ANNOTATION)
            .cloned()
            .unwrap_or_default();
        Ok(Self::new(gang_id.clone(), cardinality, node_uniformity))
    }

    pub fn is_gang(&self) -> bool {
        self.is_gang
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn cardinality(&self) -> u32 {
        self.cardinality
    }

    pub fn node_uniformity(&self) -> &str {
        &self.node_uniformity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn annotations(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn no_gang_annotation_is_basic() {
        let info = GangInfo::from_annotations(&BTreeMap::new()).unwrap();
        assert!(!info.is_gang());
        assert_eq!(info.cardinality(), 1);
    }

    #[test]
    fn gang_annotations_are_parsed() {
        let info = GangInfo::from_annotations(&annotations(&[
            (GANG_ID_ANNOTATION, "g1"),
            (GANG_CARDINALITY_ANNOTATION, "3"),
            (GANG_NODE_UNIFORMITY_LABEL_ANNOTATION, "rack"),
        ]))
        .unwrap();
        assert_eq!(info, GangInfo::new("g1", 3, "rack"));
    }

    #[test]
    fn invalid_cardinality_is_rejected() {
        for raw in ["zero", "0", "-2"] {
            let err = GangInfo::from_annotations(&annotations(&[
                (GANG_ID_ANNOTATION, "g1"),
                (GANG_CARDINALITY_ANNOTATION, raw),
            ]))
            .unwrap_err();
            assert!(matches!(err, JobDbError::InvalidGang { .. }), "{raw}");
        }
    }
}
