use std::collections::BTreeMap;
use std::fmt;

use prost::Message;
use sha2::{Digest, Sha256};

use crate::internaltypes::Quantity;
use crate::proto;

/// Hash of everything that determines where a job can be placed.
///
/// Jobs with equal keys are interchangeable for placement, which lets the
/// scheduler skip jobs shaped like one that already failed to schedule.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SchedulingKey([u8; 32]);

impl SchedulingKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for SchedulingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for SchedulingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SchedulingKey({})", &hex::encode(self.0)[..12])
    }
}

/// Computes [`SchedulingKey`]s from a canonical encoding of a job's
/// placement constraints. Map and toleration order do not affect the key;
/// zero-valued requests are ignored.
#[derive(Debug, Clone, Default)]
pub struct SchedulingKeyGenerator {
    salt: Vec<u8>,
}

impl SchedulingKeyGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys from generators with different salts never collide on purpose.
    pub fn with_salt(salt: impl Into<Vec<u8>>) -> Self {
        Self { salt: salt.into() }
    }

    pub fn key(
        &self,
        node_selector: &BTreeMap<String, String>,
        affinity: Option<&proto::Affinity>,
        tolerations: &[proto::Toleration],
        requests: &BTreeMap<String, Quantity>,
        priority_class_name: &str,
    ) -> SchedulingKey {
        let mut hasher = Sha256::new();
        write_field(&mut hasher, &self.salt);

        write_len(&mut hasher, node_selector.len());
        for (k, v) in node_selector {
            write_field(&mut hasher, k.as_bytes());
            write_field(&mut hasher, v.as_bytes());
        }

        match affinity {
            Some(affinity) => write_field(&mut hasher, &affinity.encode_to_vec()),
            None => write_len(&mut hasher, usize::MAX),
        }

        let mut encoded_tolerations: Vec<Vec<u8>> =
            tolerations.iter().map(Message::encode_to_vec).collect();
        encoded_tolerations.sort();
        write_len(&mut hasher, encoded_tolerations.len());
        for toleration in &encoded_tolerations {
            write_field(&mut hasher, toleration);
        }

        let non_zero: Vec<_> = requests.iter().filter(|(_, q)| !q.is_zero()).collect();
        write_len(&mut hasher, non_zero.len());
        for (name, quantity) in non_zero {
            write_field(&mut hasher, name.as_bytes());
            hasher.update(quantity.milli().to_le_bytes());
        }

        write_field(&mut hasher, priority_class_name.as_bytes());
        SchedulingKey(hasher.finalize().into())
    }
}

fn write_len(hasher: &mut Sha256, len: usize) {
    hasher.update((len as u64).to_le_bytes());
}

fn write_field(hasher: &mut Sha256, bytes: &[u8]) {
    write_len(hasher, bytes.len());
    hasher.update(bytes);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toleration(key: &str) -> proto::Toleration {
        proto::Toleration {
            key: key.to_string(),
            operator: "Exists".to_string(),
            ..Default::default()
        }
    }

    fn requests(pairs: &[(&str, i64)]) -> BTreeMap<String, Quantity> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Quantity::from_milli(*v)))
            .collect()
    }

    #[test]
    fn key_ignores_toleration_order_and_zero_requests() {
        let skg = SchedulingKeyGenerator::new();
        let selector = BTreeMap::from([("zone".to_string(), "a".to_string())]);
        let a = skg.key(
            &selector,
            None,
            &[toleration("gpu"), toleration("spot")],
            &requests(&[("cpu", 1000), ("memory", 0)]),
            "armada-default",
        );
        let b = skg.key(
            &selector,
            None,
            &[toleration("spot"), toleration("gpu")],
            &requests(&[("cpu", 1000)]),
            "armada-default",
        );
        assert_eq!(a, b);
    }

    #[test]
    fn key_changes_with_any_constraint() {
        let skg = SchedulingKeyGenerator::new();
        let empty = BTreeMap::new();
        let base = skg.key(&empty, None, &[], &requests(&[("cpu", 1000)]), "a");
        assert_ne!(base, skg.key(&empty, None, &[], &requests(&[("cpu", 2000)]), "a"));
        assert_ne!(base, skg.key(&empty, None, &[], &requests(&[("cpu", 1000)]), "b"));
        assert_ne!(
            base,
            skg.key(
                &empty,
                Some(&proto::Affinity::default()),
                &[],
                &requests(&[("cpu", 1000)]),
                "a"
            )
        );
        let salted = SchedulingKeyGenerator::with_salt("pool-a");
        assert_ne!(base, salted.key(&empty, None, &[], &requests(&[("cpu", 1000)]), "a"));
    }
}
