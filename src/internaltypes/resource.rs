use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use crate::config::ResourceTypeConfig;
use crate::error::{JobDbError, Result};
use crate::internaltypes::Quantity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceType {
    /// Visible to Kubernetes and tracked per node
    Kubernetes,
    /// Pool-wide resources outside Kubernetes (licenses, external quotas)
    Floating,
}

#[derive(Debug)]
struct ResourceDef {
    name: String,
    resolution: i64,
    resource_type: ResourceType,
}

/// Builds dense [`ResourceList`]s over a fixed, configured set of resource types.
#[derive(Debug)]
pub struct ResourceListFactory {
    defs: Vec<ResourceDef>,
    index_by_name: HashMap<String, usize>,
}

impl ResourceListFactory {
    pub fn new(
        resources: &[ResourceTypeConfig],
        floating_resources: &[ResourceTypeConfig],
    ) -> Result<Arc<Self>> {
        let mut defs = Vec::with_capacity(resources.len() + floating_resources.len());
        let mut index_by_name = HashMap::new();
        let typed = resources
            .iter()
            .map(|r| (r, ResourceType::Kubernetes))
            .chain(floating_resources.iter().map(|r| (r, ResourceType::Floating)));

        for (resource, resource_type) in typed {
            let resolution = Quantity::parse(&resource.resolution)
                .filter(|q| !q.is_zero())
                .ok_or_else(|| JobDbError::InvalidQuantity {
                    name: resource.name.clone(),
                    quantity: resource.resolution.clone(),
                })?;
            if index_by_name
                .insert(resource.name.clone(), defs.len())
                .is_some()
            {
                return Err(JobDbError::Config(format!(
                    "resource {} is defined more than once",
                    resource.name
                )));
            }
            defs.push(ResourceDef {
                name: resource.name.clone(),
                resolution: resolution.milli(),
                resource_type,
            });
        }

        Ok(Arc::new(Self {
            defs,
            index_by_name,
        }))
    }

    pub fn len(&self) -> usize {
        self.defs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }

    pub fn resource_type(&self, name: &str) -> Option<ResourceType> {
        self.index_by_name
            .get(name)
            .map(|&i| self.defs[i].resource_type)
    }

    /// Convert job requests into a resource list, ignoring unknown resource names.
    pub fn from_job_resource_list(
        self: &Arc<Self>,
        requests: &BTreeMap<String, Quantity>,
    ) -> ResourceList {
        let mut values = vec![0i64; self.defs.len()];
        for (name, quantity) in requests {
            if let Some(&i) = self.index_by_name.get(name) {
                values[i] = round_up(quantity.milli(), self.defs[i].resolution);
            }
        }
        ResourceList {
            factory: Some(Arc::clone(self)),
            values: values.into(),
        }
    }

    /// Like [`Self::from_job_resource_list`] but errors on the first unknown name.
    pub fn from_job_resource_list_fail_on_unknown(
        self: &Arc<Self>,
        requests: &BTreeMap<String, Quantity>,
    ) -> Result<ResourceList> {
        if let Some(name) = requests
            .keys()
            .find(|name| !self.index_by_name.contains_key(name.as_str()))
        {
            return Err(JobDbError::UnknownResource { name: name.clone() });
        }
        Ok(self.from_job_resource_list(requests))
    }
}

fn round_up(milli: i64, resolution: i64) -> i64 {
    let remainder = milli % resolution;
    if remainder == 0 {
        milli
    } else {
        milli.saturating_add(resolution - remainder)
    }
}

/// Resource amounts in milli-units, one slot per configured resource type.
///
/// Cloning is cheap; the values are shared.
#[derive(Clone)]
pub struct ResourceList {
    factory: Option<Arc<ResourceListFactory>>,
    values: Arc<[i64]>,
}

impl Default for ResourceList {
    fn default() -> Self {
        Self {
            factory: None,
            values: Arc::from(Vec::new()),
        }
    }
}

impl ResourceList {
    pub fn is_empty(&self) -> bool {
        self.factory.is_none()
    }

    /// Amount of the named resource in milli-units; zero if unknown.
    pub fn get(&self, name: &str) -> i64 {
        self.factory
            .as_ref()
            .and_then(|f| f.index_by_name.get(name))
            .map(|&i| self.values[i])
            .unwrap_or(0)
    }

    /// A copy of this list with every resource not of `resource_type` zeroed.
    pub fn of_type(&self, resource_type: ResourceType) -> ResourceList {
        let Some(factory) = &self.factory else {
            return ResourceList::default();
        };
        let values: Vec<i64> = factory
            .defs
            .iter()
            .zip(self.values.iter())
            .map(|(def, &v)| if def.resource_type == resource_type { v } else { 0 })
            .collect();
        ResourceList {
            factory: Some(Arc::clone(factory)),
            values: values.into(),
        }
    }

    pub fn all_zero(&self) -> bool {
        self.values.iter().all(|&v| v == 0)
    }

    /// Non-zero entries as (name, milli-units) pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, i64)> {
        self.factory
            .iter()
            .flat_map(|f| f.defs.iter())
            .zip(self.values.iter().copied())
            .filter(|(_, v)| *v != 0)
            .map(|(def, v)| (def.name.as_str(), v))
    }
}

impl PartialEq for ResourceList {
    fn eq(&self, other: &Self) -> bool {
        if self.all_zero() && other.all_zero() {
            return true;
        }
        self.values == other.values
    }
}

impl fmt::Debug for ResourceList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn factory() -> Arc<ResourceListFactory> {
        ResourceListFactory::new(
            &[
                ResourceTypeConfig::new("cpu", "1m"),
                ResourceTypeConfig::new("memory", "1Ki"),
            ],
            &[ResourceTypeConfig::new("licenses", "1")],
        )
        .unwrap()
    }

    fn requests(pairs: &[(&str, &str)]) -> BTreeMap<String, Quantity> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Quantity::parse(v).unwrap()))
            .collect()
    }

    #[test]
    fn builds_list_and_rounds_to_resolution() {
        let rl = factory().from_job_resource_list(&requests(&[("cpu", "250m"), ("memory", "1000")]));
        assert_eq!(rl.get("cpu"), 250);
        // 1000 bytes rounded up to 1Ki.
        assert_eq!(rl.get("memory"), 1_024_000);
        assert_eq!(rl.get("licenses"), 0);
    }

    #[test]
    fn fail_on_unknown_rejects_unconfigured_resource() {
        let err = factory()
            .from_job_resource_list_fail_on_unknown(&requests(&[("cpu", "1"), ("tpu", "1")]))
            .unwrap_err();
        assert!(matches!(err, JobDbError::UnknownResource { name } if name == "tpu"));
    }

    #[test]
    fn of_type_splits_kubernetes_and_floating() {
        let rl = factory().from_job_resource_list(&requests(&[("cpu", "1"), ("licenses", "2")]));
        let kubernetes = rl.of_type(ResourceType::Kubernetes);
        let floating = rl.of_type(ResourceType::Floating);
        assert_eq!(kubernetes.get("cpu"), 1000);
        assert_eq!(kubernetes.get("licenses"), 0);
        assert_eq!(floating.get("licenses"), 2000);
        assert!(!floating.all_zero());
        assert!(rl.of_type(ResourceType::Floating).of_type(ResourceType::Kubernetes).all_zero());
    }

    #[test]
    fn duplicate_resource_names_are_rejected() {
        let err = ResourceListFactory::new(
            &[ResourceTypeConfig::new("cpu", "1m")],
            &[ResourceTypeConfig::new("cpu", "1")],
        )
        .unwrap_err();
        assert!(matches!(err, JobDbError::Config(_)));
    }

    #[test]
    fn empty_list_equals_zero_list() {
        let zero = factory().from_job_resource_list(&BTreeMap::new());
        assert_eq!(zero, ResourceList::default());
        assert!(ResourceList::default().is_empty());
    }
}
