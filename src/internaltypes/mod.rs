//! Value types the job database builds jobs from: parsed scheduling
//! requirements, resource lists, scheduling keys and priority classes.

pub mod quantity;
pub mod resource;
pub mod scheduling_info;
pub mod scheduling_key;

pub use quantity::Quantity;
pub use resource::{ResourceList, ResourceListFactory, ResourceType};
pub use scheduling_info::{JobSchedulingInfo, PodRequirements};
pub use scheduling_key::{SchedulingKey, SchedulingKeyGenerator};

use crate::config::PriorityClassConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriorityClass {
    pub name: String,
    pub priority: i32,
    /// Whether jobs of this class may be preempted once running
    pub preemptible: bool,
}

impl From<&PriorityClassConfig> for PriorityClass {
    fn from(config: &PriorityClassConfig) -> Self {
        Self {
            name: config.name.clone(),
            priority: config.priority,
            preemptible: config.preemptible,
        }
    }
}
