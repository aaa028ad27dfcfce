use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{JobDbError, Result};

pub const DEFAULT_PRIORITY_CLASS: &str = "armada-default";
pub const PREEMPTIBLE_PRIORITY_CLASS: &str = "armada-preemptible";

/// A priority class jobs may reference by name.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PriorityClassConfig {
    pub name: String,
    pub priority: i32,
    #[serde(default)]
    pub preemptible: bool,
}

/// A resource type known to the resource-list factory.
///
/// `resolution` is a quantity string (e.g. "1m" for cpu); requested amounts are
/// rounded up to a multiple of it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ResourceTypeConfig {
    pub name: String,
    #[serde(default = "default_resolution")]
    pub resolution: String,
}

fn default_resolution() -> String {
    "1".to_string()
}

impl ResourceTypeConfig {
    pub fn new(name: impl Into<String>, resolution: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            resolution: resolution.into(),
        }
    }
}

/// Settings for the periodic repository sync loop.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// How often the repository is polled for changed jobs and runs
    pub interval_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self { interval_ms: 1000 }
    }
}

impl SyncConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct JobDbConfig {
    pub priority_classes: Vec<PriorityClassConfig>,
    /// Used for jobs whose priority class is empty or unknown
    pub default_priority_class: String,
    pub resources: Vec<ResourceTypeConfig>,
    pub floating_resources: Vec<ResourceTypeConfig>,
    pub sync: SyncConfig,
}

impl Default for JobDbConfig {
    fn default() -> Self {
        Self {
            priority_classes: vec![
                PriorityClassConfig {
                    name: DEFAULT_PRIORITY_CLASS.to_string(),
                    priority: 30000,
                    preemptible: false,
                },
                PriorityClassConfig {
                    name: PREEMPTIBLE_PRIORITY_CLASS.to_string(),
                    priority: 30000,
                    preemptible: true,
                },
            ],
            default_priority_class: DEFAULT_PRIORITY_CLASS.to_string(),
            resources: vec![
                ResourceTypeConfig::new("cpu", "1m"),
                ResourceTypeConfig::new("memory", "1"),
                ResourceTypeConfig::new("ephemeral-storage", "1"),
                ResourceTypeConfig::new("nvidia.com/gpu", "1"),
            ],
            floating_resources: Vec::new(),
            sync: SyncConfig::default(),
        }
    }
}

impl JobDbConfig {
    pub fn with_priority_class(mut self, name: &str, priority: i32, preemptible: bool) -> Self {
        self.priority_classes.retain(|pc| pc.name != name);
        self.priority_classes.push(PriorityClassConfig {
            name: name.to_string(),
            priority,
            preemptible,
        });
        self
    }

    pub fn with_default_priority_class(mut self, name: &str) -> Self {
        self.default_priority_class = name.to_string();
        self
    }

    pub fn with_floating_resource(mut self, name: &str, resolution: &str) -> Self {
        self.floating_resources
            .push(ResourceTypeConfig::new(name, resolution));
        self
    }

    pub fn with_sync_interval_ms(mut self, interval_ms: u64) -> Self {
        self.sync.interval_ms = interval_ms;
        self
    }

    /// Load a config from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| JobDbError::Config(format!("reading {}: {e}", path.display())))?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| JobDbError::Config(format!("parsing {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the config is internally consistent.
    pub fn validate(&self) -> Result<()> {
        if !self
            .priority_classes
            .iter()
            .any(|pc| pc.name == self.default_priority_class)
        {
            return Err(JobDbError::Config(format!(
                "default priority class {} is not defined",
                self.default_priority_class
            )));
        }

        if self.sync.interval_ms == 0 {
            return Err(JobDbError::Config(
                "sync interval_ms must be greater than zero".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for resource in self.resources.iter().chain(&self.floating_resources) {
            if !seen.insert(resource.name.as_str()) {
                return Err(JobDbError::Config(format!(
                    "resource {} is defined more than once",
                    resource.name
                )));
            }
        }
        Ok(())
    }
}
