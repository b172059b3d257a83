//! Instance configuration
//!
//! Describes the lanes carved out of each GPU, the CPU companion devices,
//! and the knobs of the admission path. Loaded from TOML by the CLI.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

const GIB: u64 = 1024 * 1024 * 1024;
const MIB: u64 = 1024 * 1024;

/// Capacity assumed for a session that declares no memory usage
pub const DEFAULT_FALLBACK_CAPACITY: u64 = 14 * GIB;

/// Resource key read from session resource maps
pub const DEFAULT_RESOURCE_KEY: &str = "MEMORY:GPU";

/// Device name prefix used for every device created by an instance
pub const DEFAULT_NAME_PREFIX: &str = "/job:lanekeeper/replica:0/task:0";

/// Full instance configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceConfig {
    #[serde(default)]
    pub demand: DemandConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub cpu: CpuConfig,

    #[serde(default = "default_lanes")]
    pub lanes: Vec<LaneConfig>,
}

/// How resource hints are turned into lane demands
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DemandConfig {
    /// Bytes assumed when a session gives no usable memory hint
    pub fallback_capacity: u64,

    /// Resource key looked up in the persistent and temporary maps
    pub resource_key: String,
}

impl Default for DemandConfig {
    fn default() -> Self {
        Self {
            fallback_capacity: DEFAULT_FALLBACK_CAPACITY,
            resource_key: DEFAULT_RESOURCE_KEY.to_string(),
        }
    }
}

/// Lane scheduler knobs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// How many later requests may overtake a waiting request before it
    /// blocks everything queued behind it
    pub max_bypass: u32,

    /// Upper bound on how long an admission waits for lanes (none = forever)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_timeout_ms: Option<u64>,
}

impl SchedulerConfig {
    pub fn wait_timeout(&self) -> Option<Duration> {
        self.wait_timeout_ms.map(Duration::from_millis)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_bypass: 8,
            wait_timeout_ms: None,
        }
    }
}

/// CPU companion devices
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CpuConfig {
    /// Number of CPU devices to create
    pub count: usize,

    /// Memory limit advertised by each CPU device
    pub memory_limit: u64,

    /// Prefix for device names
    pub name_prefix: String,
}

impl Default for CpuConfig {
    fn default() -> Self {
        Self {
            count: 1,
            memory_limit: 256 * MIB,
            name_prefix: DEFAULT_NAME_PREFIX.to_string(),
        }
    }
}

/// One lane: a slice of a GPU's memory with its own streams
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaneConfig {
    /// Index of the GPU the lane lives on
    #[serde(default)]
    pub gpu: u32,

    /// Bytes of device memory owned by the lane
    pub memory: u64,

    /// Number of execution streams reserved for the lane
    #[serde(default = "default_streams")]
    pub streams: u32,
}

fn default_streams() -> u32 {
    1
}

fn default_lanes() -> Vec<LaneConfig> {
    vec![LaneConfig {
        gpu: 0,
        memory: 16 * GIB,
        streams: 1,
    }]
}

impl InstanceConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: InstanceConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for values the instance cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lanes.is_empty() {
            return Err(ConfigError::Invalid("at least one lane is required".into()));
        }
        for (idx, lane) in self.lanes.iter().enumerate() {
            if lane.memory == 0 {
                return Err(ConfigError::Invalid(format!("lane {idx} has no memory")));
            }
            if lane.streams == 0 {
                return Err(ConfigError::Invalid(format!("lane {idx} has no streams")));
            }
        }
        if self.cpu.count == 0 {
            return Err(ConfigError::Invalid("at least one CPU device is required".into()));
        }
        if self.demand.fallback_capacity == 0 {
            return Err(ConfigError::Invalid("fallback_capacity must be non-zero".into()));
        }
        Ok(())
    }
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            demand: DemandConfig::default(),
            scheduler: SchedulerConfig::default(),
            cpu: CpuConfig::default(),
            lanes: default_lanes(),
        }
    }
}
