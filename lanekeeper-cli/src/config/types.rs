use lanekeeper_core::LaneConfig;
use serde::Deserialize;

/// Configuration as stored in TOML files (with optional fields for merging)
#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
pub struct RawInstanceConfig {
    #[serde(default)]
    pub demand: RawDemandConfig,

    #[serde(default)]
    pub scheduler: RawSchedulerConfig,

    #[serde(default)]
    pub cpu: RawCpuConfig,

    /// A lane list in a later layer replaces the earlier one entirely
    pub lanes: Option<Vec<LaneConfig>>,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
pub struct RawDemandConfig {
    /// Bytes assumed when a session has no memory hint
    pub fallback_capacity: Option<u64>,

    /// Resource key holding the memory hint
    pub resource_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
pub struct RawSchedulerConfig {
    /// Times a waiting request may be overtaken
    pub max_bypass: Option<u32>,

    /// Longest wait for lanes, in milliseconds
    pub wait_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
pub struct RawCpuConfig {
    pub count: Option<usize>,
    pub memory_limit: Option<u64>,
    pub name_prefix: Option<String>,
}
