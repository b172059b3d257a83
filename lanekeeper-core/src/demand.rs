//! Resource demand extraction
//!
//! Sessions describe their footprint as two maps of resource-type keys to
//! quantities: memory that stays allocated for the whole session
//! ("persistent") and memory that only exists while a step runs
//! ("temporary"). This module normalizes those hints into the numbers the
//! lane manager needs.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::DemandConfig;
use crate::lane::LaneLayout;

/// Resource key holding the expected total running time, in seconds
pub const TIME_TOTAL_KEY: &str = "TIME:TOTAL";

/// Resource hints declared by a session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceMap {
    #[serde(default)]
    pub persistent: HashMap<String, f64>,

    #[serde(default)]
    pub temporary: HashMap<String, f64>,
}

impl ResourceMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style setter for a persistent quantity
    pub fn with_persistent(mut self, key: impl Into<String>, value: f64) -> Self {
        self.persistent.insert(key.into(), value);
        self
    }

    /// Builder-style setter for a temporary quantity
    pub fn with_temporary(mut self, key: impl Into<String>, value: f64) -> Self {
        self.temporary.insert(key.into(), value);
        self
    }
}

/// Normalized memory and runtime requirement of one session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDemand {
    /// Total bytes the session may occupy on its lane
    pub memory_limit: u64,
    /// Bytes held for the whole session lifetime (never above `memory_limit`)
    pub persistent_memory: u64,
    /// Expected running time in milliseconds (0 when unknown)
    pub expected_runtime_ms: u64,
    /// Set when no usable memory hint was given and the fallback was used
    pub used_fallback: bool,
}

impl ResourceDemand {
    /// Extract a demand from resource hints
    ///
    /// Never fails: a missing or zero memory hint degrades to the configured
    /// fallback capacity for both limit and persistent memory.
    pub fn extract(map: &ResourceMap, config: &DemandConfig) -> Self {
        let key = config.resource_key.as_str();

        let mut persistent = quantity(&map.persistent, key);
        let mut limit = persistent.saturating_add(quantity(&map.temporary, key));

        let used_fallback = limit == 0;
        if used_fallback {
            limit = config.fallback_capacity;
            persistent = limit;
            warn!(
                fallback = limit,
                "No resource info for current session, assuming whole GPU allocation"
            );
        }

        let expected_runtime_ms = quantity(&map.persistent, TIME_TOTAL_KEY).saturating_mul(1000);

        Self {
            memory_limit: limit,
            persistent_memory: persistent,
            expected_runtime_ms,
            used_fallback,
        }
    }

    /// One-entry layout requesting a single lane for this demand
    pub fn to_layout(&self) -> LaneLayout {
        let mut layout = LaneLayout::new();
        layout.push(self.memory_limit, self.persistent_memory);
        layout
    }
}

/// Rounded, non-negative quantity for `key`, 0 when absent
fn quantity(map: &HashMap<String, f64>, key: &str) -> u64 {
    // `as` saturates: NaN and negatives become 0
    map.get(key).copied().unwrap_or(0.0).round() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> DemandConfig {
        DemandConfig::default()
    }

    #[test]
    fn extract_sums_persistent_and_temporary() {
        let map = ResourceMap::new()
            .with_persistent("MEMORY:GPU", 2_000_000_000.0)
            .with_temporary("MEMORY:GPU", 1_000_000_000.0);

        let demand = ResourceDemand::extract(&map, &config());

        assert_eq!(demand.memory_limit, 3_000_000_000);
        assert_eq!(demand.persistent_memory, 2_000_000_000);
        assert!(!demand.used_fallback);
    }

    #[test]
    fn extract_empty_map_uses_fallback() {
        let demand = ResourceDemand::extract(&ResourceMap::new(), &config());

        assert_eq!(demand.memory_limit, config().fallback_capacity);
        assert_eq!(demand.persistent_memory, config().fallback_capacity);
        assert_eq!(demand.expected_runtime_ms, 0);
        assert!(demand.used_fallback);
    }

    #[test]
    fn extract_zero_hints_use_fallback() {
        let map = ResourceMap::new()
            .with_persistent("MEMORY:GPU", 0.0)
            .with_temporary("MEMORY:GPU", 0.2);

        let demand = ResourceDemand::extract(&map, &config());

        assert!(demand.used_fallback);
    }

    #[test]
    fn extract_rounds_quantities() {
        let map = ResourceMap::new()
            .with_persistent("MEMORY:GPU", 10.6)
            .with_temporary("MEMORY:GPU", 4.4);

        let demand = ResourceDemand::extract(&map, &config());

        assert_eq!(demand.persistent_memory, 11);
        assert_eq!(demand.memory_limit, 15);
    }

    #[test]
    fn extract_temporary_only_has_no_persistent() {
        let map = ResourceMap::new().with_temporary("MEMORY:GPU", 512.0);

        let demand = ResourceDemand::extract(&map, &config());

        assert_eq!(demand.memory_limit, 512);
        assert_eq!(demand.persistent_memory, 0);
    }

    #[test]
    fn extract_ignores_other_resource_keys() {
        let map = ResourceMap::new()
            .with_persistent("MEMORY:CPU", 1024.0)
            .with_persistent("MEMORY:GPU", 64.0);

        let demand = ResourceDemand::extract(&map, &config());

        assert_eq!(demand.memory_limit, 64);
    }

    #[test]
    fn extract_negative_hint_counts_as_zero() {
        let map = ResourceMap::new()
            .with_persistent("MEMORY:GPU", 100.0)
            .with_temporary("MEMORY:GPU", -50.0);

        let demand = ResourceDemand::extract(&map, &config());

        assert_eq!(demand.memory_limit, 100);
        assert!(demand.persistent_memory <= demand.memory_limit);
    }

    #[test]
    fn extract_runtime_converts_seconds_to_millis() {
        let map = ResourceMap::new().with_persistent("TIME:TOTAL", 5.0);

        let demand = ResourceDemand::extract(&map, &config());

        assert_eq!(demand.expected_runtime_ms, 5000);
    }

    #[test]
    fn extract_runtime_rounds_before_scaling() {
        let map = ResourceMap::new().with_persistent("TIME:TOTAL", 2.4);

        let demand = ResourceDemand::extract(&map, &config());

        assert_eq!(demand.expected_runtime_ms, 2000);
    }

    #[test]
    fn extract_honors_configured_resource_key() {
        let config = DemandConfig {
            fallback_capacity: 1,
            resource_key: "MEMORY:GPU0".to_string(),
        };
        let map = ResourceMap::new().with_persistent("MEMORY:GPU0", 77.0);

        let demand = ResourceDemand::extract(&map, &config);

        assert_eq!(demand.memory_limit, 77);
    }

    #[test]
    fn to_layout_has_single_entry() {
        let map = ResourceMap::new()
            .with_persistent("MEMORY:GPU", 20.0)
            .with_temporary("MEMORY:GPU", 10.0);
        let layout = ResourceDemand::extract(&map, &config()).to_layout();

        assert_eq!(layout.len(), 1);
        assert_eq!(layout.entries()[0].memory_limit, 30);
        assert_eq!(layout.entries()[0].persistent_memory, 20);
    }

    #[test]
    fn resource_map_parses_from_toml() {
        let toml_str = r#"
[persistent]
"MEMORY:GPU" = 2048.0
"TIME:TOTAL" = 3.0

[temporary]
"MEMORY:GPU" = 1024.0
"#;
        let map: ResourceMap = toml::from_str(toml_str).unwrap();
        let demand = ResourceDemand::extract(&map, &config());

        assert_eq!(demand.memory_limit, 3072);
        assert_eq!(demand.expected_runtime_ms, 3000);
    }
}
