use super::types::{RawCpuConfig, RawDemandConfig, RawInstanceConfig, RawSchedulerConfig};
use anyhow::Result;
use directories::ProjectDirs;
use lanekeeper_core::{CpuConfig, DemandConfig, InstanceConfig, SchedulerConfig};
use std::path::{Path, PathBuf};

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load merged configuration (user + project)
    pub fn load() -> Result<InstanceConfig> {
        let mut raw = RawInstanceConfig::default();

        // Layer 1: User config
        if let Some(user_path) = Self::user_config_path()
            && user_path.exists()
        {
            raw = Self::merge_raw(raw, Self::read_raw(&user_path)?);
        }

        // Layer 2: Project config
        let project_path = Self::project_config_path();
        if project_path.exists() {
            raw = Self::merge_raw(raw, Self::read_raw(&project_path)?);
        }

        Self::finalize(raw)
    }

    /// Load a single config file on top of the defaults
    pub fn load_from_path(path: &Path) -> Result<InstanceConfig> {
        if path.exists() {
            Self::finalize(Self::read_raw(path)?)
        } else {
            Self::finalize(RawInstanceConfig::default())
        }
    }

    /// Get user config path (platform-specific)
    pub fn user_config_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "lanekeeper").map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Get project config path
    /// Can be overridden with LANEKEEPER_PROJECT_CONFIG_DIR env var (useful for isolated tests)
    pub fn project_config_path() -> PathBuf {
        if let Ok(dir) = std::env::var("LANEKEEPER_PROJECT_CONFIG_DIR") {
            PathBuf::from(dir).join("config.toml")
        } else {
            PathBuf::from(".lanekeeper/config.toml")
        }
    }

    fn read_raw(path: &Path) -> Result<RawInstanceConfig> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Merge two raw configs (overlay values override base only if explicitly set)
    fn merge_raw(base: RawInstanceConfig, overlay: RawInstanceConfig) -> RawInstanceConfig {
        RawInstanceConfig {
            demand: RawDemandConfig {
                fallback_capacity: overlay
                    .demand
                    .fallback_capacity
                    .or(base.demand.fallback_capacity),
                resource_key: overlay.demand.resource_key.or(base.demand.resource_key),
            },
            scheduler: RawSchedulerConfig {
                max_bypass: overlay.scheduler.max_bypass.or(base.scheduler.max_bypass),
                wait_timeout_ms: overlay
                    .scheduler
                    .wait_timeout_ms
                    .or(base.scheduler.wait_timeout_ms),
            },
            cpu: RawCpuConfig {
                count: overlay.cpu.count.or(base.cpu.count),
                memory_limit: overlay.cpu.memory_limit.or(base.cpu.memory_limit),
                name_prefix: overlay.cpu.name_prefix.or(base.cpu.name_prefix),
            },
            lanes: overlay.lanes.or(base.lanes),
        }
    }

    /// Convert raw config to final config with defaults applied
    fn finalize(raw: RawInstanceConfig) -> Result<InstanceConfig> {
        let defaults = InstanceConfig::default();
        let config = InstanceConfig {
            demand: DemandConfig {
                fallback_capacity: raw
                    .demand
                    .fallback_capacity
                    .unwrap_or(defaults.demand.fallback_capacity),
                resource_key: raw
                    .demand
                    .resource_key
                    .unwrap_or(defaults.demand.resource_key),
            },
            scheduler: SchedulerConfig {
                max_bypass: raw
                    .scheduler
                    .max_bypass
                    .unwrap_or(defaults.scheduler.max_bypass),
                wait_timeout_ms: raw.scheduler.wait_timeout_ms,
            },
            cpu: CpuConfig {
                count: raw.cpu.count.unwrap_or(defaults.cpu.count),
                memory_limit: raw.cpu.memory_limit.unwrap_or(defaults.cpu.memory_limit),
                name_prefix: raw.cpu.name_prefix.unwrap_or(defaults.cpu.name_prefix),
            },
            lanes: raw.lanes.unwrap_or(defaults.lanes),
        };
        config.validate()?;
        Ok(config)
    }
}
