//! Devices handed to sessions
//!
//! A session's device set always starts with the shared CPU companion
//! device, followed by one device view per lane it was granted.

pub mod allocator;
pub mod cpu;
pub mod lane;
pub mod pool;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::error;

use crate::error::DeviceError;

pub use allocator::{Allocator, DiagnosticsProvider, HostAllocator, LaneAllocator};
pub use cpu::{CpuDevice, CpuDeviceFactory};
pub use lane::LaneDevice;
pub use pool::{ObjectPool, PerTaskDevice, Poolable, Pooled, ResourceContext};

/// Kind of device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeviceKind {
    Cpu,
    Gpu,
}

impl DeviceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cpu => "CPU",
            Self::Gpu => "GPU",
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Addresses one device by kind and index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceSpec {
    pub kind: DeviceKind,
    pub id: u32,
}

impl DeviceSpec {
    pub fn cpu(id: u32) -> Self {
        Self {
            kind: DeviceKind::Cpu,
            id,
        }
    }

    pub fn gpu(id: u32) -> Self {
        Self {
            kind: DeviceKind::Gpu,
            id,
        }
    }

    /// Fully qualified device name under `prefix`
    pub fn device_name(&self, prefix: &str) -> String {
        format!("{prefix}/device:{}:{}", self.kind, self.id)
    }
}

impl fmt::Display for DeviceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// Which kind of memory a caller wants from a device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocatorAttributes {
    /// Host memory, even on an accelerator device
    pub on_host: bool,
    /// Host memory that accelerators can access directly (pinned)
    pub gpu_compatible: bool,
}

impl AllocatorAttributes {
    pub fn device() -> Self {
        Self::default()
    }

    pub fn gpu_compatible() -> Self {
        Self {
            on_host: true,
            gpu_compatible: true,
        }
    }
}

/// A compute device that sessions place work on
pub trait Device: Send + Sync {
    /// Fully qualified device name
    fn name(&self) -> &str;

    fn kind(&self) -> DeviceKind;

    /// Memory the device advertises, in bytes
    fn memory_limit(&self) -> u64;

    /// Allocator for memory matching `attrs`
    fn allocator(&self, attrs: AllocatorAttributes) -> Arc<dyn Allocator>;

    /// Borrow a pooled per-task surrogate of this device
    fn create_per_task_device(self: Arc<Self>, rctx: ResourceContext) -> Pooled<PerTaskDevice>;
}

impl fmt::Debug for dyn Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name())
            .field("kind", &self.kind())
            .finish()
    }
}

/// Every device an instance knows about, indexed by spec
pub struct DeviceContainer {
    devices: Vec<Arc<dyn Device>>,
    by_spec: HashMap<DeviceSpec, Arc<dyn Device>>,
}

impl DeviceContainer {
    pub fn new() -> Self {
        Self {
            devices: Vec::new(),
            by_spec: HashMap::new(),
        }
    }

    /// Register `device` under `spec`; a later registration wins
    pub fn add(&mut self, spec: DeviceSpec, device: Arc<dyn Device>) {
        self.devices.push(Arc::clone(&device));
        self.by_spec.insert(spec, device);
    }

    /// Look up a device, logging when it is missing
    pub fn lookup(&self, spec: &DeviceSpec) -> Result<Arc<dyn Device>, DeviceError> {
        match self.by_spec.get(spec) {
            Some(device) => Ok(Arc::clone(device)),
            None => {
                error!(spec = %spec, "Cannot find device");
                Err(DeviceError::NotFound(spec.to_string()))
            }
        }
    }

    pub fn devices(&self) -> &[Arc<dyn Device>] {
        &self.devices
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

impl Default for DeviceContainer {
    fn default() -> Self {
        Self::new()
    }
}
