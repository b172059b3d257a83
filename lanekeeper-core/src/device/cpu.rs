//! CPU companion device
//!
//! One CPU device is shared by every session on the instance. It serves
//! pageable host memory, and pinned host memory for anything that needs to
//! be visible to the accelerators.

use std::sync::{Arc, OnceLock};

use tracing::debug;

use super::allocator::{Allocator, HostAllocator};
use super::pool::{ObjectPool, PerTaskDevice, Pooled, ResourceContext};
use super::{AllocatorAttributes, Device, DeviceKind, DeviceSpec};
use crate::config::CpuConfig;

pub struct CpuDevice {
    name: String,
    memory_limit: u64,
    allocator: Arc<dyn Allocator>,
    gpu_allocator: Option<Arc<dyn Allocator>>,
    fallback_gpu_allocator: OnceLock<Arc<dyn Allocator>>,
    pool: ObjectPool<PerTaskDevice>,
}

impl CpuDevice {
    /// Create a CPU device
    ///
    /// `gpu_allocator` serves device-compatible requests; without one the
    /// device lazily creates its own pinned allocator.
    pub fn new(
        name: impl Into<String>,
        memory_limit: u64,
        gpu_allocator: Option<Arc<dyn Allocator>>,
    ) -> Self {
        let name = name.into();
        Self {
            allocator: Arc::new(HostAllocator::new(format!("{name}/cpu"), Some(memory_limit))),
            name,
            memory_limit,
            gpu_allocator,
            fallback_gpu_allocator: OnceLock::new(),
            pool: ObjectPool::new(),
        }
    }

    /// Pool backing this device's per-task surrogates
    pub fn task_pool(&self) -> &ObjectPool<PerTaskDevice> {
        &self.pool
    }
}

impl Device for CpuDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> DeviceKind {
        DeviceKind::Cpu
    }

    fn memory_limit(&self) -> u64 {
        self.memory_limit
    }

    fn allocator(&self, attrs: AllocatorAttributes) -> Arc<dyn Allocator> {
        if attrs.gpu_compatible {
            if let Some(alloc) = &self.gpu_allocator {
                return Arc::clone(alloc);
            }
            return Arc::clone(
                self.fallback_gpu_allocator
                    .get_or_init(|| Arc::new(HostAllocator::pinned())),
            );
        }
        Arc::clone(&self.allocator)
    }

    fn create_per_task_device(self: Arc<Self>, rctx: ResourceContext) -> Pooled<PerTaskDevice> {
        let pool = &self.pool;
        let owner: Arc<dyn Device> = self.clone();
        pool.acquire_for(owner, rctx)
    }
}

/// Creates the CPU devices of an instance
pub struct CpuDeviceFactory;

impl CpuDeviceFactory {
    /// Create `config.count` devices named `{prefix}/device:CPU:{i}`
    pub fn create_devices(config: &CpuConfig) -> Vec<Arc<CpuDevice>> {
        (0..config.count)
            .map(|i| {
                let name = DeviceSpec::cpu(i as u32).device_name(&config.name_prefix);
                debug!(device = %name, memory_limit = config.memory_limit, "Creating CPU device");
                Arc::new(CpuDevice::new(name, config.memory_limit, None))
            })
            .collect()
    }
}
