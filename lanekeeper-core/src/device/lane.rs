//! Per-lane device view
//!
//! Each lane is exposed to sessions as its own GPU device whose memory is
//! the lane's slice and whose allocator is the lane allocator.

use std::sync::Arc;

use super::allocator::{Allocator, LaneAllocator};
use super::pool::{ObjectPool, PerTaskDevice, Pooled, ResourceContext};
use super::{AllocatorAttributes, Device, DeviceKind};
use crate::lane::LaneId;

pub struct LaneDevice {
    name: String,
    lane_id: LaneId,
    gpu: u32,
    allocator: Arc<LaneAllocator>,
    host_allocator: Arc<dyn Allocator>,
    pool: ObjectPool<PerTaskDevice>,
}

impl LaneDevice {
    pub fn new(
        name: impl Into<String>,
        lane_id: LaneId,
        gpu: u32,
        allocator: Arc<LaneAllocator>,
        host_allocator: Arc<dyn Allocator>,
    ) -> Self {
        Self {
            name: name.into(),
            lane_id,
            gpu,
            allocator,
            host_allocator,
            pool: ObjectPool::new(),
        }
    }

    pub fn lane_id(&self) -> LaneId {
        self.lane_id
    }

    /// Physical GPU the lane lives on
    pub fn gpu(&self) -> u32 {
        self.gpu
    }

    pub fn task_pool(&self) -> &ObjectPool<PerTaskDevice> {
        &self.pool
    }
}

impl Device for LaneDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> DeviceKind {
        DeviceKind::Gpu
    }

    fn memory_limit(&self) -> u64 {
        self.allocator.capacity()
    }

    fn allocator(&self, attrs: AllocatorAttributes) -> Arc<dyn Allocator> {
        if attrs.on_host {
            return Arc::clone(&self.host_allocator);
        }
        self.allocator.clone()
    }

    fn create_per_task_device(self: Arc<Self>, rctx: ResourceContext) -> Pooled<PerTaskDevice> {
        let pool = &self.pool;
        let owner: Arc<dyn Device> = self.clone();
        pool.acquire_for(owner, rctx)
    }
}
