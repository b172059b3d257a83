//! Execution lanes
//!
//! A lane is a fixed slice of one GPU's memory plus the execution streams
//! that go with it. Lanes are created once by the [`LaneManager`] and live
//! for the whole process; sessions borrow them through [`LaneLease`]s.

pub mod manager;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::device::{LaneAllocator, LaneDevice};

pub use manager::{LaneLease, LaneManager};

/// Identifier of a lane, unique within a manager
pub type LaneId = u32;

/// Memory requirement for one lane of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutEntry {
    /// Bytes reserved on the lane while the lease is held
    pub memory_limit: u64,
    /// Portion of `memory_limit` kept for the whole session
    pub persistent_memory: u64,
}

/// Ordered list of per-lane requirements
///
/// Each entry is placed on a distinct lane; the granted lanes come back in
/// the same order as the entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaneLayout {
    entries: Vec<LayoutEntry>,
}

impl LaneLayout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, memory_limit: u64, persistent_memory: u64) {
        self.entries.push(LayoutEntry {
            memory_limit,
            persistent_memory,
        });
    }

    pub fn entries(&self) -> &[LayoutEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<LayoutEntry> for LaneLayout {
    fn from_iter<I: IntoIterator<Item = LayoutEntry>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// A bound slice of one GPU
pub struct Lane {
    id: LaneId,
    gpu: u32,
    total_memory: u64,
    /// Only written by the manager while it holds its scheduling lock
    available_memory: AtomicU64,
    base_stream_index: u32,
    streams: u32,
    device: Arc<LaneDevice>,
    allocator: Arc<LaneAllocator>,
}

impl Lane {
    pub(crate) fn new(
        id: LaneId,
        gpu: u32,
        total_memory: u64,
        base_stream_index: u32,
        streams: u32,
        device: Arc<LaneDevice>,
        allocator: Arc<LaneAllocator>,
    ) -> Self {
        Self {
            id,
            gpu,
            total_memory,
            available_memory: AtomicU64::new(total_memory),
            base_stream_index,
            streams,
            device,
            allocator,
        }
    }

    pub fn id(&self) -> LaneId {
        self.id
    }

    pub fn gpu(&self) -> u32 {
        self.gpu
    }

    pub fn total_memory(&self) -> u64 {
        self.total_memory
    }

    /// Memory not reserved by any lease
    pub fn available_memory(&self) -> u64 {
        self.available_memory.load(Ordering::SeqCst)
    }

    /// Index of the lane's first stream on its GPU
    pub fn base_stream_index(&self) -> u32 {
        self.base_stream_index
    }

    pub fn streams(&self) -> u32 {
        self.streams
    }

    /// Device view sessions on this lane place work on
    pub fn device(&self) -> &Arc<LaneDevice> {
        &self.device
    }

    pub fn allocator(&self) -> &Arc<LaneAllocator> {
        &self.allocator
    }

    pub(crate) fn reserve(&self, bytes: u64) {
        self.available_memory.fetch_sub(bytes, Ordering::SeqCst);
    }

    pub(crate) fn release(&self, bytes: u64) {
        let released = self.available_memory.fetch_add(bytes, Ordering::SeqCst) + bytes;
        debug_assert!(released <= self.total_memory);
    }
}

impl std::fmt::Debug for Lane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lane")
            .field("id", &self.id)
            .field("gpu", &self.gpu)
            .field("total_memory", &self.total_memory)
            .field("available_memory", &self.available_memory())
            .field("base_stream_index", &self.base_stream_index)
            .finish()
    }
}
