//! Memory allocators backing devices
//!
//! Allocators only do bookkeeping: they hand out offsets inside the range
//! they manage and track what is in use. Allocators that can describe their
//! internal layout expose it through [`Allocator::as_diagnosable`].

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::DeviceError;
use crate::lane::LaneId;

/// Alignment of every lane allocation, in bytes
pub const LANE_ALIGNMENT: u64 = 256;

/// Allocator interface shared by all devices
pub trait Allocator: Send + Sync {
    /// Name used in logs and errors
    fn name(&self) -> &str;

    /// Reserve `bytes` and return the offset of the reservation
    fn allocate(&self, bytes: u64) -> Result<u64, DeviceError>;

    /// Return a reservation previously handed out by `allocate`
    fn deallocate(&self, offset: u64) -> Result<(), DeviceError>;

    /// Bytes currently reserved
    fn in_use(&self) -> u64;

    /// Diagnostics capability, for allocators that can dump their layout
    fn as_diagnosable(&self) -> Option<&dyn DiagnosticsProvider> {
        None
    }
}

/// Optional capability: render a human-readable memory map
pub trait DiagnosticsProvider {
    fn memory_map(&self) -> String;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Host memory allocator with an optional byte limit
///
/// Used by CPU devices, both for pageable host memory and for the
/// device-compatible (pinned) staging memory.
pub struct HostAllocator {
    name: String,
    limit: Option<u64>,
    next_offset: AtomicU64,
    allocations: Mutex<HashMap<u64, u64>>,
    in_use: AtomicU64,
}

impl HostAllocator {
    pub fn new(name: impl Into<String>, limit: Option<u64>) -> Self {
        Self {
            name: name.into(),
            limit,
            next_offset: AtomicU64::new(0),
            allocations: Mutex::new(HashMap::new()),
            in_use: AtomicU64::new(0),
        }
    }

    /// Unbounded pinned-host allocator
    pub fn pinned() -> Self {
        Self::new("cuda_host_bfc", None)
    }
}

impl Allocator for HostAllocator {
    fn name(&self) -> &str {
        &self.name
    }

    fn allocate(&self, bytes: u64) -> Result<u64, DeviceError> {
        let mut allocations = lock(&self.allocations);
        let used = self.in_use.load(Ordering::SeqCst);
        if let Some(limit) = self.limit
            && used.saturating_add(bytes) > limit
        {
            return Err(DeviceError::OutOfMemory {
                allocator: self.name.clone(),
                requested: bytes,
                available: limit.saturating_sub(used),
            });
        }
        let offset = self.next_offset.fetch_add(bytes.max(1), Ordering::SeqCst);
        allocations.insert(offset, bytes);
        self.in_use.fetch_add(bytes, Ordering::SeqCst);
        Ok(offset)
    }

    fn deallocate(&self, offset: u64) -> Result<(), DeviceError> {
        let bytes = lock(&self.allocations).remove(&offset).ok_or_else(|| {
            DeviceError::UnknownAllocation {
                allocator: self.name.clone(),
                offset,
            }
        })?;
        self.in_use.fetch_sub(bytes, Ordering::SeqCst);
        Ok(())
    }

    fn in_use(&self) -> u64 {
        self.in_use.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Region {
    size: u64,
    used: bool,
}

/// First-fit region allocator over one lane's slice of device memory
pub struct LaneAllocator {
    name: String,
    lane_id: LaneId,
    capacity: u64,
    regions: Mutex<BTreeMap<u64, Region>>,
}

impl LaneAllocator {
    pub fn new(lane_id: LaneId, capacity: u64) -> Self {
        let mut regions = BTreeMap::new();
        regions.insert(
            0,
            Region {
                size: capacity,
                used: false,
            },
        );
        Self {
            name: format!("lane_{lane_id}_bfc"),
            lane_id,
            capacity,
            regions: Mutex::new(regions),
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Carve exactly `bytes` out of the lane for a lane lease
    ///
    /// Lease regions are not aligned so that a lane can be filled to its
    /// configured capacity.
    pub fn reserve_region(&self, bytes: u64) -> Result<u64, DeviceError> {
        self.carve(bytes.max(1), bytes)
    }

    fn aligned(bytes: u64) -> u64 {
        bytes.max(1).div_ceil(LANE_ALIGNMENT) * LANE_ALIGNMENT
    }

    /// First free region of at least `size` bytes, split off its front
    fn carve(&self, size: u64, requested: u64) -> Result<u64, DeviceError> {
        let mut regions = lock(&self.regions);

        let found = regions
            .iter()
            .find(|(_, region)| !region.used && region.size >= size)
            .map(|(offset, region)| (*offset, region.size));

        let Some((offset, region_size)) = found else {
            let largest = regions
                .values()
                .filter(|region| !region.used)
                .map(|region| region.size)
                .max()
                .unwrap_or(0);
            return Err(DeviceError::OutOfMemory {
                allocator: self.name.clone(),
                requested,
                available: largest,
            });
        };

        regions.insert(offset, Region { size, used: true });
        if region_size > size {
            regions.insert(
                offset + size,
                Region {
                    size: region_size - size,
                    used: false,
                },
            );
        }
        Ok(offset)
    }
}

impl Allocator for LaneAllocator {
    fn name(&self) -> &str {
        &self.name
    }

    fn allocate(&self, bytes: u64) -> Result<u64, DeviceError> {
        self.carve(Self::aligned(bytes), bytes)
    }

    fn deallocate(&self, offset: u64) -> Result<(), DeviceError> {
        let mut regions = lock(&self.regions);
        let unknown = || DeviceError::UnknownAllocation {
            allocator: self.name.clone(),
            offset,
        };

        let region = regions.get_mut(&offset).ok_or_else(unknown)?;
        if !region.used {
            return Err(unknown());
        }
        region.used = false;
        let mut start = offset;
        let mut size = region.size;

        // coalesce with the following free region
        if let Some(next) = regions.get(&(start + size)).copied()
            && !next.used
        {
            regions.remove(&(start + size));
            size += next.size;
        }

        // coalesce with the preceding free region
        let prev = regions
            .range(..start)
            .next_back()
            .map(|(offset, region)| (*offset, *region));
        if let Some((prev_offset, prev)) = prev
            && !prev.used
            && prev_offset + prev.size == start
        {
            regions.remove(&start);
            start = prev_offset;
            size += prev.size;
        }

        regions.insert(start, Region { size, used: false });
        Ok(())
    }

    fn in_use(&self) -> u64 {
        lock(&self.regions)
            .values()
            .filter(|region| region.used)
            .map(|region| region.size)
            .sum()
    }

    fn as_diagnosable(&self) -> Option<&dyn DiagnosticsProvider> {
        Some(self)
    }
}

impl DiagnosticsProvider for LaneAllocator {
    fn memory_map(&self) -> String {
        let regions = lock(&self.regions);
        let in_use: u64 = regions.values().filter(|r| r.used).map(|r| r.size).sum();

        let mut out = String::new();
        let _ = writeln!(
            out,
            "lane {} capacity {} in_use {}",
            self.lane_id, self.capacity, in_use
        );
        for (offset, region) in regions.iter() {
            let state = if region.used { "used" } else { "free" };
            let _ = writeln!(out, "0x{offset:012x} {:>12} {state}", region.size);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==================== HostAllocator Tests ====================

    #[test]
    fn host_allocator_tracks_usage() {
        let alloc = HostAllocator::new("cpu", None);

        let a = alloc.allocate(100).unwrap();
        let b = alloc.allocate(50).unwrap();
        assert_ne!(a, b);
        assert_eq!(alloc.in_use(), 150);

        alloc.deallocate(a).unwrap();
        assert_eq!(alloc.in_use(), 50);
    }

    #[test]
    fn host_allocator_enforces_limit() {
        let alloc = HostAllocator::new("cpu", Some(100));

        alloc.allocate(80).unwrap();
        let result = alloc.allocate(30);

        assert!(matches!(
            result,
            Err(DeviceError::OutOfMemory { available: 20, .. })
        ));
    }

    #[test]
    fn host_allocator_rejects_unknown_offset() {
        let alloc = HostAllocator::new("cpu", None);
        assert!(matches!(
            alloc.deallocate(42),
            Err(DeviceError::UnknownAllocation { .. })
        ));
    }

    #[test]
    fn host_allocator_has_no_diagnostics() {
        let alloc = HostAllocator::pinned();
        assert!(alloc.as_diagnosable().is_none());
    }

    // ==================== LaneAllocator Tests ====================

    #[test]
    fn lane_allocator_aligns_allocations() {
        let alloc = LaneAllocator::new(0, 4096);

        let a = alloc.allocate(10).unwrap();
        let b = alloc.allocate(10).unwrap();

        assert_eq!(a, 0);
        assert_eq!(b, LANE_ALIGNMENT);
        assert_eq!(alloc.in_use(), 2 * LANE_ALIGNMENT);
    }

    #[test]
    fn lane_allocator_reports_out_of_memory() {
        let alloc = LaneAllocator::new(0, 1024);

        alloc.allocate(1024).unwrap();
        let result = alloc.allocate(1);

        assert!(matches!(
            result,
            Err(DeviceError::OutOfMemory { available: 0, .. })
        ));
    }

    #[test]
    fn lane_allocator_coalesces_freed_regions() {
        let alloc = LaneAllocator::new(0, 1024);

        let a = alloc.allocate(256).unwrap();
        let b = alloc.allocate(256).unwrap();
        let c = alloc.allocate(256).unwrap();

        alloc.deallocate(a).unwrap();
        alloc.deallocate(c).unwrap();
        alloc.deallocate(b).unwrap();

        assert_eq!(alloc.in_use(), 0);
        // the whole range is one free region again
        assert_eq!(alloc.allocate(1024).unwrap(), 0);
    }

    #[test]
    fn lane_allocator_reuses_first_fit_hole() {
        let alloc = LaneAllocator::new(0, 1024);

        let a = alloc.allocate(256).unwrap();
        let _b = alloc.allocate(256).unwrap();
        alloc.deallocate(a).unwrap();

        assert_eq!(alloc.allocate(200).unwrap(), a);
    }

    #[test]
    fn lane_allocator_rejects_double_free() {
        let alloc = LaneAllocator::new(0, 1024);
        let a = alloc.allocate(256).unwrap();

        alloc.deallocate(a).unwrap();

        assert!(alloc.deallocate(a).is_err());
    }

    #[test]
    fn lane_region_reservation_is_exact() {
        let alloc = LaneAllocator::new(0, 1000);

        let a = alloc.reserve_region(600).unwrap();
        let b = alloc.reserve_region(400).unwrap();

        assert_eq!((a, b), (0, 600));
        assert_eq!(alloc.in_use(), 1000);
        assert!(alloc.reserve_region(1).is_err());

        alloc.deallocate(a).unwrap();
        assert_eq!(alloc.allocate(10).unwrap(), 0);
    }

    #[test]
    fn lane_allocator_memory_map_lists_regions() {
        let alloc = LaneAllocator::new(3, 1024);
        alloc.allocate(256).unwrap();

        let map = alloc
            .as_diagnosable()
            .expect("lane allocator is diagnosable")
            .memory_map();

        assert!(map.starts_with("lane 3 capacity 1024 in_use 256"));
        assert!(map.contains("0x000000000000          256 used"));
        assert!(map.contains("0x000000000100          768 free"));
    }
}
