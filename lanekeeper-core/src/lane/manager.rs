//! Lane manager
//!
//! Owns the fixed set of lanes and hands them out asynchronously. A request
//! that cannot be satisfied right away is queued; whenever memory is
//! returned the queue is scanned again in arrival order and every request
//! that now fits is granted through its completion channel.
//!
//! Smaller requests may overtake a large one that does not fit yet, but only
//! `max_bypass` times. After that nothing queued behind the large request is
//! granted until it is.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::{Lane, LaneId, LaneLayout};
use crate::config::InstanceConfig;
use crate::device::{
    Allocator, AllocatorAttributes, CpuDevice, Device, DeviceSpec, LaneAllocator, LaneDevice,
};
use crate::error::LaneError;

struct Pending {
    ticket: u64,
    layout: LaneLayout,
    /// Times a later request was granted while this one waited
    bypassed: u32,
    reply: oneshot::Sender<Vec<LaneLease>>,
}

#[derive(Default)]
struct SchedState {
    pending: VecDeque<Pending>,
    next_ticket: u64,
    closed: bool,
}

struct Shared {
    lanes: Vec<Arc<Lane>>,
    state: Mutex<SchedState>,
    max_bypass: u32,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SchedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run one scheduling pass; leases nobody was waiting for any more are
    /// dropped after the lock is released
    fn schedule(self: &Arc<Self>) {
        let undelivered = {
            let mut state = self.lock();
            self.grant_pending(&mut state)
        };
        drop(undelivered);
    }

    fn grant_pending(self: &Arc<Self>, state: &mut SchedState) -> Vec<LaneLease> {
        let mut undelivered = Vec::new();
        let queued = std::mem::take(&mut state.pending);
        let mut waiting: VecDeque<Pending> = VecDeque::with_capacity(queued.len());
        let mut blocked = false;

        for pending in queued {
            if pending.reply.is_closed() {
                debug!(ticket = pending.ticket, "Dropping abandoned lane request");
                continue;
            }
            if !blocked && let Some(leases) = self.try_grant(&pending.layout) {
                for older in waiting.iter_mut() {
                    older.bypassed += 1;
                }
                debug!(
                    ticket = pending.ticket,
                    lanes = ?leases.iter().map(LaneLease::lane_id).collect::<Vec<_>>(),
                    "Granted lane request"
                );
                if let Err(leases) = pending.reply.send(leases) {
                    undelivered.extend(leases);
                }
                continue;
            }
            if pending.bypassed >= self.max_bypass {
                blocked = true;
            }
            waiting.push_back(pending);
        }

        state.pending = waiting;
        undelivered
    }

    /// Carve one region per entry, each on a distinct lane, best fit first
    ///
    /// Either every entry gets a region or none keeps one.
    fn try_grant(self: &Arc<Self>, layout: &LaneLayout) -> Option<Vec<LaneLease>> {
        let mut carved: Vec<(Arc<Lane>, u64)> = Vec::with_capacity(layout.len());
        for entry in layout.entries() {
            let mut candidates: Vec<&Arc<Lane>> = self
                .lanes
                .iter()
                .filter(|lane| !carved.iter().any(|(c, _)| c.id() == lane.id()))
                .filter(|lane| lane.available_memory() >= entry.memory_limit)
                .collect();
            candidates.sort_by_key(|lane| (lane.available_memory(), lane.id()));

            // free bytes may be split across regions, so try the next lane
            let region = candidates.into_iter().find_map(|lane| {
                let offset = lane.allocator().reserve_region(entry.memory_limit).ok()?;
                Some((Arc::clone(lane), offset))
            });
            let Some(region) = region else {
                for (lane, offset) in carved {
                    free_region(&lane, offset);
                }
                return None;
            };
            carved.push(region);
        }

        let leases = carved
            .into_iter()
            .zip(layout.entries())
            .map(|((lane, offset), entry)| {
                lane.reserve(entry.memory_limit);
                LaneLease {
                    lane,
                    offset,
                    reserved: entry.memory_limit,
                    persistent: entry.persistent_memory,
                    shared: Arc::clone(self),
                }
            })
            .collect();
        Some(leases)
    }
}

fn free_region(lane: &Lane, offset: u64) {
    if let Err(e) = lane.allocator().deallocate(offset) {
        warn!(lane_id = lane.id(), offset, error = %e, "Failed to free lane region");
    }
}

/// Memory reserved on one lane
///
/// The reservation is returned to the lane, and waiting requests are
/// rescheduled, when the lease is dropped.
pub struct LaneLease {
    lane: Arc<Lane>,
    offset: u64,
    reserved: u64,
    persistent: u64,
    shared: Arc<Shared>,
}

impl LaneLease {
    pub fn lane(&self) -> &Arc<Lane> {
        &self.lane
    }

    pub fn lane_id(&self) -> LaneId {
        self.lane.id()
    }

    /// Start of the lease's region in the lane allocator
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Bytes held on the lane by this lease
    pub fn reserved(&self) -> u64 {
        self.reserved
    }

    pub fn persistent(&self) -> u64 {
        self.persistent
    }
}

impl Drop for LaneLease {
    fn drop(&mut self) {
        let undelivered = {
            let mut state = self.shared.lock();
            self.lane.release(self.reserved);
            free_region(&self.lane, self.offset);
            self.shared.grant_pending(&mut state)
        };
        debug!(lane_id = self.lane.id(), bytes = self.reserved, "Released lane memory");
        drop(undelivered);
    }
}

impl fmt::Debug for LaneLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LaneLease")
            .field("lane_id", &self.lane.id())
            .field("offset", &self.offset)
            .field("reserved", &self.reserved)
            .field("persistent", &self.persistent)
            .finish()
    }
}

/// Reschedules when a request stops waiting without being granted
struct WaitGuard<'a> {
    shared: &'a Arc<Shared>,
    armed: bool,
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.schedule();
        }
    }
}

/// Owns the lanes of an instance and schedules requests onto them
pub struct LaneManager {
    shared: Arc<Shared>,
    cpu_device: Arc<CpuDevice>,
    wait_timeout: Option<Duration>,
}

impl LaneManager {
    /// Build the lanes described by `config`
    ///
    /// Every lane gets a [`LaneDevice`] named after its lane id; host memory
    /// requested through a lane device comes from the CPU device's
    /// device-compatible allocator.
    pub fn new(config: &InstanceConfig, cpu_device: Arc<CpuDevice>) -> Self {
        let host_allocator = cpu_device.allocator(AllocatorAttributes::gpu_compatible());
        let mut next_stream: Vec<(u32, u32)> = Vec::new();
        let mut lanes = Vec::with_capacity(config.lanes.len());

        for (index, lane_config) in config.lanes.iter().enumerate() {
            let id = index as LaneId;
            let base_stream_index = match next_stream.iter_mut().find(|(gpu, _)| *gpu == lane_config.gpu) {
                Some((_, next)) => {
                    let base = *next;
                    *next += lane_config.streams;
                    base
                }
                None => {
                    next_stream.push((lane_config.gpu, lane_config.streams));
                    0
                }
            };

            let allocator = Arc::new(LaneAllocator::new(id, lane_config.memory));
            let device = Arc::new(LaneDevice::new(
                DeviceSpec::gpu(id).device_name(&config.cpu.name_prefix),
                id,
                lane_config.gpu,
                Arc::clone(&allocator),
                Arc::clone(&host_allocator),
            ));
            info!(
                lane_id = id,
                gpu = lane_config.gpu,
                memory = lane_config.memory,
                base_stream_index,
                "Created lane"
            );
            lanes.push(Arc::new(Lane::new(
                id,
                lane_config.gpu,
                lane_config.memory,
                base_stream_index,
                lane_config.streams,
                device,
                allocator,
            )));
        }

        Self {
            shared: Arc::new(Shared {
                lanes,
                state: Mutex::new(SchedState::default()),
                max_bypass: config.scheduler.max_bypass,
            }),
            cpu_device,
            wait_timeout: config.scheduler.wait_timeout(),
        }
    }

    /// Request one lane per layout entry
    ///
    /// Resolves once every entry has been placed on a distinct lane with
    /// enough free memory. The leases come back in layout order.
    pub async fn request_lanes(&self, layout: LaneLayout) -> Result<Vec<LaneLease>, LaneError> {
        self.check_layout(&layout)?;

        let (tx, rx) = oneshot::channel();
        let ticket = {
            let mut state = self.shared.lock();
            if state.closed {
                return Err(LaneError::ManagerClosed);
            }
            let ticket = state.next_ticket;
            state.next_ticket += 1;
            state.pending.push_back(Pending {
                ticket,
                layout,
                bypassed: 0,
                reply: tx,
            });
            ticket
        };
        debug!(ticket, "Queued lane request");

        let mut guard = WaitGuard {
            shared: &self.shared,
            armed: true,
        };
        self.shared.schedule();

        let received = match self.wait_timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(received) => received,
                Err(_) => {
                    let waited_ms = u64::try_from(limit.as_millis()).unwrap_or(u64::MAX);
                    warn!(ticket, waited_ms, "Lane request timed out");
                    return Err(LaneError::Timeout { waited_ms });
                }
            },
            None => rx.await,
        };

        let leases = received.map_err(|_| LaneError::ManagerClosed)?;
        guard.armed = false;
        Ok(leases)
    }

    fn check_layout(&self, layout: &LaneLayout) -> Result<(), LaneError> {
        if layout.is_empty() {
            return Err(LaneError::InvalidLayout("layout has no entries".to_string()));
        }
        for (index, entry) in layout.entries().iter().enumerate() {
            if entry.memory_limit == 0 {
                return Err(LaneError::InvalidLayout(format!(
                    "entry {index} requests no memory"
                )));
            }
            if entry.persistent_memory > entry.memory_limit {
                return Err(LaneError::InvalidLayout(format!(
                    "entry {index} persistent memory {} exceeds its limit {}",
                    entry.persistent_memory, entry.memory_limit
                )));
            }
        }

        let lanes = &self.shared.lanes;
        if layout.len() > lanes.len() {
            return Err(LaneError::Unsatisfiable(format!(
                "{} lanes requested but only {} exist",
                layout.len(),
                lanes.len()
            )));
        }

        // largest entries against largest lanes, as if every lane were idle
        let mut totals: Vec<u64> = lanes.iter().map(|lane| lane.total_memory()).collect();
        totals.sort_unstable_by(|a, b| b.cmp(a));
        let mut wanted: Vec<u64> = layout.entries().iter().map(|e| e.memory_limit).collect();
        wanted.sort_unstable_by(|a, b| b.cmp(a));
        for (want, total) in wanted.iter().zip(&totals) {
            if want > total {
                return Err(LaneError::Unsatisfiable(format!(
                    "{want} bytes do not fit in any free lane of {total} bytes"
                )));
            }
        }
        Ok(())
    }

    /// The CPU device shared by every session
    pub fn compatible_cpu_device(&self) -> Arc<dyn Device> {
        self.cpu_device.clone()
    }

    pub fn lanes(&self) -> &[Arc<Lane>] {
        &self.shared.lanes
    }

    pub fn lane(&self, id: LaneId) -> Option<&Arc<Lane>> {
        self.shared.lanes.iter().find(|lane| lane.id() == id)
    }

    /// Requests still waiting for lanes
    pub fn pending_requests(&self) -> usize {
        self.shared
            .lock()
            .pending
            .iter()
            .filter(|pending| !pending.reply.is_closed())
            .count()
    }

    /// Fail every queued request and refuse new ones
    pub fn shutdown(&self) {
        let abandoned = {
            let mut state = self.shared.lock();
            state.closed = true;
            std::mem::take(&mut state.pending)
        };
        if !abandoned.is_empty() {
            info!(count = abandoned.len(), "Lane manager shut down with queued requests");
        }
        drop(abandoned);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LaneConfig, SchedulerConfig};
    use tokio_test::{assert_pending, assert_ready_ok, task};

    fn manager_with(lanes: &[u64], scheduler: SchedulerConfig) -> LaneManager {
        let config = InstanceConfig {
            lanes: lanes
                .iter()
                .map(|memory| LaneConfig {
                    gpu: 0,
                    memory: *memory,
                    streams: 1,
                })
                .collect(),
            scheduler,
            ..InstanceConfig::default()
        };
        let cpu = Arc::new(CpuDevice::new("/job:t/device:CPU:0", 1024, None));
        LaneManager::new(&config, cpu)
    }

    fn manager(lanes: &[u64]) -> LaneManager {
        manager_with(lanes, SchedulerConfig::default())
    }

    fn layout(limit: u64) -> LaneLayout {
        let mut layout = LaneLayout::new();
        layout.push(limit, 0);
        layout
    }

    // ==================== Construction Tests ====================

    #[test]
    fn lanes_on_same_gpu_get_consecutive_streams() {
        let config = InstanceConfig {
            lanes: vec![
                LaneConfig { gpu: 0, memory: 100, streams: 2 },
                LaneConfig { gpu: 1, memory: 100, streams: 1 },
                LaneConfig { gpu: 0, memory: 100, streams: 1 },
            ],
            ..InstanceConfig::default()
        };
        let cpu = Arc::new(CpuDevice::new("/job:t/device:CPU:0", 1024, None));

        let manager = LaneManager::new(&config, cpu);

        let bases: Vec<u32> = manager.lanes().iter().map(|l| l.base_stream_index()).collect();
        assert_eq!(bases, vec![0, 0, 2]);
        assert_eq!(
            manager.lanes()[2].device().name(),
            "/job:lanekeeper/replica:0/task:0/device:GPU:2"
        );
    }

    #[test]
    fn compatible_cpu_device_is_always_the_same() {
        let manager = manager(&[100]);

        let first = manager.compatible_cpu_device();
        let second = manager.compatible_cpu_device();

        assert!(Arc::ptr_eq(&first, &second));
    }

    // ==================== Grant Tests ====================

    #[tokio::test]
    async fn request_is_granted_when_lane_is_free() {
        let manager = manager(&[100]);

        let leases = manager.request_lanes(layout(60)).await.unwrap();

        assert_eq!(leases.len(), 1);
        assert_eq!(leases[0].reserved(), 60);
        assert_eq!(manager.lanes()[0].available_memory(), 40);
    }

    #[tokio::test]
    async fn dropping_lease_returns_memory() {
        let manager = manager(&[100]);

        let leases = manager.request_lanes(layout(60)).await.unwrap();
        drop(leases);

        assert_eq!(manager.lanes()[0].available_memory(), 100);
    }

    #[tokio::test]
    async fn best_fit_prefers_tightest_lane() {
        let manager = manager(&[100, 50, 80]);

        let leases = manager.request_lanes(layout(40)).await.unwrap();

        assert_eq!(leases[0].lane_id(), 1);
    }

    #[tokio::test]
    async fn multi_entry_layout_uses_distinct_lanes() {
        let manager = manager(&[100, 100]);
        let mut two = LaneLayout::new();
        two.push(10, 0);
        two.push(10, 0);

        let leases = manager.request_lanes(two).await.unwrap();

        assert_ne!(leases[0].lane_id(), leases[1].lane_id());
    }

    #[tokio::test]
    async fn lease_holds_region_in_lane_allocator() {
        let manager = manager(&[1000]);
        let allocator = Arc::clone(manager.lanes()[0].allocator());

        let leases = manager.request_lanes(layout(600)).await.unwrap();

        assert_eq!(leases[0].offset(), 0);
        assert_eq!(allocator.in_use(), 600);
        drop(leases);
        assert_eq!(allocator.in_use(), 0);
    }

    #[tokio::test]
    async fn split_free_memory_falls_back_to_next_lane() {
        let manager = manager(&[100, 200]);
        let a = manager.request_lanes(layout(30)).await.unwrap();
        let _b = manager.request_lanes(layout(40)).await.unwrap();
        let c = manager.request_lanes(layout(30)).await.unwrap();
        assert!([&a, &c].iter().all(|l| l[0].lane_id() == 0));
        drop(a);
        drop(c);

        // lane 0 has 60 bytes free, but in two 30 byte holes
        let leases = manager.request_lanes(layout(50)).await.unwrap();

        assert_eq!(leases[0].lane_id(), 1);
    }

    // ==================== Validation Tests ====================

    #[tokio::test]
    async fn empty_layout_is_invalid() {
        let manager = manager(&[100]);

        let result = manager.request_lanes(LaneLayout::new()).await;

        assert!(matches!(result, Err(LaneError::InvalidLayout(_))));
    }

    #[tokio::test]
    async fn persistent_above_limit_is_invalid() {
        let manager = manager(&[100]);
        let mut bad = LaneLayout::new();
        bad.push(10, 20);

        let result = manager.request_lanes(bad).await;

        assert!(matches!(result, Err(LaneError::InvalidLayout(_))));
    }

    #[tokio::test]
    async fn oversized_request_fails_immediately() {
        let manager = manager(&[100, 50]);

        let result = manager.request_lanes(layout(101)).await;

        assert!(matches!(result, Err(LaneError::Unsatisfiable(_))));
        assert_eq!(manager.pending_requests(), 0);
    }

    #[tokio::test]
    async fn too_many_entries_fail_immediately() {
        let manager = manager(&[100]);
        let mut two = LaneLayout::new();
        two.push(10, 0);
        two.push(10, 0);

        let result = manager.request_lanes(two).await;

        assert!(matches!(result, Err(LaneError::Unsatisfiable(_))));
    }

    // ==================== Queueing Tests ====================

    #[test]
    fn request_waits_until_memory_is_released() {
        let manager = manager(&[100]);

        let mut first = task::spawn(manager.request_lanes(layout(80)));
        let held = assert_ready_ok!(first.poll());

        let mut second = task::spawn(manager.request_lanes(layout(50)));
        assert_pending!(second.poll());
        assert_eq!(manager.pending_requests(), 1);

        drop(held);

        assert!(second.is_woken());
        let granted = assert_ready_ok!(second.poll());
        assert_eq!(granted[0].reserved(), 50);
        assert_eq!(manager.pending_requests(), 0);
    }

    #[test]
    fn request_waits_for_contiguous_region() {
        let manager = manager(&[100]);
        let a = manager_grant(&manager, 30);
        let b = manager_grant(&manager, 40);
        let c = manager_grant(&manager, 30);
        drop(a);
        drop(c);

        let mut waiter = task::spawn(manager.request_lanes(layout(50)));
        assert_pending!(waiter.poll());
        assert_eq!(manager.lanes()[0].available_memory(), 60);

        drop(b);

        let granted = assert_ready_ok!(waiter.poll());
        assert_eq!(granted[0].offset(), 0);
    }

    #[test]
    fn abandoned_request_is_pruned() {
        let manager = manager(&[100]);
        let held = manager_grant(&manager, 100);

        let mut waiter = task::spawn(manager.request_lanes(layout(10)));
        assert_pending!(waiter.poll());
        drop(waiter);

        assert_eq!(manager.pending_requests(), 0);
        drop(held);
        assert_eq!(manager.lanes()[0].available_memory(), 100);
    }

    #[test]
    fn bypass_limit_stops_overtaking() {
        let manager = manager_with(
            &[100],
            SchedulerConfig {
                max_bypass: 1,
                wait_timeout_ms: None,
            },
        );
        let held = manager_grant(&manager, 60);

        let mut large = task::spawn(manager.request_lanes(layout(80)));
        assert_pending!(large.poll());

        // first small request overtakes the large one
        let mut small = task::spawn(manager.request_lanes(layout(20)));
        let small_lease = assert_ready_ok!(small.poll());

        // the large request has been bypassed once, nothing else may pass it
        let mut blocked = task::spawn(manager.request_lanes(layout(10)));
        assert_pending!(blocked.poll());

        drop(held);
        drop(small_lease);

        let large_lease = assert_ready_ok!(large.poll());
        assert_eq!(large_lease[0].reserved(), 80);
        let late = assert_ready_ok!(blocked.poll());
        assert_eq!(late[0].reserved(), 10);
    }

    #[tokio::test]
    async fn wait_timeout_fails_request() {
        let manager = manager_with(
            &[100],
            SchedulerConfig {
                max_bypass: 8,
                wait_timeout_ms: Some(50),
            },
        );
        let _held = manager.request_lanes(layout(100)).await.unwrap();

        let result = manager.request_lanes(layout(10)).await;

        assert_eq!(result.unwrap_err(), LaneError::Timeout { waited_ms: 50 });
        assert_eq!(manager.pending_requests(), 0);
    }

    #[test]
    fn shutdown_fails_queued_requests() {
        let manager = manager(&[100]);
        let _held = manager_grant(&manager, 100);

        let mut waiter = task::spawn(manager.request_lanes(layout(10)));
        assert_pending!(waiter.poll());

        manager.shutdown();

        assert!(waiter.is_woken());
        let result = tokio_test::assert_ready!(waiter.poll());
        assert_eq!(result.unwrap_err(), LaneError::ManagerClosed);
    }

    fn manager_grant(manager: &LaneManager, limit: u64) -> Vec<LaneLease> {
        let mut request = task::spawn(manager.request_lanes(layout(limit)));
        assert_ready_ok!(request.poll())
    }
}
