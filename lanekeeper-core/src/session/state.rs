//! Session state and teardown
//!
//! A session is created only after its lanes were granted and is torn down
//! exactly once, either by a deferred close that waits for in-flight tasks
//! or by a safe close that finishes immediately.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::demand::ResourceMap;
use crate::device::{Device, PerTaskDevice, Pooled, ResourceContext};
use crate::engine::{ExecutionContext, ExecutionEngine, InterruptCallback};
use crate::error::SessionError;
use crate::graph::GraphDef;
use crate::lane::LaneId;

/// Opaque identifier of a registered session
pub type SessionHandle = String;

/// Client-supplied session options
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default)]
    pub name: Option<String>,
    /// Declared resource hints used for admission
    #[serde(default)]
    pub resource_map: ResourceMap,
}

/// Devices bound to a session
///
/// Element 0 is the shared CPU device, followed by one device per lane.
#[derive(Clone)]
pub struct DeviceSet {
    devices: Vec<Arc<dyn Device>>,
}

impl DeviceSet {
    pub fn new(cpu: Arc<dyn Device>, lane_devices: impl IntoIterator<Item = Arc<dyn Device>>) -> Self {
        let mut devices = vec![cpu];
        devices.extend(lane_devices);
        Self { devices }
    }

    pub fn cpu(&self) -> &Arc<dyn Device> {
        &self.devices[0]
    }

    /// Per-lane devices, in lane grant order
    pub fn lane_devices(&self) -> &[Arc<dyn Device>] {
        &self.devices[1..]
    }

    pub fn get(&self, index: usize) -> Option<&Arc<dyn Device>> {
        self.devices.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Device>> {
        self.devices.iter()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

impl fmt::Debug for DeviceSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.devices.iter().map(|d| d.name()))
            .finish()
    }
}

/// An admitted, lane-bound unit of client work
pub struct Session {
    handle: SessionHandle,
    config: SessionConfig,
    graph: GraphDef,
    devices: DeviceSet,
    lane_ids: Vec<LaneId>,
    context: Mutex<Option<ExecutionContext>>,
    engine: Arc<dyn ExecutionEngine>,
    closing: AtomicBool,
    /// Number of in-flight tasks
    tasks: watch::Sender<usize>,
    next_task: AtomicU64,
    created_at: DateTime<Utc>,
}

impl Session {
    pub fn new(
        handle: SessionHandle,
        config: SessionConfig,
        graph: GraphDef,
        devices: DeviceSet,
        context: ExecutionContext,
        engine: Arc<dyn ExecutionEngine>,
    ) -> Self {
        let lane_ids = context.lanes().iter().map(|lease| lease.lane_id()).collect();
        let (tasks, _) = watch::channel(0);
        Self {
            handle,
            config,
            graph,
            devices,
            lane_ids,
            context: Mutex::new(Some(context)),
            engine,
            closing: AtomicBool::new(false),
            tasks,
            next_task: AtomicU64::new(0),
            created_at: Utc::now(),
        }
    }

    pub fn handle(&self) -> &str {
        &self.handle
    }

    pub fn name(&self) -> Option<&str> {
        self.config.name.as_deref()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn graph(&self) -> &GraphDef {
        &self.graph
    }

    pub fn devices(&self) -> &DeviceSet {
        &self.devices
    }

    /// Lanes the session holds, in grant order
    pub fn lane_ids(&self) -> &[LaneId] {
        &self.lane_ids
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Whether the execution context has been finished
    pub fn is_closed(&self) -> bool {
        self.context
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    pub fn in_flight_tasks(&self) -> usize {
        *self.tasks.borrow()
    }

    /// Start a unit of work on this session
    ///
    /// Borrows one per-task device from every device in the set. Deferred
    /// close waits until the returned guard is dropped.
    pub fn begin_task(self: &Arc<Self>) -> Result<TaskGuard, SessionError> {
        // count first so a concurrent defer_close cannot miss this task
        self.tasks.send_modify(|n| *n += 1);
        if self.is_closing() {
            self.tasks.send_modify(|n| *n -= 1);
            return Err(SessionError::Closed(self.handle.clone()));
        }

        let seq = self.next_task.fetch_add(1, Ordering::SeqCst);
        let lane_id = self.lane_ids.first().copied();
        let devices = self
            .devices
            .iter()
            .map(|device| {
                Arc::clone(device).create_per_task_device(ResourceContext {
                    session: self.handle.clone(),
                    lane_id,
                    task_seq: seq,
                })
            })
            .collect();

        Ok(TaskGuard {
            session: Arc::clone(self),
            seq,
            devices,
        })
    }

    /// Install the callback the engine fires to interrupt this session
    ///
    /// Returns false once the session's context has been finished.
    pub fn set_interrupt_callback(&self, callback: InterruptCallback) -> bool {
        let context = self.context.lock().unwrap_or_else(PoisonError::into_inner);
        match context.as_ref() {
            Some(context) => {
                context.set_interrupt_callback(callback);
                true
            }
            None => false,
        }
    }

    /// Close once every in-flight task has finished
    ///
    /// New tasks are refused from the moment this is called.
    pub async fn defer_close(&self) -> Result<(), SessionError> {
        self.closing.store(true, Ordering::SeqCst);
        let mut tasks = self.tasks.subscribe();
        let in_flight = *tasks.borrow_and_update();
        if in_flight > 0 {
            debug!(session = %self.handle, in_flight, "Waiting for tasks before closing");
        }
        // the sender lives in self, so this only returns once the count is zero
        let _ = tasks.wait_for(|n| *n == 0).await;
        self.finish()
    }

    /// Close immediately, without waiting for in-flight tasks
    pub fn safe_close(&self) -> Result<(), SessionError> {
        self.closing.store(true, Ordering::SeqCst);
        self.finish()
    }

    fn finish(&self) -> Result<(), SessionError> {
        let context = self
            .context
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(context) = context else {
            return Ok(());
        };
        debug!(session = %self.handle, context_id = context.id(), "Finishing execution context");
        self.engine
            .finish_context(context)
            .map_err(|source| SessionError::CloseFailed {
                handle: self.handle.clone(),
                source,
            })
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            warn!(session = %self.handle, error = %e, "Failed to finish dropped session");
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("handle", &self.handle)
            .field("name", &self.config.name)
            .field("devices", &self.devices)
            .field("lane_ids", &self.lane_ids)
            .field("closing", &self.is_closing())
            .finish()
    }
}

/// One in-flight unit of work
///
/// Holds the per-task devices; they go back to their pools, and the
/// session's in-flight count drops, when the guard is dropped.
pub struct TaskGuard {
    session: Arc<Session>,
    seq: u64,
    devices: Vec<Pooled<PerTaskDevice>>,
}

impl TaskGuard {
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn devices(&self) -> &[Pooled<PerTaskDevice>] {
        &self.devices
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.devices.clear();
        self.session.tasks.send_modify(|n| *n -= 1);
    }
}
