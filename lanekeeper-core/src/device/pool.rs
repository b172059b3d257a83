//! Reusable object pool and per-task device surrogates
//!
//! Every scheduled unit of work borrows one [`PerTaskDevice`] per device in
//! its session's device set. Surrogates are handed back to the owning
//! device's pool when the task finishes instead of being freed, so the hot
//! path does not allocate.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use super::{AllocatorAttributes, Device};
use super::allocator::Allocator;
use crate::lane::LaneId;

/// Default number of idle objects a pool keeps around
pub const DEFAULT_MAX_IDLE: usize = 64;

/// Objects that can be recycled by an [`ObjectPool`]
pub trait Poolable: Default + Send {
    /// Clear per-use state before the object goes back to the pool
    fn reset(&mut self);
}

struct PoolInner<T> {
    idle: Mutex<Vec<T>>,
    max_idle: usize,
    created: AtomicUsize,
}

impl<T> PoolInner<T> {
    fn idle(&self) -> MutexGuard<'_, Vec<T>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Pool of reusable objects
///
/// Dropping the pool does not invalidate outstanding [`Pooled`] values;
/// they are simply destroyed instead of recycled when released.
pub struct ObjectPool<T: Poolable> {
    inner: Arc<PoolInner<T>>,
}

impl<T: Poolable> ObjectPool<T> {
    pub fn new() -> Self {
        Self::with_max_idle(DEFAULT_MAX_IDLE)
    }

    pub fn with_max_idle(max_idle: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                idle: Mutex::new(Vec::new()),
                max_idle,
                created: AtomicUsize::new(0),
            }),
        }
    }

    /// Take an idle object, or create a fresh one when none is idle
    pub fn acquire(&self) -> Pooled<T> {
        let recycled = self.inner.idle().pop();
        let value = recycled.unwrap_or_else(|| {
            self.inner.created.fetch_add(1, Ordering::Relaxed);
            T::default()
        });
        Pooled {
            value,
            pool: Arc::downgrade(&self.inner),
        }
    }

    /// Objects currently waiting for reuse
    pub fn idle(&self) -> usize {
        self.inner.idle().len()
    }

    /// Objects ever created by this pool
    pub fn created(&self) -> usize {
        self.inner.created.load(Ordering::Relaxed)
    }
}

impl<T: Poolable> Default for ObjectPool<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// An object borrowed from an [`ObjectPool`]
pub struct Pooled<T: Poolable> {
    value: T,
    pool: Weak<PoolInner<T>>,
}

impl<T: Poolable> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T: Poolable> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

impl<T: Poolable> Drop for Pooled<T> {
    fn drop(&mut self) {
        let mut value = std::mem::take(&mut self.value);
        value.reset();
        if let Some(pool) = self.pool.upgrade() {
            let mut idle = pool.idle();
            if idle.len() < pool.max_idle {
                idle.push(value);
            }
        }
    }
}

/// Scheduling information attached to a per-task device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceContext {
    /// Session the task belongs to
    pub session: String,
    /// Lane the session runs on, if any
    pub lane_id: Option<LaneId>,
    /// Sequence number of the task within the session
    pub task_seq: u64,
}

/// Per-task view of a device, bound to one task's resource context
#[derive(Default)]
pub struct PerTaskDevice {
    base: Option<Arc<dyn Device>>,
    resource_context: Option<ResourceContext>,
}

impl PerTaskDevice {
    /// Device this surrogate stands in for
    pub fn base(&self) -> Option<&Arc<dyn Device>> {
        self.base.as_ref()
    }

    pub fn resource_context(&self) -> Option<&ResourceContext> {
        self.resource_context.as_ref()
    }

    /// Allocator of the base device
    pub fn allocator(&self, attrs: AllocatorAttributes) -> Option<Arc<dyn Allocator>> {
        self.base.as_ref().map(|base| base.allocator(attrs))
    }

    fn bind(&mut self, base: Arc<dyn Device>, rctx: ResourceContext) {
        self.base = Some(base);
        self.resource_context = Some(rctx);
    }
}

impl Poolable for PerTaskDevice {
    fn reset(&mut self) {
        self.base = None;
        self.resource_context = None;
    }
}

impl fmt::Debug for PerTaskDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PerTaskDevice")
            .field("base", &self.base.as_ref().map(|d| d.name().to_string()))
            .field("resource_context", &self.resource_context)
            .finish()
    }
}

impl ObjectPool<PerTaskDevice> {
    /// Borrow a surrogate bound to `owner` and `rctx`
    pub fn acquire_for(&self, owner: Arc<dyn Device>, rctx: ResourceContext) -> Pooled<PerTaskDevice> {
        let mut device = self.acquire();
        device.bind(owner, rctx);
        device
    }
}
