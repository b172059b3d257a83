//! Execution engine abstraction
//!
//! The engine runs admitted graphs. The admission path only needs a small
//! slice of it: creating an [`ExecutionContext`] per session, tagging it
//! with scheduling hints, and finishing it when the session closes.

pub mod local;
pub mod mock;

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use crate::error::EngineError;
use crate::lane::{LaneId, LaneLease};

pub use local::LocalEngine;
pub use mock::MockEngine;

/// Callback run when the engine forcibly interrupts a session
pub type InterruptCallback = Box<dyn FnOnce() + Send + 'static>;

/// Backend that owns execution contexts
pub trait ExecutionEngine: Send + Sync {
    /// Create a context for a new session, or `None` while shutting down
    fn make_context(&self) -> Option<ExecutionContext>;

    /// Finish a context; the context and everything it holds is dropped
    /// whether or not finishing succeeds
    fn finish_context(&self, context: ExecutionContext) -> Result<(), EngineError>;
}

struct ContextShared {
    interrupt: Mutex<Option<InterruptCallback>>,
}

/// Per-session handle into the engine
///
/// Holds the session's [`LaneLease`]s, so lane memory stays reserved
/// exactly as long as the context lives.
pub struct ExecutionContext {
    id: u64,
    exclusive: bool,
    lane_id: Option<LaneId>,
    expected_running_time_ms: u64,
    lanes: Vec<LaneLease>,
    shared: Arc<ContextShared>,
}

impl ExecutionContext {
    /// New contexts start in exclusive mode with no lane
    pub fn new(id: u64) -> Self {
        Self {
            id,
            exclusive: true,
            lane_id: None,
            expected_running_time_ms: 0,
            lanes: Vec::new(),
            shared: Arc::new(ContextShared {
                interrupt: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Allow the context to share its lane with other sessions
    pub fn drop_exclusive_mode(&mut self) {
        self.exclusive = false;
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    pub fn set_expected_running_time(&mut self, ms: u64) {
        self.expected_running_time_ms = ms;
    }

    pub fn expected_running_time(&self) -> u64 {
        self.expected_running_time_ms
    }

    pub fn set_lane_id(&mut self, lane_id: LaneId) {
        self.lane_id = Some(lane_id);
    }

    pub fn lane_id(&self) -> Option<LaneId> {
        self.lane_id
    }

    /// Pin lane ownership to this context
    pub fn set_lanes(&mut self, lanes: Vec<LaneLease>) {
        self.lanes = lanes;
    }

    pub fn lanes(&self) -> &[LaneLease] {
        &self.lanes
    }

    /// Install the callback run on forced interruption, replacing any
    /// previous one
    pub fn set_interrupt_callback(&self, callback: InterruptCallback) {
        *self
            .shared
            .interrupt
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(callback);
    }

    /// Handle the engine keeps to interrupt this context later
    pub fn interrupt_handle(&self) -> InterruptHandle {
        InterruptHandle {
            context_id: self.id,
            shared: Arc::downgrade(&self.shared),
        }
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("id", &self.id)
            .field("exclusive", &self.exclusive)
            .field("lane_id", &self.lane_id)
            .field("expected_running_time_ms", &self.expected_running_time_ms)
            .field("lanes", &self.lanes)
            .finish()
    }
}

/// Weak handle that fires a context's interrupt callback
#[derive(Clone)]
pub struct InterruptHandle {
    context_id: u64,
    shared: Weak<ContextShared>,
}

impl InterruptHandle {
    pub fn context_id(&self) -> u64 {
        self.context_id
    }

    /// Run the interrupt callback
    ///
    /// Returns `false` when the context is gone or the callback already ran.
    /// The callback runs without any lock held.
    pub fn interrupt(&self) -> bool {
        let Some(shared) = self.shared.upgrade() else {
            return false;
        };
        let callback = shared
            .interrupt
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match callback {
            Some(callback) => {
                callback();
                true
            }
            None => false,
        }
    }
}

impl fmt::Debug for InterruptHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterruptHandle")
            .field("context_id", &self.context_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn new_context_is_exclusive() {
        let mut ctx = ExecutionContext::new(1);
        assert!(ctx.is_exclusive());

        ctx.drop_exclusive_mode();
        ctx.set_lane_id(3);
        ctx.set_expected_running_time(5000);

        assert!(!ctx.is_exclusive());
        assert_eq!(ctx.lane_id(), Some(3));
        assert_eq!(ctx.expected_running_time(), 5000);
    }

    #[test]
    fn interrupt_runs_callback_once() {
        let ctx = ExecutionContext::new(1);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        ctx.set_interrupt_callback(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let handle = ctx.interrupt_handle();

        assert!(handle.interrupt());
        assert!(!handle.interrupt());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn interrupt_after_context_dropped_is_noop() {
        let ctx = ExecutionContext::new(1);
        ctx.set_interrupt_callback(Box::new(|| panic!("must not run")));
        let handle = ctx.interrupt_handle();

        drop(ctx);

        assert!(!handle.interrupt());
    }

    #[test]
    fn interrupt_without_callback_reports_false() {
        let ctx = ExecutionContext::new(9);
        let handle = ctx.interrupt_handle();

        assert!(!handle.interrupt());
        assert_eq!(handle.context_id(), 9);
    }
}
