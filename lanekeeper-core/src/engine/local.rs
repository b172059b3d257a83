//! In-process execution engine
//!
//! LocalEngine keeps track of live contexts so it can interrupt them, and
//! refuses new contexts once shut down. It performs no real execution.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, info};

use super::{ExecutionContext, ExecutionEngine, InterruptHandle};
use crate::error::EngineError;

#[derive(Default)]
pub struct LocalEngine {
    next_id: AtomicU64,
    shutting_down: AtomicBool,
    live: Mutex<HashMap<u64, InterruptHandle>>,
    finished: AtomicU64,
}

impl LocalEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn live(&self) -> MutexGuard<'_, HashMap<u64, InterruptHandle>> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stop handing out contexts; existing contexts are unaffected
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        info!("Execution engine shutting down");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Forcibly interrupt one context
    ///
    /// Returns whether an interrupt callback ran.
    pub fn interrupt(&self, context_id: u64) -> bool {
        let handle = self.live().remove(&context_id);
        match handle {
            Some(handle) => {
                debug!(context_id, "Interrupting context");
                handle.interrupt()
            }
            None => false,
        }
    }

    /// Interrupt every live context, returning how many callbacks ran
    pub fn interrupt_all(&self) -> usize {
        let handles: Vec<InterruptHandle> = self.live().drain().map(|(_, h)| h).collect();
        handles.iter().filter(|handle| handle.interrupt()).count()
    }

    /// Contexts created and not yet finished
    pub fn live_contexts(&self) -> usize {
        self.live().len()
    }

    pub fn finished_contexts(&self) -> u64 {
        self.finished.load(Ordering::SeqCst)
    }

    pub(crate) fn retire(&self, context: ExecutionContext) -> u64 {
        let id = context.id();
        self.live().remove(&id);
        self.finished.fetch_add(1, Ordering::SeqCst);
        drop(context);
        debug!(context_id = id, "Finished context");
        id
    }
}

impl ExecutionEngine for LocalEngine {
    fn make_context(&self) -> Option<ExecutionContext> {
        if self.is_shutting_down() {
            return None;
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let context = ExecutionContext::new(id);
        self.live().insert(id, context.interrupt_handle());
        Some(context)
    }

    fn finish_context(&self, context: ExecutionContext) -> Result<(), EngineError> {
        self.retire(context);
        Ok(())
    }
}
