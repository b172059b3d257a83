//! Mock engine for testing
//!
//! MockEngine behaves like [`LocalEngine`] but lets tests script failures
//! when contexts are finished.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use super::{ExecutionContext, ExecutionEngine, LocalEngine};
use crate::error::EngineError;

/// Engine with scripted finish failures
///
/// Queue failures with `queue_finish_failure()`; each `finish_context()`
/// consumes one. The context is dropped either way.
#[derive(Default)]
pub struct MockEngine {
    inner: LocalEngine,
    failures: Mutex<VecDeque<String>>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `finish_context()` fail with `message`
    pub fn queue_finish_failure(&self, message: impl Into<String>) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(message.into());
    }

    pub fn queued_failure_count(&self) -> usize {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// The wrapped engine, for shutdown and interrupts
    pub fn local(&self) -> &LocalEngine {
        &self.inner
    }
}

impl ExecutionEngine for MockEngine {
    fn make_context(&self) -> Option<ExecutionContext> {
        self.inner.make_context()
    }

    fn finish_context(&self, context: ExecutionContext) -> Result<(), EngineError> {
        let failure = self
            .failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        let id = self.inner.retire(context);
        match failure {
            Some(message) => Err(EngineError::FinishFailed {
                context: id,
                message,
            }),
            None => Ok(()),
        }
    }
}
