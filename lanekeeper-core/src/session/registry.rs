//! Concurrent session registry
//!
//! Maps handles to live sessions. Every operation takes one short exclusive
//! lock. Extraction is the single point that decides a session is being
//! torn down: whoever extracts a handle owns its teardown, and everyone
//! after sees `NotFound`.
//!
//! A std mutex is used because interrupt callbacks run synchronously and
//! must be able to extract without a runtime.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::error;

use super::state::{Session, SessionHandle};
use crate::error::RegistryError;

pub struct SessionRegistry<S = Session> {
    sessions: Mutex<HashMap<SessionHandle, Arc<S>>>,
}

impl<S> SessionRegistry<S> {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SessionHandle, Arc<S>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `session` under `handle`
    ///
    /// On conflict the existing entry is kept and `session` is not stored.
    pub fn insert(&self, handle: SessionHandle, session: Arc<S>) -> Result<(), RegistryError> {
        match self.lock().entry(handle) {
            Entry::Occupied(entry) => Err(RegistryError::AlreadyExists(entry.key().clone())),
            Entry::Vacant(entry) => {
                entry.insert(session);
                Ok(())
            }
        }
    }

    /// Look up a session without removing it
    pub fn find(&self, handle: &str) -> Result<Arc<S>, RegistryError> {
        let snapshot = {
            let sessions = self.lock();
            if let Some(session) = sessions.get(handle) {
                return Ok(Arc::clone(session));
            }
            sessions
                .iter()
                .map(|(h, s)| format!("{h} -> {:p}", Arc::as_ptr(s)))
                .collect::<Vec<_>>()
        };
        error!(
            handle,
            known = snapshot.len(),
            sessions = ?snapshot,
            "Session not found, dumping registered sessions"
        );
        Err(RegistryError::NotFound(handle.to_string()))
    }

    /// Remove and return a session; a handle can be extracted only once
    pub fn extract(&self, handle: &str) -> Result<Arc<S>, RegistryError> {
        self.lock()
            .remove(handle)
            .ok_or_else(|| RegistryError::NotFound(handle.to_string()))
    }

    /// Remove every session at once
    pub fn drain_all(&self) -> Vec<Arc<S>> {
        self.lock().drain().map(|(_, session)| session).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn handles(&self) -> Vec<SessionHandle> {
        self.lock().keys().cloned().collect()
    }
}

impl<S> Default for SessionRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}
