//! In-memory EventBus implementation
//!
//! MemoryEventBus stores events in a Vec for replay and uses a broadcast
//! channel for live subscribers.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::{RwLock, broadcast};

use super::InstanceEvent;
use super::bus::{EventBus, EventSeq};

/// Default broadcast channel capacity
pub const DEFAULT_CAPACITY: usize = 256;

/// In-memory implementation of EventBus
///
/// Uses a Vec for historical storage (enabling replay) and a broadcast
/// channel for live subscribers.
pub struct MemoryEventBus {
    events: RwLock<Vec<(EventSeq, InstanceEvent)>>,
    next_seq: AtomicU64,
    tx: broadcast::Sender<(EventSeq, InstanceEvent)>,
}

impl MemoryEventBus {
    /// Create a new MemoryEventBus with the given broadcast channel capacity
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            events: RwLock::new(Vec::new()),
            next_seq: AtomicU64::new(0),
            tx,
        }
    }
}

impl Default for MemoryEventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[async_trait]
impl EventBus for MemoryEventBus {
    async fn publish(&self, event: InstanceEvent) -> EventSeq {
        // hold the write lock while numbering so stored order matches seq order
        let mut events = self.events.write().await;
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        events.push((seq, event.clone()));
        drop(events);

        // no receivers is fine
        let _ = self.tx.send((seq, event));

        seq
    }

    fn subscribe(&self) -> broadcast::Receiver<(EventSeq, InstanceEvent)> {
        self.tx.subscribe()
    }

    async fn events_from(&self, seq: EventSeq) -> Vec<(EventSeq, InstanceEvent)> {
        self.events
            .read()
            .await
            .iter()
            .filter(|(s, _)| *s >= seq)
            .cloned()
            .collect()
    }

    async fn session_events(&self, session_id: &str) -> Vec<(EventSeq, InstanceEvent)> {
        self.events
            .read()
            .await
            .iter()
            .filter(|(_, event)| event.session_id() == Some(session_id))
            .cloned()
            .collect()
    }

    fn current_seq(&self) -> EventSeq {
        self.next_seq.load(Ordering::SeqCst)
    }
}
