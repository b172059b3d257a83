//! EventBus trait definition
//!
//! Instance lifecycle events are published here so observers can follow
//! admissions and teardowns, including ones that joined late.

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::InstanceEvent;

/// Sequence number for events (monotonically increasing)
pub type EventSeq = u64;

/// Event bus for publishing and subscribing to InstanceEvents
///
/// Implementations must support:
/// - Publishing events with sequence numbers
/// - Live subscriptions via broadcast channel
/// - Historical replay for late joiners
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish an event, returns its sequence number
    async fn publish(&self, event: InstanceEvent) -> EventSeq;

    /// Subscribe to all events from now (live stream)
    fn subscribe(&self) -> broadcast::Receiver<(EventSeq, InstanceEvent)>;

    /// Get all events starting from a sequence number (for replay)
    async fn events_from(&self, seq: EventSeq) -> Vec<(EventSeq, InstanceEvent)>;

    /// Get all events for a specific session
    async fn session_events(&self, session_id: &str) -> Vec<(EventSeq, InstanceEvent)>;

    /// Current sequence number (high water mark)
    fn current_seq(&self) -> EventSeq;
}
