//! Event type definitions

use serde::{Deserialize, Serialize};

use crate::lane::LaneId;

/// Lifecycle events published by an instance
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InstanceEvent {
    /// A session was admitted and registered
    SessionCreated {
        session_id: String,
        name: Option<String>,
    },

    /// Lane granted to a session during admission
    LaneAssigned {
        session_id: String,
        lane_id: LaneId,
        /// Total lane memory in bytes
        lane_size: u64,
        /// Lane memory still available after the grant
        lane_avail: u64,
        lane_stream: u32,
    },

    /// A session was closed on request
    SessionClosed { session_id: String },

    /// A session was torn down by a forced interrupt
    SessionInterrupted { session_id: String },

    /// Every session was dropped by a reset
    Reset { closed: usize, failed: usize },
}

impl InstanceEvent {
    /// Session this event belongs to, if any
    pub fn session_id(&self) -> Option<&str> {
        match self {
            InstanceEvent::SessionCreated { session_id, .. } => Some(session_id),
            InstanceEvent::LaneAssigned { session_id, .. } => Some(session_id),
            InstanceEvent::SessionClosed { session_id } => Some(session_id),
            InstanceEvent::SessionInterrupted { session_id } => Some(session_id),
            InstanceEvent::Reset { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lane_assigned_serializes_with_type_tag() {
        let event = InstanceEvent::LaneAssigned {
            session_id: "s1".to_string(),
            lane_id: 2,
            lane_size: 100,
            lane_avail: 40,
            lane_stream: 1,
        };

        let json = serde_json::to_string(&event).unwrap();

        assert!(json.contains(r#""type":"lane_assigned""#));
        assert!(json.contains(r#""lane_avail":40"#));
    }

    #[test]
    fn instance_event_roundtrip() {
        let event = InstanceEvent::SessionCreated {
            session_id: "s1".to_string(),
            name: Some("job".to_string()),
        };

        let json = serde_json::to_string(&event).unwrap();
        let parsed: InstanceEvent = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed, event);
    }

    #[test]
    fn reset_has_no_session() {
        let event = InstanceEvent::Reset { closed: 2, failed: 1 };
        assert_eq!(event.session_id(), None);
    }

    #[test]
    fn session_events_expose_session_id() {
        let event = InstanceEvent::SessionInterrupted {
            session_id: "s9".to_string(),
        };
        assert_eq!(event.session_id(), Some("s9"));
    }
}
