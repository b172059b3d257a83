//! Event system for lanekeeper

pub mod bus;
pub mod memory;
pub mod types;

pub use bus::{EventBus, EventSeq};
pub use memory::MemoryEventBus;
pub use types::InstanceEvent;
