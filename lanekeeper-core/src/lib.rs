//! lanekeeper-core: GPU lane admission and session scheduling
//!
//! This crate multiplexes a small set of GPU "lanes" across many
//! independently submitted sessions:
//!
//! - **Demand extraction** - [`ResourceDemand`] turns a session's resource hints into a lane request
//! - **Lane scheduling** - [`LaneManager`] grants lanes asynchronously and queues what does not fit
//! - **Sessions** - [`Session`] and [`SessionRegistry`] track admitted work until it is closed
//! - **Admission** - [`Instance`] drives create, close, interrupt and reset end to end
//! - **Event system** - [`EventBus`] trait and [`MemoryEventBus`] for lifecycle events
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use lanekeeper_core::{
//!     CreateSessionRequest, GraphDef, Instance, InstanceConfig, LocalEngine, MemoryEventBus,
//! };
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let instance = Instance::new(
//!         InstanceConfig::default(),
//!         Arc::new(LocalEngine::new()),
//!         Arc::new(MemoryEventBus::default()),
//!     )?;
//!
//!     let response = instance
//!         .create_session(CreateSessionRequest {
//!             graph_def: GraphDef::linear(["Const", "Identity"]),
//!             ..Default::default()
//!         })
//!         .await?;
//!     println!("Admitted {}", response.session_handle);
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! CreateSession ─► validate ─► ResourceDemand ─► LaneManager::request_lanes (await)
//!                                                        │
//!                    SessionRegistry ◄─ Session ◄─ DeviceSet (CPU + lane devices)
//!                          │
//! CloseSession / interrupt ┴─► extract ─► close ─► LaneLease dropped ─► lane memory back
//! ```

pub mod config;
pub mod demand;
pub mod device;
pub mod engine;
pub mod error;
pub mod events;
pub mod graph;
pub mod instance;
pub mod lane;
pub mod session;

// Re-export key types for convenience
pub use config::{CpuConfig, DemandConfig, InstanceConfig, LaneConfig, SchedulerConfig};
pub use demand::{ResourceDemand, ResourceMap};
pub use device::{
    Allocator, AllocatorAttributes, CpuDevice, Device, DeviceContainer, DeviceKind, DeviceSpec,
    DiagnosticsProvider, LaneDevice,
};
pub use engine::{ExecutionContext, ExecutionEngine, InterruptHandle, LocalEngine, MockEngine};
pub use error::{
    AdmissionError, ConfigError, DeviceError, EngineError, GraphError, LaneError,
    LanekeeperError, LanekeeperResult, RegistryError, SessionError,
};
pub use events::{EventBus, EventSeq, InstanceEvent, MemoryEventBus};
pub use graph::{GraphDef, GraphValidator, NodeDef, SyntaxValidator};
pub use instance::{
    CloseSessionRequest, CreateSessionRequest, CreateSessionResponse, Instance,
    ListDevicesRequest, ListDevicesResponse,
};
pub use lane::{Lane, LaneId, LaneLayout, LaneLease, LaneManager};
pub use session::{DeviceSet, Session, SessionConfig, SessionHandle, SessionRegistry, TaskGuard};
