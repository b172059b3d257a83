//! Error types for lanekeeper-core

use thiserror::Error;

/// Top-level error type for lanekeeper-core
#[derive(Error, Debug)]
pub enum LanekeeperError {
    #[error("Admission error: {0}")]
    Admission(#[from] AdmissionError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Lane error: {0}")]
    Lane(#[from] LaneError),

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Result alias used across the crate
pub type LanekeeperResult<T> = Result<T, LanekeeperError>;

/// Errors raised while admitting a new session
#[derive(Error, Debug)]
pub enum AdmissionError {
    #[error("Rejected input: {0}")]
    RejectedInput(#[from] GraphError),

    #[error("Backend engine interrupted")]
    EngineUnavailable,

    #[error("Error when inserting session {0}")]
    RegistrationConflict(String),

    #[error("Lane request failed: {0}")]
    Lane(#[from] LaneError),

    #[error("Internal admission error: {0}")]
    Internal(String),
}

/// Errors from the session registry
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Session {0} is not found. Possibly, this instance has restarted.")]
    NotFound(String),

    #[error("Session {0} already exists")]
    AlreadyExists(String),
}

/// Errors related to a single session
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Session {0} is closing and accepts no new tasks")]
    Closed(String),

    #[error("Failed to close session {handle}: {source}")]
    CloseFailed {
        handle: String,
        #[source]
        source: EngineError,
    },
}

impl From<RegistryError> for SessionError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound(handle) | RegistryError::AlreadyExists(handle) => {
                SessionError::NotFound(handle)
            }
        }
    }
}

/// Errors from the lane manager
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LaneError {
    #[error("Invalid lane layout: {0}")]
    InvalidLayout(String),

    #[error("Lane layout can never be satisfied: {0}")]
    Unsatisfiable(String),

    #[error("Timed out after {waited_ms}ms waiting for lanes")]
    Timeout { waited_ms: u64 },

    #[error("Lane manager is shut down")]
    ManagerClosed,
}

/// Errors from syntactic graph validation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("Graph has no nodes")]
    Empty,

    #[error("Node '{0}' has an illegal name")]
    InvalidNodeName(String),

    #[error("Node '{0}' has no op")]
    MissingOp(String),

    #[error("Duplicate node name '{0}'")]
    DuplicateNode(String),

    #[error("Node '{node}' has malformed input '{input}'")]
    MalformedInput { node: String, input: String },

    #[error("Node '{node}' references unknown node '{input}'")]
    UnknownInput { node: String, input: String },
}

/// Errors from devices and their allocators
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("Allocator {allocator} cannot satisfy {requested} bytes ({available} available)")]
    OutOfMemory {
        allocator: String,
        requested: u64,
        available: u64,
    },

    #[error("Allocator {allocator} has no allocation at offset {offset:#x}")]
    UnknownAllocation { allocator: String, offset: u64 },

    #[error("Cannot find device for {0}")]
    NotFound(String),
}

/// Errors reported by an execution engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Execution engine is shut down")]
    ShutDown,

    #[error("Engine failed to finish context {context}: {message}")]
    FinishFailed { context: u64, message: String },
}

/// Errors in instance configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
}
