//! Error types for the simulation engine

use thiserror::Error;

use crate::types::{HostId, HostState};

/// Engine result type
pub type Result<T> = std::result::Result<T, SimulationError>;

/// Errors that can occur while driving a simulation
#[derive(Error, Debug)]
pub enum SimulationError {
    /// Event scheduled before the current clock value
    #[error(transparent)]
    InvalidScheduling(#[from] boreas_kernel::InvalidScheduling),

    /// Deploy rejected by a host's capacity bookkeeping (recoverable)
    #[error("placement failed: {0}")]
    Placement(#[from] PlacementError),

    /// Flow resolution cannot satisfy the capacity invariant; fatal for the run
    #[error("inconsistent flow state on {host}: {detail}")]
    InconsistentFlowState { host: HostId, detail: String },

    /// A model was given an argument outside its domain
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SimulationError {
    /// Create an invalid-argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create an inconsistent-flow-state error for a host
    pub fn inconsistent_flow(host: HostId, detail: impl Into<String>) -> Self {
        Self::InconsistentFlowState {
            host,
            detail: detail.into(),
        }
    }
}

/// Typed reasons a host can refuse a deploy
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlacementError {
    /// The host is not accepting servers in its current state
    #[error("host is {0:?}, not Active")]
    HostNotActive(HostState),

    /// Not enough free cores for the server's static footprint
    #[error("insufficient cores: need {need}, have {have}")]
    InsufficientCores { need: u32, have: u32 },

    /// Not enough free memory for the server's static footprint
    #[error("insufficient memory: need {need}MB, have {have}MB")]
    InsufficientMemory { need: u64, have: u64 },
}
