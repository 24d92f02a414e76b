//! Control plane for the nixon audio graph.
//!
//! [`Controller`] owns the live graph and serializes everything that mutates
//! it behind one structural lock: public calls from request threads, engine
//! events from the engine's callback thread, and the silence, restart and
//! disk check timers running on the tokio runtime.

mod backoff;
mod broadcast;
mod controller;
mod monitor;
mod session;
mod vad;
mod valves;

#[cfg(test)]
mod testing;

pub use backoff::Backoff;
pub use broadcast::Broadcaster;
pub use controller::{Collaborators, Controller};
pub use monitor::{DISK_CHECK_INTERVAL, DISK_WARN_PERCENT};
use nixon_core::{Branch, PipelineState, RecordingId, StoreError};
use nixon_graph::{EngineError, TopologyError};
pub use session::{RecordingSession, StopReason};
use thiserror::Error;

/// Errors returned by controller operations.
///
/// Engine faults reported through events never show up here; the controller
/// recovers from them itself and reports them through status and logs.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("invalid settings: {0}")]
    Config(#[from] TopologyError),

    #[error("branch {0} is not configured")]
    BranchUnavailable(Branch),

    #[error("pipeline is {0}, not running")]
    NotRunning(PipelineState),

    #[error("graph element missing: {0}")]
    ElementMissing(String),

    #[error("media engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("recording {0} is still active")]
    RecordingActive(RecordingId),
}

/// Result type for controller operations.
pub type Result<T> = std::result::Result<T, ControlError>;
