//! Audio graph description and media engine contract for nixon.
//!
//! The control plane never executes audio itself. It builds a launch-style
//! description with [`Topology`], hands it to a [`MediaEngine`], and reacts to
//! the [`EngineEvent`]s the engine posts back.

mod sim;
pub mod topology;

use std::fmt;
use std::sync::Arc;

pub use sim::SimEngine;
use thiserror::Error;
pub use topology::{SampleFormat, Topology, TopologyError};

/// Opaque handle to a graph built by an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GraphHandle(pub u64);

impl fmt::Display for GraphHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "graph-{}", self.0)
    }
}

/// Execution state of a graph inside the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphState {
    Null,
    Ready,
    Paused,
    Playing,
}

/// Asynchronous notification posted by the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// Periodic RMS measurement, one value per channel, in dB
    Level { element: String, rms_db: Vec<f64> },
    /// Fatal error inside the graph
    Error {
        source: String,
        message: String,
        debug: Option<String>,
    },
    /// Recoverable problem, informational only
    Warning { source: String, message: String },
    /// The graph ran to completion
    EndOfStream,
    StateChanged { old: GraphState, new: GraphState },
}

impl EngineEvent {
    /// Loudest channel of a level event.
    pub fn peak_rms_db(&self) -> Option<f64> {
        match self {
            EngineEvent::Level { rms_db, .. } => rms_db.iter().copied().reduce(f64::max),
            _ => None,
        }
    }
}

/// Callback receiving engine events. Invoked on the engine's own thread.
pub type EventCallback = Arc<dyn Fn(EngineEvent) + Send + Sync>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to build graph: {0}")]
    Build(String),

    #[error("unknown graph {0}")]
    UnknownGraph(GraphHandle),

    #[error("element not found: {0}")]
    ElementMissing(String),

    #[error("state change to {0:?} failed: {1}")]
    StateChange(GraphState, String),

    #[error("engine failure: {0}")]
    Other(String),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Graph-description interpreter the control plane drives.
///
/// Implementations must deliver events from their own thread and never call
/// a subscribed callback from inside one of these methods: the callback takes
/// the same lock the caller of these methods is holding.
pub trait MediaEngine: Send + Sync {
    /// Parse `description` and instantiate the graph, initially in [`GraphState::Null`].
    fn build_graph(&self, description: &str) -> Result<GraphHandle>;

    fn set_state(&self, graph: GraphHandle, state: GraphState) -> Result<()>;

    /// Open or close the named valve element.
    fn set_valve(&self, graph: GraphHandle, valve: &str, open: bool) -> Result<()>;

    fn set_property(&self, graph: GraphHandle, element: &str, key: &str, value: &str)
    -> Result<()>;

    /// Register the event callback for `graph`, replacing any previous one.
    fn subscribe(&self, graph: GraphHandle, callback: EventCallback) -> Result<()>;

    /// Drop the graph. Unknown handles are ignored.
    fn release(&self, graph: GraphHandle);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peak_rms_uses_loudest_channel() {
        let event = EngineEvent::Level {
            element: topology::VAD_ELEMENT.to_string(),
            rms_db: vec![-62.0, -31.5],
        };
        assert_eq!(event.peak_rms_db(), Some(-31.5));
        assert_eq!(EngineEvent::EndOfStream.peak_rms_db(), None);
    }

    #[test]
    fn test_empty_level_has_no_peak() {
        let event = EngineEvent::Level {
            element: "vad-monitor".to_string(),
            rms_db: vec![],
        };
        assert_eq!(event.peak_rms_db(), None);
    }
}
