//! Pipeline and branch state types.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use thiserror::Error;

/// Lifecycle state of the audio graph.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineState {
    /// No graph exists
    #[default]
    Stopped,
    /// A graph is being built and set playing
    Starting,
    /// The graph is live
    Running,
    /// The graph is being torn down
    Stopping,
    /// Torn down after a fault, waiting for the next restart attempt
    Restarting,
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Stopped => "stopped",
            PipelineState::Starting => "starting",
            PipelineState::Running => "running",
            PipelineState::Stopping => "stopping",
            PipelineState::Restarting => "restarting",
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One path of the audio graph.
///
/// `VadMonitor` and `Preroll` sit on the main chain and are always present
/// while the graph runs. The other three hang off the split point behind a
/// valve and only exist when their settings enable them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Branch {
    VadMonitor,
    Preroll,
    Recording,
    StreamA,
    StreamB,
}

impl Branch {
    pub const ALL: [Branch; 5] = [
        Branch::VadMonitor,
        Branch::Preroll,
        Branch::Recording,
        Branch::StreamA,
        Branch::StreamB,
    ];

    /// Branches that sit behind a valve.
    pub const GATED: [Branch; 3] = [Branch::Recording, Branch::StreamA, Branch::StreamB];

    /// Identifier used by the API layer.
    pub fn id(&self) -> &'static str {
        match self {
            Branch::VadMonitor => "vad",
            Branch::Preroll => "preroll",
            Branch::Recording => "recording",
            Branch::StreamA => "streamA",
            Branch::StreamB => "streamB",
        }
    }

    /// Prefix used for element names inside the graph.
    pub fn element_prefix(&self) -> &'static str {
        match self {
            Branch::VadMonitor => "vad",
            Branch::Preroll => "preroll",
            Branch::Recording => "recording",
            Branch::StreamA => "stream-a",
            Branch::StreamB => "stream-b",
        }
    }

    pub fn is_gated(&self) -> bool {
        Self::GATED.contains(self)
    }

    /// Name of the valve element gating this branch.
    pub fn valve_name(&self) -> Option<String> {
        self.is_gated()
            .then(|| format!("{}-valve", self.element_prefix()))
    }

    /// Name of the terminal element of this branch.
    pub fn sink_name(&self) -> Option<String> {
        self.is_gated()
            .then(|| format!("{}-sink", self.element_prefix()))
    }
}

impl fmt::Display for Branch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown branch: {0}")]
pub struct BranchParseError(pub String);

impl FromStr for Branch {
    type Err = BranchParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .collect::<String>()
            .to_ascii_lowercase();

        match normalized.as_str() {
            "vad" | "vadmonitor" => Ok(Branch::VadMonitor),
            "preroll" => Ok(Branch::Preroll),
            "recording" | "record" => Ok(Branch::Recording),
            "streama" | "srt" => Ok(Branch::StreamA),
            "streamb" | "icecast" => Ok(Branch::StreamB),
            _ => Err(BranchParseError(s.to_string())),
        }
    }
}
