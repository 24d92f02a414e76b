//! Status snapshots and the notification sink contract.

use chrono::{DateTime, Local};
use serde::Serialize;
use tracing::{info, warn};

use crate::PipelineState;

/// Immutable copy of the appliance status.
///
/// Snapshots are values: every read hands out a fresh copy and a published
/// snapshot is never mutated afterwards.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub is_recording: bool,
    pub is_streaming_a: bool,
    pub is_streaming_b: bool,
    pub vad_active: bool,
    pub last_vad_time: Option<DateTime<Local>>,
    pub current_recording_filename: Option<String>,
    pub pipeline_state: PipelineState,
    /// Consecutive failed restart attempts since the last fault
    pub restart_attempts: u32,
    /// Used share of the recording volume, once measured
    pub disk_usage_percent: Option<u8>,
}

impl StatusSnapshot {
    /// True when nothing is recording or streaming and VAD is idle.
    pub fn is_quiescent(&self) -> bool {
        !self.is_recording
            && !self.is_streaming_a
            && !self.is_streaming_b
            && !self.vad_active
            && self.current_recording_filename.is_none()
    }
}

/// A level measurement paired with the thresholds it was judged against.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LevelReading {
    pub level_db: f64,
    pub threshold_db: f64,
    pub hysteresis_db: f64,
}

/// Everything the broadcaster hands to the notification transport.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    Status(StatusSnapshot),
    Level(LevelReading),
    Warning { source: String, message: String },
    Error { source: String, message: String },
}

/// Real-time client notification transport.
///
/// `publish` is fire-and-forget. The broadcaster already calls it off the
/// engine thread, but implementations should still avoid blocking.
pub trait StatusSink: Send + Sync {
    fn publish(&self, notification: Notification);
}

impl<F> StatusSink for F
where
    F: Fn(Notification) + Send + Sync,
{
    fn publish(&self, notification: Notification) {
        self(notification)
    }
}

/// Sink that writes notifications to the log. Level readings are dropped.
#[derive(Debug, Default)]
pub struct LogSink;

impl StatusSink for LogSink {
    fn publish(&self, notification: Notification) {
        match notification {
            Notification::Status(status) => info!(
                state = %status.pipeline_state,
                recording = status.is_recording,
                stream_a = status.is_streaming_a,
                stream_b = status.is_streaming_b,
                vad = status.vad_active,
                file = ?status.current_recording_filename,
                disk = ?status.disk_usage_percent,
                "status"
            ),
            Notification::Level(_) => {}
            Notification::Warning { source, message } => warn!(%source, "{}", message),
            Notification::Error { source, message } => warn!(%source, "error: {}", message),
        }
    }
}
