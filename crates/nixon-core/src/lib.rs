//! Core types and configuration for nixon.
//!
//! This crate holds everything the control plane shares with its
//! collaborators: the settings snapshot, the branch and pipeline state
//! types, status snapshots and the recording store contract. Nothing in
//! here talks to the media engine.

mod config;
mod disk;
mod state;
mod status;
mod store;

pub use config::{
    AudioSettings, AutoRecordSettings, ConfigManager, IcecastSettings, RecordingSettings,
    RestartSettings, Settings, SettingsProvider, SharedSettings, SrtMode, SrtSettings,
    StreamOutput, VadSettings,
};
pub use disk::{DiskMonitor, StatvfsMonitor, usage_percent};
pub use state::{Branch, BranchParseError, PipelineState};
pub use status::{LevelReading, LogSink, Notification, StatusSink, StatusSnapshot};
pub use store::{Finalized, MemoryStore, Recording, RecordingId, RecordingStore, StoreError};

/// Application name
pub const APP_NAME: &str = "nixon";

/// Pretty application name for display
pub const APP_NAME_PRETTY: &str = "Nixon";

/// Default log level
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Environment variable holding the log filter
pub const LOG_ENV: &str = "NIXON_LOG";
