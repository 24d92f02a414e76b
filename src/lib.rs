// Re-export from sub-crates
pub use nixon_control::{Collaborators, ControlError, Controller, RecordingSession, StopReason};
pub use nixon_core::{
    APP_NAME, APP_NAME_PRETTY, Branch, ConfigManager, DEFAULT_LOG_LEVEL, DiskMonitor, LOG_ENV,
    LogSink, MemoryStore, Notification, PipelineState, Recording, RecordingId, Settings,
    SharedSettings, StatusSnapshot, StatvfsMonitor,
};
pub use nixon_graph::{EngineEvent, GraphHandle, MediaEngine, SimEngine, Topology};

// App-specific modules
pub mod alert;
pub mod command;

// Version from this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
