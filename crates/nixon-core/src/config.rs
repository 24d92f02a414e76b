//! Configuration management for nixon.
//!
//! [`Settings`] is the immutable snapshot the control plane reads every time
//! it (re)builds the audio graph. [`ConfigManager`] loads and saves it as
//! TOML; [`SettingsProvider`] is the seam the controller reads through.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use dirs::config_dir;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{APP_NAME, Branch};

/// Full settings snapshot for the appliance.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Settings {
    /// Capture source and format
    #[serde(default)]
    pub audio: AudioSettings,

    /// Recording output branch
    #[serde(default)]
    pub recording: RecordingSettings,

    /// Voice activity detection thresholds
    #[serde(default)]
    pub vad: VadSettings,

    /// Automatic recording and smart split
    #[serde(default)]
    pub auto_record: AutoRecordSettings,

    /// Stream A output
    #[serde(default)]
    pub srt: SrtSettings,

    /// Stream B output
    #[serde(default)]
    pub icecast: IcecastSettings,

    /// Fault recovery policy
    #[serde(default)]
    pub restart: RestartSettings,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct AudioSettings {
    /// Capture device identifier. Empty selects a generated test tone.
    pub device: String,
    pub sample_rate: u32,
    pub bit_depth: u16,
    pub channels: u16,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            device: "default".to_string(),
            sample_rate: 48_000,
            bit_depth: 24,
            channels: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RecordingSettings {
    pub enabled: bool,
    /// Directory recordings are written into
    pub directory: PathBuf,
}

impl Default for RecordingSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            directory: PathBuf::from("./recordings"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct VadSettings {
    /// Levels strictly above this are voice
    pub threshold_db: f64,
    /// Release band below the threshold, reported to meters
    pub hysteresis_db: f64,
}

impl Default for VadSettings {
    fn default() -> Self {
        Self {
            threshold_db: -40.0,
            hysteresis_db: 5.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct AutoRecordSettings {
    pub enabled: bool,
    /// Audio kept ahead of the recording valve, in seconds
    pub preroll_secs: u32,
    pub smart_split_enabled: bool,
    /// Silence needed before an automatic stop, in seconds
    pub smart_split_timeout_secs: u64,
}

impl Default for AutoRecordSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            preroll_secs: 10,
            smart_split_enabled: false,
            smart_split_timeout_secs: 300,
        }
    }
}

impl AutoRecordSettings {
    pub fn smart_split_timeout(&self) -> Duration {
        Duration::from_secs(self.smart_split_timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SrtMode {
    Caller,
    #[default]
    Listener,
}

impl SrtMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SrtMode::Caller => "caller",
            SrtMode::Listener => "listener",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SrtSettings {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub bitrate_kbps: u32,
    pub mode: SrtMode,
    pub latency_ms: u32,
}

impl Default for SrtSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            host: String::new(),
            port: 9000,
            bitrate_kbps: 128,
            mode: SrtMode::Listener,
            latency_ms: 200,
        }
    }
}

impl SrtSettings {
    /// Whether every parameter the SRT sink needs is present.
    pub fn is_complete(&self) -> bool {
        !self.host.is_empty() && self.port != 0 && self.bitrate_kbps != 0
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct IcecastSettings {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub mount: String,
    pub username: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub password: String,
    pub bitrate_kbps: u32,
}

impl Default for IcecastSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "127.0.0.1".to_string(),
            port: 8000,
            mount: "/stream".to_string(),
            username: "source".to_string(),
            password: String::new(),
            bitrate_kbps: 128,
        }
    }
}

impl IcecastSettings {
    /// Whether every parameter the Icecast sink needs is present.
    pub fn is_complete(&self) -> bool {
        !self.host.is_empty() && self.port != 0 && !self.mount.is_empty() && self.bitrate_kbps != 0
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RestartSettings {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Failed attempts before the restart loop raises an alert
    pub alert_after: u32,
}

impl Default for RestartSettings {
    fn default() -> Self {
        Self {
            initial_delay_ms: 2_000,
            max_delay_ms: 60_000,
            alert_after: 10,
        }
    }
}

impl RestartSettings {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms.max(self.initial_delay_ms))
    }
}

/// One of the two streaming outputs. The set is closed: stream A is always
/// SRT and stream B is always Icecast.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamOutput {
    Srt(SrtSettings),
    Icecast(IcecastSettings),
}

impl StreamOutput {
    pub fn branch(&self) -> Branch {
        match self {
            StreamOutput::Srt(_) => Branch::StreamA,
            StreamOutput::Icecast(_) => Branch::StreamB,
        }
    }

    pub fn protocol(&self) -> &'static str {
        match self {
            StreamOutput::Srt(_) => "SRT",
            StreamOutput::Icecast(_) => "Icecast",
        }
    }

    pub fn is_enabled(&self) -> bool {
        match self {
            StreamOutput::Srt(s) => s.enabled,
            StreamOutput::Icecast(s) => s.enabled,
        }
    }

    pub fn is_complete(&self) -> bool {
        match self {
            StreamOutput::Srt(s) => s.is_complete(),
            StreamOutput::Icecast(s) => s.is_complete(),
        }
    }
}

impl Settings {
    /// Both stream outputs in branch order.
    pub fn stream_outputs(&self) -> [StreamOutput; 2] {
        [
            StreamOutput::Srt(self.srt.clone()),
            StreamOutput::Icecast(self.icecast.clone()),
        ]
    }

    /// Whether the settings enable `branch`, ignoring parameter completeness.
    pub fn branch_enabled(&self, branch: Branch) -> bool {
        match branch {
            Branch::VadMonitor | Branch::Preroll => true,
            Branch::Recording => self.recording.enabled,
            Branch::StreamA => self.srt.enabled,
            Branch::StreamB => self.icecast.enabled,
        }
    }

    /// Whether `branch` is enabled and has every parameter it needs.
    pub fn branch_configured(&self, branch: Branch) -> bool {
        match branch {
            Branch::VadMonitor | Branch::Preroll => true,
            Branch::Recording => {
                self.recording.enabled && !self.recording.directory.as_os_str().is_empty()
            }
            Branch::StreamA => self.srt.enabled && self.srt.is_complete(),
            Branch::StreamB => self.icecast.enabled && self.icecast.is_complete(),
        }
    }
}

/// Read-only source of settings snapshots. The controller re-reads before
/// every graph build, so implementations may return different values over time.
pub trait SettingsProvider: Send + Sync {
    fn settings(&self) -> Settings;
}

/// Settings shared between the config loader and the controller.
pub type SharedSettings = Arc<RwLock<Settings>>;

impl SettingsProvider for RwLock<Settings> {
    fn settings(&self) -> Settings {
        self.read().clone()
    }
}

impl SettingsProvider for Settings {
    fn settings(&self) -> Settings {
        self.clone()
    }
}

/// Manages loading and saving configuration files.
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    /// Creates a new ConfigManager with the default configuration directory.
    pub fn new() -> Result<Self> {
        let config_path = Self::default_config_path()?;
        Ok(Self { config_path })
    }

    /// Creates a ConfigManager for an explicit file.
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: path.into(),
        }
    }

    /// Creates a new ConfigManager with a specified configuration directory.
    #[cfg(test)]
    pub fn with_config_dir<P: AsRef<Path>>(dir: P) -> Self {
        let config_path = dir.as_ref().join(format!("{}.toml", APP_NAME));
        Self { config_path }
    }

    /// Returns the default path to the configuration file.
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = config_dir().context("Failed to retrieve configuration directory")?;
        Ok(config_dir.join(APP_NAME).join(format!("{}.toml", APP_NAME)))
    }

    /// Loads the configuration from the config file or returns default.
    pub fn load(&self) -> Result<Settings> {
        if !self.config_path.exists() {
            return Ok(Settings::default());
        }

        let content = fs::read_to_string(&self.config_path)
            .with_context(|| format!("Failed to read config file at {:?}", self.config_path))?;

        let settings: Settings = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file at {:?}", self.config_path))?;

        if settings.icecast.enabled && settings.icecast.password.is_empty() {
            warn!("Icecast is enabled without a password; most servers will refuse the source.");
        }

        Ok(settings)
    }

    /// Saves the configuration to the config file.
    pub fn save(&self, settings: &Settings) -> Result<()> {
        let config_dir = self
            .config_path
            .parent()
            .with_context(|| format!("Failed to get parent directory of {:?}", self.config_path))?;

        fs::create_dir_all(config_dir)
            .with_context(|| format!("Failed to create config directory at {:?}", config_dir))?;

        let serialized =
            toml::to_string_pretty(settings).context("Failed to serialize configuration")?;

        fs::write(&self.config_path, serialized)
            .with_context(|| format!("Failed to write config file at {:?}", self.config_path))?;

        Ok(())
    }

    /// Returns the path to the configuration file.
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.audio.sample_rate, 48_000);
        assert_eq!(settings.audio.bit_depth, 24);
        assert_eq!(settings.vad.threshold_db, -40.0);
        assert_eq!(settings.auto_record.smart_split_timeout(), Duration::from_secs(300));
        assert!(settings.recording.enabled);
        assert!(!settings.srt.enabled);
        assert!(!settings.icecast.enabled);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let settings: Settings = toml::from_str(
            r#"
            [audio]
            sample_rate = 44100

            [srt]
            enabled = true
            host = "10.0.0.2"
            mode = "caller"
            "#,
        )
        .unwrap();

        assert_eq!(settings.audio.sample_rate, 44_100);
        assert_eq!(settings.audio.channels, 2);
        assert_eq!(settings.srt.mode, SrtMode::Caller);
        assert_eq!(settings.srt.port, 9000);
        assert!(settings.branch_configured(Branch::StreamA));
        assert!(!settings.branch_configured(Branch::StreamB));
    }

    #[test]
    fn test_branch_configured_requires_parameters() {
        let mut settings = Settings::default();
        settings.icecast.enabled = true;
        settings.icecast.mount.clear();
        assert!(settings.branch_enabled(Branch::StreamB));
        assert!(!settings.branch_configured(Branch::StreamB));

        settings.recording.directory = PathBuf::new();
        assert!(!settings.branch_configured(Branch::Recording));
        assert!(settings.branch_configured(Branch::VadMonitor));
    }

    #[test]
    fn test_stream_outputs_are_ordered() {
        let outputs = Settings::default().stream_outputs();
        assert_eq!(outputs[0].branch(), Branch::StreamA);
        assert_eq!(outputs[1].branch(), Branch::StreamB);
        assert_eq!(outputs[1].protocol(), "Icecast");
    }

    #[test]
    fn test_restart_max_delay_never_below_initial() {
        let restart = RestartSettings {
            initial_delay_ms: 5_000,
            max_delay_ms: 1_000,
            alert_after: 3,
        };
        assert_eq!(restart.max_delay(), Duration::from_secs(5));
    }

    #[test]
    fn test_shared_settings_provider_sees_updates() {
        let shared: SharedSettings = Arc::new(RwLock::new(Settings::default()));
        let provider: Arc<dyn SettingsProvider> = shared.clone();
        shared.write().audio.sample_rate = 96_000;
        assert_eq!(provider.settings().audio.sample_rate, 96_000);
    }

    #[test]
    fn test_config_manager_save_load() {
        let temp_dir = tempfile::tempdir().unwrap();
        let manager = ConfigManager::with_config_dir(temp_dir.path());

        assert_eq!(manager.load().unwrap(), Settings::default());

        let mut settings = Settings::default();
        settings.icecast.enabled = true;
        settings.icecast.password = "hackme".to_string();
        settings.auto_record.enabled = true;

        manager.save(&settings).unwrap();
        let loaded = manager.load().unwrap();

        assert_eq!(settings, loaded);
    }

    #[test]
    fn test_config_manager_rejects_garbage() {
        let temp_dir = tempfile::tempdir().unwrap();
        let manager = ConfigManager::with_config_dir(temp_dir.path());
        fs::write(manager.config_path(), "audio = 12").unwrap();
        assert!(manager.load().is_err());
    }
}
