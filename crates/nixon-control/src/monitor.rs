//! Recording volume watch.

use std::io::ErrorKind;
use std::sync::Weak;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::controller::Shared;

/// How often the recording volume is measured.
pub const DISK_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Usage at which operators are warned.
pub const DISK_WARN_PERCENT: u8 = 90;

/// Measure now, then every [`DISK_CHECK_INTERVAL`] until the controller is gone.
pub(crate) async fn disk_monitor(weak: Weak<Shared>) {
    let mut ticker = tokio::time::interval(DISK_CHECK_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(shared) = weak.upgrade() else {
            return;
        };
        shared.check_disk_usage();
    }
}

impl Shared {
    pub(crate) fn check_disk_usage(&self) {
        let directory = self.settings.settings().recording.directory;
        if directory.as_os_str().is_empty() {
            return;
        }

        // Measured outside the lock, network mounts can be slow.
        let percent = match self.disk.usage_percent(&directory) {
            Ok(percent) => percent,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(directory = %directory.display(), "recording directory not created yet");
                return;
            }
            Err(e) => {
                warn!(directory = %directory.display(), error = %e, "disk usage check failed");
                return;
            }
        };

        let mut core = self.core.lock();
        let previous = core.disk_usage_percent.replace(percent);
        debug!(percent, "disk usage checked");
        if percent >= DISK_WARN_PERCENT && previous.is_none_or(|p| p < DISK_WARN_PERCENT) {
            warn!(percent, directory = %directory.display(), "recording volume nearly full");
            self.status
                .warning("disk", &format!("recording volume {percent}% full"));
        }
        self.publish(&core);
    }
}
