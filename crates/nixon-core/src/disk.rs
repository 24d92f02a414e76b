//! Free space on the recording volume.

use std::io;
use std::path::Path;

/// Reports how full the filesystem holding a path is.
pub trait DiskMonitor: Send + Sync {
    /// Percentage of the filesystem holding `path` that is in use, as `df` reports it.
    fn usage_percent(&self, path: &Path) -> io::Result<u8>;
}

/// [`DiskMonitor`] backed by `statvfs(3)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct StatvfsMonitor;

impl DiskMonitor for StatvfsMonitor {
    #[cfg(unix)]
    fn usage_percent(&self, path: &Path) -> io::Result<u8> {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
        if unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) } != 0 {
            return Err(io::Error::last_os_error());
        }

        let used = (stat.f_blocks as u64).saturating_sub(stat.f_bfree as u64);
        Ok(usage_percent(used, stat.f_bavail as u64))
    }

    #[cfg(not(unix))]
    fn usage_percent(&self, _path: &Path) -> io::Result<u8> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "disk usage is only measured on unix",
        ))
    }
}

/// Used share of the blocks available to unprivileged users, rounded up.
pub fn usage_percent(used: u64, available: u64) -> u8 {
    let total = used.saturating_add(available);
    if total == 0 {
        return 0;
    }
    let percent = (u128::from(used) * 100).div_ceil(u128::from(total));
    percent.min(100) as u8
}
