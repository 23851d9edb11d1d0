// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host resource probes
//!
//! Best-effort memory and disk usage for the machine the bridge runs on
//! (typically a small single-board computer whose SD card filling up is a
//! real failure mode).  Absence of a reading is not an error; the monitor
//! reports the host sub-check as unknown.

use std::time::Duration;

/// Supplies host resource usage, in percent.  `None` means the probe is
/// unavailable on this platform or failed; callers must cope.
pub trait HostStats: Send + Sync {
    fn memory_percent(&self) -> Option<f64>;
    fn disk_percent(&self) -> Option<f64>;

    /// How long this process has been up.
    fn uptime(&self) -> Duration;
}

/// The real probe: `/proc/meminfo` plus `statvfs(3)` on the root
/// filesystem.  Only meaningful on Linux; elsewhere both probes answer
/// `None`.
pub struct ProcHostStats {
    started: std::time::Instant,
}

impl Default for ProcHostStats {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcHostStats {
    pub fn new() -> Self {
        Self {
            started: std::time::Instant::now(),
        }
    }
}

impl HostStats for ProcHostStats {
    fn memory_percent(&self) -> Option<f64> {
        meminfo_percent()
    }

    fn disk_percent(&self) -> Option<f64> {
        statvfs_percent("/")
    }

    fn uptime(&self) -> Duration {
        self.started.elapsed()
    }
}

#[cfg(target_os = "linux")]
fn meminfo_percent() -> Option<f64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    let field = |name: &str| -> Option<f64> {
        meminfo
            .lines()
            .find(|line| line.starts_with(name))?
            .split_whitespace()
            .nth(1)?
            .parse::<f64>()
            .ok()
    };

    let total = field("MemTotal:")?;
    let available = field("MemAvailable:")?;
    if total <= 0.0 {
        return None;
    }
    Some((1.0 - available / total) * 100.0)
}

#[cfg(target_os = "linux")]
fn statvfs_percent(path: &str) -> Option<f64> {
    let path = std::ffi::CString::new(path).ok()?;
    let mut stats = unsafe { std::mem::zeroed::<libc::statvfs>() };
    // Safety: `path` is a valid NUL-terminated string and `stats` is a
    // properly-sized out parameter.
    if unsafe { libc::statvfs(path.as_ptr(), &mut stats) } != 0 {
        return None;
    }

    let total = stats.f_blocks as f64 * stats.f_frsize as f64;
    let free = stats.f_bfree as f64 * stats.f_frsize as f64;
    if total <= 0.0 {
        return None;
    }
    Some((total - free) / total * 100.0)
}

#[cfg(not(target_os = "linux"))]
fn meminfo_percent() -> Option<f64> {
    None
}

#[cfg(not(target_os = "linux"))]
fn statvfs_percent(_path: &str) -> Option<f64> {
    None
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;

    #[test]
    fn probes_return_plausible_percentages() {
        let memory = meminfo_percent().expect("/proc/meminfo should parse");
        assert!((0.0..=100.0).contains(&memory));

        let disk = statvfs_percent("/").expect("statvfs(/) should work");
        assert!((0.0..=100.0).contains(&disk));
    }
}
