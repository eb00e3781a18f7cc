//! Host metrics reported with every heartbeat.

use std::ffi::CString;
use std::path::Path;

use fleet_protocol::HostMetrics;

/// Samples load, memory, disk and uptime. Any metric that cannot be read is
/// left out rather than failing the heartbeat.
pub fn sample(disk_path: &Path) -> HostMetrics {
    HostMetrics {
        load_1m: read_proc("/proc/loadavg").and_then(|s| parse_loadavg(&s)),
        free_mem_kb: read_proc("/proc/meminfo").and_then(|s| parse_mem_available_kb(&s)),
        disk_free_kb: disk_free_kb(disk_path),
        uptime_secs: read_proc("/proc/uptime").and_then(|s| parse_uptime_secs(&s)),
    }
}

fn read_proc(path: &str) -> Option<String> {
    std::fs::read_to_string(path).ok()
}

/// First field of `/proc/loadavg`.
fn parse_loadavg(content: &str) -> Option<f64> {
    content.split_whitespace().next()?.parse().ok()
}

/// `MemAvailable` from `/proc/meminfo`, in kB.
fn parse_mem_available_kb(content: &str) -> Option<u64> {
    content
        .lines()
        .find_map(|line| line.strip_prefix("MemAvailable:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|value| value.parse().ok())
}

/// Whole seconds from the first field of `/proc/uptime`.
fn parse_uptime_secs(content: &str) -> Option<u64> {
    let secs: f64 = content.split_whitespace().next()?.parse().ok()?;
    (secs >= 0.0).then_some(secs as u64)
}

/// Space available to unprivileged users on the filesystem holding `path`.
fn disk_free_kb(path: &Path) -> Option<u64> {
    let c_path = CString::new(path.as_os_str().as_encoded_bytes()).ok()?;
    let mut stat = std::mem::MaybeUninit::<libc::statvfs>::uninit();

    // SAFETY: `c_path` is NUL-terminated and `stat` is only read on success.
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), stat.as_mut_ptr()) };
    if rc != 0 {
        return None;
    }
    let stat = unsafe { stat.assume_init() };

    let bytes = (stat.f_bavail as u64).saturating_mul(stat.f_frsize as u64);
    Some(bytes / 1024)
}
