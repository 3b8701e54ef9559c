//! Process discovery (component L): finds running hypervisor instances by
//! scanning `/proc` for a sentinel environment variable pointing at a
//! file descriptor that holds a base64-encoded JSON descriptor.
//!
//! The descriptor itself is published by [`crate::lifecycle`] into the
//! hypervisor child's environment and an inherited fd at spawn time.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::{TransientError, TransientResult};

const PROC_ROOT: &str = "/proc";
pub const SENTINEL_ENV: &str = "__TRANSIENT_PROCESS";
pub const DATA_FD_ENV: &str = "__TRANSIENT_DATA_FD";

/// The JSON payload published alongside a running hypervisor: everything a
/// `ps`/`ssh`-by-name lookup needs without touching the VM store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceDescriptor {
    pub name: Option<String>,
    pub vmstore: Option<PathBuf>,
    pub primary_image: Option<String>,
    pub stateless: bool,
    pub transient_pid: u32,
    pub ssh_port: Option<u16>,
}

#[derive(Debug, Clone)]
pub struct RunningInstance {
    pub qemu_pid: u32,
    pub start_time: std::time::SystemTime,
    pub descriptor: InstanceDescriptor,
}

#[derive(Debug, Clone, Default)]
pub struct DiscoveryFilter {
    pub name: Option<String>,
    pub with_ssh: bool,
    pub vmstore: Option<PathBuf>,
}

impl DiscoveryFilter {
    fn matches(&self, descriptor: &InstanceDescriptor) -> bool {
        if let Some(name) = &self.name {
            if descriptor.name.as_deref() != Some(name.as_str()) {
                return false;
            }
        }
        if self.with_ssh && descriptor.ssh_port.is_none() {
            return false;
        }
        if let Some(vmstore) = &self.vmstore {
            if descriptor.vmstore.as_deref() != Some(vmstore.as_path()) {
                return false;
            }
        }
        true
    }
}

/// One pass over `/proc`: every process carrying the sentinel env var whose
/// descriptor matches `filter`.
pub fn scan_once(filter: &DiscoveryFilter) -> Vec<RunningInstance> {
    let mut out = Vec::new();
    let Ok(entries) = std::fs::read_dir(PROC_ROOT) else {
        return out;
    };

    for entry in entries.flatten() {
        let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        let pid_dir = entry.path();

        let Ok(environ) = read_pid_environ(&pid_dir) else {
            continue;
        };
        if !environ.contains_key(SENTINEL_ENV) {
            continue;
        }
        let Some(fd_str) = environ.get(DATA_FD_ENV) else {
            continue;
        };
        let Ok(fd) = fd_str.parse::<u32>() else {
            continue;
        };

        // A process scanned between starting and the data fd being filled
        // in: transient, not an error — skip it.
        let Ok(descriptor) = read_pid_data(&pid_dir, fd) else {
            continue;
        };
        if !filter.matches(&descriptor) {
            continue;
        }

        let start_time = read_pid_start_time(&pid_dir).unwrap_or(std::time::SystemTime::UNIX_EPOCH);
        out.push(RunningInstance {
            qemu_pid: pid,
            start_time,
            descriptor,
        });
    }
    out
}

/// Scan repeatedly until a match is found or `timeout` elapses. Per the
/// scan contract, a timeout requires at least one of `name`/`with_ssh` to
/// be set — otherwise the call can never narrow down to "the" instance and
/// is rejected as illegal.
pub async fn scan(filter: &DiscoveryFilter, timeout: Option<Duration>) -> TransientResult<Vec<RunningInstance>> {
    if timeout.is_some() && filter.name.is_none() && !filter.with_ssh {
        return Err(TransientError::validation(
            "scan timeout requires at least one of `name` or `with_ssh` to be set",
        ));
    }

    let Some(timeout) = timeout else {
        return Ok(scan_once(filter));
    };

    let deadline = Instant::now() + timeout;
    loop {
        let found = scan_once(filter);
        if !found.is_empty() || Instant::now() >= deadline {
            return Ok(found);
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

fn read_pid_environ(pid_dir: &Path) -> std::io::Result<std::collections::HashMap<String, String>> {
    let raw = std::fs::read(pid_dir.join("environ"))?;
    let mut map = std::collections::HashMap::new();
    for entry in raw.split(|&b| b == 0) {
        if entry.is_empty() {
            continue;
        }
        let text = String::from_utf8_lossy(entry);
        if let Some((k, v)) = text.split_once('=') {
            map.insert(k.to_string(), v.to_string());
        }
    }
    Ok(map)
}

fn read_pid_start_time(pid_dir: &Path) -> std::io::Result<std::time::SystemTime> {
    std::fs::metadata(pid_dir)?.created()
}

fn read_pid_data(pid_dir: &Path, fd: u32) -> TransientResult<InstanceDescriptor> {
    let raw = std::fs::read(pid_dir.join("fd").join(fd.to_string()))?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(raw)
        .map_err(|e| TransientError::Internal(format!("decoding instance descriptor: {e}")))?;
    serde_json::from_slice(&decoded)
        .map_err(|e| TransientError::Internal(format!("parsing instance descriptor: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_matches_on_name() {
        let filter = DiscoveryFilter {
            name: Some("web".into()),
            with_ssh: false,
            vmstore: None,
        };
        let descriptor = InstanceDescriptor {
            name: Some("web".into()),
            vmstore: None,
            primary_image: None,
            stateless: false,
            transient_pid: 1,
            ssh_port: None,
        };
        assert!(filter.matches(&descriptor));
    }

    #[test]
    fn filter_rejects_missing_ssh_port_when_required() {
        let filter = DiscoveryFilter {
            name: None,
            with_ssh: true,
            vmstore: None,
        };
        let descriptor = InstanceDescriptor {
            name: None,
            vmstore: None,
            primary_image: None,
            stateless: true,
            transient_pid: 1,
            ssh_port: None,
        };
        assert!(!filter.matches(&descriptor));
    }

    #[tokio::test]
    async fn timeout_without_name_or_ssh_is_rejected() {
        let filter = DiscoveryFilter::default();
        let result = scan(&filter, Some(Duration::from_millis(10))).await;
        assert!(result.is_err());
    }
}
