//! SSH launcher: probe-then-connect with retries, SCP/rsync wrappers, and
//! embedded-key extraction.
//!
//! Embedded SSH private keys themselves are supplied by the surrounding
//! deployment (out of scope here); this module only implements the
//! extraction-into-per-user-data-dir mechanism and the fixed option set
//! every invocation uses.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::process::Command;

use crate::error::{TransientError, TransientResult};

const SSH_TIME_BETWEEN_TRIES: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct SshConfig {
    pub bin_name: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub identity_file: PathBuf,
    pub connect_timeout: Duration,
}

impl SshConfig {
    /// The fixed option set every invocation prepends: no host-key
    /// checking, `known_hosts=null`, batch mode, a low log level, and a
    /// tight connect timeout.
    fn base_args(&self) -> Vec<String> {
        vec![
            "-o".into(),
            "StrictHostKeyChecking=no".into(),
            "-o".into(),
            "UserKnownHostsFile=/dev/null".into(),
            "-o".into(),
            "BatchMode=yes".into(),
            "-o".into(),
            "LogLevel=ERROR".into(),
            "-o".into(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
            "-i".into(),
            self.identity_file.display().to_string(),
            "-p".into(),
            self.port.to_string(),
        ]
    }
}

/// Extract the embedded identity key into the per-user data directory on
/// first use, returning its path. `key_bytes` is supplied by the caller
/// (bundled via `include_bytes!` at the call site, outside this module's
/// concern).
pub fn ensure_identity_file(data_dir: &Path, key_name: &str, key_bytes: &[u8]) -> TransientResult<PathBuf> {
    std::fs::create_dir_all(data_dir)?;
    let dest = data_dir.join(key_name);
    if !dest.exists() {
        std::fs::write(&dest, key_bytes)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&dest, std::fs::Permissions::from_mode(0o600))?;
        }
    }
    Ok(dest)
}

/// Probe an SSH session (stdin bound to null, short per-probe timeout) in a
/// loop until it returns 0 (server is up) or `deadline` is reached. A
/// return code of 255 retries; any other non-zero code is fatal.
pub async fn probe_until_ready(cfg: &SshConfig, deadline: Instant) -> TransientResult<()> {
    loop {
        let mut cmd = Command::new(&cfg.bin_name);
        cmd.args(cfg.base_args());
        cmd.arg(format!("{}@{}", cfg.user, cfg.host));
        cmd.arg("true");
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::piped());

        let output = cmd
            .output()
            .await
            .map_err(|e| TransientError::retrieval("spawning ssh probe", e))?;

        match output.status.code() {
            Some(0) => return Ok(()),
            Some(255) => {
                if Instant::now() >= deadline {
                    return Err(TransientError::validation(
                        "timed out waiting for SSH connection",
                    ));
                }
                tokio::time::sleep(SSH_TIME_BETWEEN_TRIES).await;
            }
            _ => return Err(TransientError::subprocess(cfg.bin_name.clone(), &output)),
        }
    }
}

/// Spawn the real SSH session with caller-supplied stdio, running `command`
/// if given or an interactive shell otherwise. Returns once the session
/// exits, with its exit status.
pub async fn run_session(
    cfg: &SshConfig,
    command: Option<&str>,
    stdio: SessionStdio,
) -> TransientResult<std::process::ExitStatus> {
    let mut cmd = Command::new(&cfg.bin_name);
    cmd.args(cfg.base_args());
    cmd.arg(format!("{}@{}", cfg.user, cfg.host));
    if let Some(command) = command {
        cmd.arg(command);
    }
    match stdio {
        SessionStdio::Inherit => {
            cmd.stdin(Stdio::inherit());
            cmd.stdout(Stdio::inherit());
            cmd.stderr(Stdio::inherit());
        }
        SessionStdio::Piped => {
            cmd.stdin(Stdio::piped());
            cmd.stdout(Stdio::piped());
            cmd.stderr(Stdio::piped());
        }
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| TransientError::retrieval("spawning ssh session", e))?;
    child
        .wait()
        .await
        .map_err(|e| TransientError::retrieval("waiting for ssh session", e))
}

#[derive(Debug, Clone, Copy)]
pub enum SessionStdio {
    Inherit,
    Piped,
}

/// `scp(src, dst, cfg, copy_from)`: build and run the corresponding `scp`
/// command line.
pub async fn scp(cfg: &SshConfig, src: &Path, dst: &str, copy_from_guest: bool) -> TransientResult<()> {
    let mut cmd = Command::new("scp");
    cmd.args(["-o", "StrictHostKeyChecking=no"]);
    cmd.args(["-o", "UserKnownHostsFile=/dev/null"]);
    cmd.args(["-o", "BatchMode=yes"]);
    cmd.args(["-o", "LogLevel=ERROR"]);
    cmd.arg("-P").arg(cfg.port.to_string());
    cmd.arg("-i").arg(&cfg.identity_file);
    cmd.arg("-r");

    let remote = format!("{}@{}:{}", cfg.user, cfg.host, dst);
    if copy_from_guest {
        cmd.arg(&remote).arg(src);
    } else {
        cmd.arg(src).arg(&remote);
    }

    let output = cmd
        .output()
        .await
        .map_err(|e| TransientError::retrieval("spawning scp", e))?;
    if !output.status.success() {
        return Err(TransientError::subprocess("scp", &output));
    }
    Ok(())
}

/// `rsync(src, dst, cfg, copy_from)`: build and run the corresponding
/// `rsync` command line over an `ssh` transport using the same option set.
pub async fn rsync(cfg: &SshConfig, src: &Path, dst: &str, copy_from_guest: bool) -> TransientResult<()> {
    let ssh_transport = format!(
        "ssh -p {} -i {} -o StrictHostKeyChecking=no -o UserKnownHostsFile=/dev/null -o BatchMode=yes -o LogLevel=ERROR",
        cfg.port,
        cfg.identity_file.display(),
    );

    let mut cmd = Command::new("rsync");
    cmd.arg("-a").arg("-e").arg(ssh_transport);

    let remote = format!("{}@{}:{}", cfg.user, cfg.host, dst);
    if copy_from_guest {
        cmd.arg(&remote).arg(src);
    } else {
        cmd.arg(src).arg(&remote);
    }

    let output = cmd
        .output()
        .await
        .map_err(|e| TransientError::retrieval("spawning rsync", e))?;
    if !output.status.success() {
        return Err(TransientError::subprocess("rsync", &output));
    }
    Ok(())
}
