//! Shared-folder mount worker: one per `host:guest` pair, implementing a
//! reverse SFTP channel — the host spawns an SFTP-server process whose
//! stdio is wired directly to the SSH client's stdio, and the guest runs
//! `sshfs -o slave,allow_other` reading/writing over its own stdio.
//!
//! A process-wide semaphore caps concurrent mounts at 8 to avoid
//! overloading the SFTP server process.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::Semaphore;

use crate::error::{TransientError, TransientResult};
use crate::ssh::SshConfig;

const MOUNT_CAPACITY: usize = 8;
const SENTINEL: &str = "TRANSIENT_SSHFS_DONE";
const SFTP_SERVER_PATHS: &[&str] = &[
    "/usr/lib/openssh/sftp-server",
    "/usr/libexec/sftp-server",
    "/usr/lib/ssh/sftp-server",
];

fn mount_semaphore() -> &'static Semaphore {
    static SEM: OnceLock<Semaphore> = OnceLock::new();
    SEM.get_or_init(|| Semaphore::new(MOUNT_CAPACITY))
}

pub struct SharedFolderSpec {
    pub host_dir: PathBuf,
    pub guest_dir: String,
}

/// Mount `spec.host_dir` at `spec.guest_dir` inside the guest over a
/// reverse SFTP channel. Resolves once the guest has printed the sentinel
/// token on stderr and a settle interval has elapsed without the session
/// closing — per the Design Notes, a timeout on that wait *is* the success
/// signal, since the mount is meant to live as long as the SSH session.
pub async fn mount(
    ssh: &SshConfig,
    spec: &SharedFolderSpec,
    settle: Duration,
) -> TransientResult<tokio::task::JoinHandle<()>> {
    let _permit = mount_semaphore()
        .acquire()
        .await
        .expect("mount semaphore never closed");

    let sftp_server_bin = SFTP_SERVER_PATHS
        .iter()
        .find(|p| std::path::Path::new(p).exists())
        .ok_or_else(|| TransientError::validation("no sftp-server binary found on host"))?;

    let mut sftp_server = Command::new(sftp_server_bin)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| TransientError::retrieval("spawning sftp-server", e))?;

    let guest_script = format!(
        "sudo mkdir -p {guest_dir} && \
         echo {sentinel} 1>&2 && \
         exec sshfs -o slave,allow_other :{host_dir} {guest_dir}",
        guest_dir = spec.guest_dir,
        sentinel = SENTINEL,
        host_dir = spec.host_dir.display(),
    );

    let mut ssh_cmd = Command::new(&ssh.bin_name);
    ssh_cmd.args([
        "-o",
        "StrictHostKeyChecking=no",
        "-o",
        "UserKnownHostsFile=/dev/null",
        "-o",
        "BatchMode=yes",
        "-o",
        "LogLevel=ERROR",
        "-p",
    ]);
    ssh_cmd.arg(ssh.port.to_string());
    ssh_cmd.arg("-i").arg(&ssh.identity_file);
    ssh_cmd.arg(format!("{}@{}", ssh.user, ssh.host));
    ssh_cmd.arg(guest_script);
    ssh_cmd.stdin(Stdio::piped());
    ssh_cmd.stdout(Stdio::piped());
    ssh_cmd.stderr(Stdio::piped());

    let mut ssh_child = ssh_cmd
        .spawn()
        .map_err(|e| TransientError::retrieval("spawning ssh for shared folder", e))?;

    let mut sftp_stdout = sftp_server.stdout.take().expect("piped stdout");
    let mut sftp_stdin = sftp_server.stdin.take().expect("piped stdin");
    let mut ssh_stdout = ssh_child.stdout.take().expect("piped stdout");
    let mut ssh_stdin = ssh_child.stdin.take().expect("piped stdin");
    let ssh_stderr = ssh_child.stderr.take().expect("piped stderr");

    // Pump bytes between the two processes' stdio in both directions.
    tokio::spawn(async move {
        let _ = tokio::io::copy(&mut sftp_stdout, &mut ssh_stdin).await;
    });
    tokio::spawn(async move {
        let _ = tokio::io::copy(&mut ssh_stdout, &mut sftp_stdin).await;
    });

    // Watch guest stderr: anything before the sentinel is an error; the
    // sentinel itself signals sshfs has started on the guest side.
    let mut lines = BufReader::new(ssh_stderr).lines();
    let mut saw_sentinel = false;
    let mut preamble = String::new();
    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| TransientError::retrieval("reading shared-folder stderr", e))?
    {
        if line.trim() == SENTINEL {
            saw_sentinel = true;
            break;
        }
        preamble.push_str(&line);
        preamble.push('\n');
    }

    if !saw_sentinel {
        return Err(TransientError::validation(format!(
            "shared folder mount for {} failed before starting: {}",
            spec.guest_dir, preamble
        )));
    }

    // The success signal is this wait *timing out* — the session is
    // expected to stay open for as long as the mount lives.
    match tokio::time::timeout(settle, ssh_child.wait()).await {
        Ok(status) => {
            let status = status.map_err(|e| TransientError::retrieval("waiting for ssh child", e))?;
            Err(TransientError::validation(format!(
                "shared folder session for {} exited early: {status}",
                spec.guest_dir
            )))
        }
        Err(_timed_out) => {
            let host_dir = spec.host_dir.clone();
            let guest_dir = spec.guest_dir.clone();
            Ok(tokio::spawn(async move {
                let _ = ssh_child.wait().await;
                let _ = sftp_server.wait().await;
                tracing::debug!(%guest_dir, host_dir = %host_dir.display(), "shared folder session ended");
            }))
        }
    }
}
