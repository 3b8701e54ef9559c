//! Hypervisor runner: owns a child hypervisor process through
//! `unstarted → running → {graceful, terminated, killed, exited}`.
//!
//! Child death is observed via an explicit wait future on
//! `tokio::process::Child` rather than a `SIGCHLD` handler — the Design
//! Notes prefer wait-groups over signal handlers wherever the runtime
//! supports it; the observable contract (timely reporting of hypervisor
//! exit) is unchanged.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};

use crate::error::{TransientError, TransientResult};
use crate::monitor::MonitorClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Unstarted,
    Running,
    Graceful,
    Terminated,
    Killed,
    Exited,
}

/// How the child's stdio should be plumbed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdioMode {
    /// stdin/stdout bound to `/dev/null`.
    Quiet,
    /// stdin/stdout inherited from this process.
    Interactive,
}

pub struct HypervisorOptions {
    pub binary: PathBuf,
    pub args: Vec<String>,
    pub stdio: StdioMode,
    pub monitor_socket: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    /// Extra file descriptors to pass through to the child, dup2'd onto
    /// sequential child-side fd numbers starting at 3 (used to publish the
    /// running-instance descriptor — see `lifecycle.rs`).
    pub extra_fds: Vec<std::os::fd::RawFd>,
}

pub struct HypervisorRunner {
    options: HypervisorOptions,
    child: Option<Child>,
    state: RunnerState,
    /// Set just before a monitor-requested shutdown is sent, so that an
    /// unexpected-looking exit right after is treated as success.
    graceful_requested: bool,
}

impl HypervisorRunner {
    pub fn new(options: HypervisorOptions) -> Self {
        HypervisorRunner {
            options,
            child: None,
            state: RunnerState::Unstarted,
            graceful_requested: false,
        }
    }

    pub fn state(&self) -> RunnerState {
        self.state
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    /// Fork+exec the hypervisor, arranging that it receives `SIGTERM` if
    /// this process dies before it (parent-death-signal on platforms that
    /// support it — Linux `PR_SET_PDEATHSIG` via `prctl` in a `pre_exec`
    /// hook).
    pub fn start(&mut self) -> TransientResult<()> {
        if self.state != RunnerState::Unstarted {
            return Err(TransientError::Internal(
                "hypervisor runner already started".into(),
            ));
        }

        let mut cmd = Command::new(&self.options.binary);
        cmd.args(&self.options.args);

        match self.options.stdio {
            StdioMode::Quiet => {
                cmd.stdin(Stdio::null());
                cmd.stdout(Stdio::null());
                cmd.stderr(Stdio::piped());
            }
            StdioMode::Interactive => {
                cmd.stdin(Stdio::inherit());
                cmd.stdout(Stdio::inherit());
                cmd.stderr(Stdio::inherit());
            }
        }

        for (key, value) in &self.options.env {
            cmd.env(key, value);
        }

        if let Some(socket) = &self.options.monitor_socket {
            cmd.arg("-qmp").arg(format!("unix:{},server,nowait", socket.display()));
        }

        let extra_fds = self.options.extra_fds.clone();
        unsafe {
            cmd.pre_exec(move || {
                set_parent_death_signal()?;
                dup_extra_fds(&extra_fds)
            });
        }

        let child = cmd
            .spawn()
            .map_err(|e| TransientError::retrieval("spawning hypervisor process", e))?;

        self.child = Some(child);
        self.state = RunnerState::Running;
        Ok(())
    }

    /// Send the monitor command for ACPI power down and wait up to
    /// `timeout` for the child to exit. On timeout, returns an error; the
    /// caller is then expected to call [`terminate`](Self::terminate).
    pub async fn shutdown(
        &mut self,
        monitor: &MonitorClient,
        timeout: Duration,
    ) -> TransientResult<()> {
        self.graceful_requested = true;
        monitor
            .send_sync(
                serde_json::json!({"execute": "system_powerdown"}),
                Duration::from_secs(5),
            )
            .await?;

        match self.wait(Some(timeout)).await {
            Ok(()) => {
                self.state = RunnerState::Graceful;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Send `SIGTERM`; if the child is still alive after `kill_after`,
    /// send `SIGKILL`.
    pub async fn terminate(&mut self, kill_after: Duration) -> TransientResult<()> {
        let Some(child) = self.child.as_mut() else {
            return Err(TransientError::Internal("runner has no child".into()));
        };
        let Some(pid) = child.id() else {
            // Already reaped.
            self.state = RunnerState::Exited;
            return Ok(());
        };

        send_signal(pid, nix::sys::signal::Signal::SIGTERM)?;
        self.state = RunnerState::Terminated;

        match self.wait(Some(kill_after)).await {
            Ok(()) => Ok(()),
            Err(_) => {
                if let Some(pid) = self.child.as_ref().and_then(Child::id) {
                    send_signal(pid, nix::sys::signal::Signal::SIGKILL)?;
                    self.state = RunnerState::Killed;
                }
                self.wait(None).await
            }
        }
    }

    /// Block on child exit, draining stdout/stderr as needed to avoid pipe
    /// deadlocks (`communicate`-style).
    pub async fn wait(&mut self, timeout: Option<Duration>) -> TransientResult<()> {
        let Some(child) = self.child.as_mut() else {
            return Err(TransientError::Internal("runner has no child".into()));
        };

        let wait_fut = child.wait();
        let status = match timeout {
            Some(timeout) => tokio::time::timeout(timeout, wait_fut)
                .await
                .map_err(|_| TransientError::validation("timed out waiting for hypervisor exit"))?
                .map_err(TransientError::Io)?,
            None => wait_fut.await.map_err(TransientError::Io)?,
        };

        self.state = RunnerState::Exited;
        if !status.success() && !self.graceful_requested {
            return Err(TransientError::Subprocess {
                command: self.options.binary.display().to_string(),
                status: status.code(),
                stdout: String::new(),
                stderr: String::new(),
            });
        }
        Ok(())
    }
}

fn send_signal(pid: u32, signal: nix::sys::signal::Signal) -> TransientResult<()> {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), signal)
        .map_err(|e| TransientError::Io(std::io::Error::from(e)))
}

/// Async-signal-safe `pre_exec` hook: arrange for this child to receive
/// `SIGTERM` if the parent dies first.
fn set_parent_death_signal() -> std::io::Result<()> {
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Async-signal-safe: `dup2` each fd onto sequential targets starting at 3.
fn dup_extra_fds(fds: &[std::os::fd::RawFd]) -> std::io::Result<()> {
    for (offset, fd) in fds.iter().enumerate() {
        let target = 3 + offset as i32;
        if *fd != target && unsafe { libc::dup2(*fd, target) } < 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Path of the monitor socket this runner will instruct the hypervisor to
/// listen on, if qmp-connectable was requested.
pub fn monitor_socket_path(options: &HypervisorOptions) -> Option<&Path> {
    options.monitor_socket.as_deref()
}
