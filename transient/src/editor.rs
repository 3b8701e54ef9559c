//! Copy-on-write image editor (component M): boots a disk inside a tiny
//! maintenance VM so host-side tooling can inspect or mutate a qcow2 file's
//! contents without needing the guest's own cooperation.
//!
//! The maintenance VM's kernel and initramfs are supplied by the
//! surrounding deployment (out of scope here, same as SSH's embedded
//! identity key) — this module only knows their paths.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::error::{TransientError, TransientResult};
use crate::hypervisor::{HypervisorOptions, HypervisorRunner, StdioMode};
use crate::monitor::MonitorClient;
use crate::ssh::{self, SessionStdio, SshConfig};
use crate::util::join_abs;

/// Paths to the embedded kernel and initramfs used to boot the maintenance
/// VM — an external asset pair, analogous to the SSH identity key.
pub struct MaintenanceKernel {
    pub kernel: PathBuf,
    pub initramfs: PathBuf,
}

/// Fixed kernel command line the maintenance VM boots with: disables the
/// TSC watchdog and USB/crypto self-tests that otherwise slow boot inside
/// nested virtualization.
const KERNEL_APPEND: &str =
    "notsc console=ttyS0 tsc=reliable no_timer_check usbcore.nousb cryptomgr.notests";

pub struct ImageEditor {
    runner: HypervisorRunner,
    monitor: MonitorClient,
    ssh: SshConfig,
    mounted: bool,
}

impl ImageEditor {
    /// Boot the maintenance VM with `disk` attached as a virtio-scsi drive,
    /// wait for QMP and SSH to come up, and — unless `skip_mount` — probe
    /// for the guest's root filesystem and bind-mount `/dev`, `/sys`,
    /// `/proc` into it.
    pub async fn open(
        disk: &Path,
        kernel: &MaintenanceKernel,
        identity_file: PathBuf,
        qmp_timeout: Duration,
        ssh_timeout: Duration,
        skip_mount: bool,
    ) -> TransientResult<Self> {
        let monitor_dir = tempfile::tempdir()
            .map_err(|e| TransientError::retrieval("creating monitor socket dir", e))?;
        let monitor_socket = monitor_dir.path().join("monitor.sock");

        let args = vec![
            "-machine".into(),
            "accel=kvm:tcg".into(),
            "-smp".into(),
            "1".into(),
            "-m".into(),
            "1G".into(),
            "-kernel".into(),
            kernel.kernel.display().to_string(),
            "-initrd".into(),
            kernel.initramfs.display().to_string(),
            "-append".into(),
            KERNEL_APPEND.into(),
            "-serial".into(),
            "stdio".into(),
            "-display".into(),
            "none".into(),
            "-nographic".into(),
            "-device".into(),
            "virtio-rng-pci".into(),
            "-device".into(),
            "virtio-scsi-pci,id=scsi".into(),
            "-drive".into(),
            format!("file={},id=hd0,if=none", disk.display()),
            "-device".into(),
            "scsi-hd,drive=hd0".into(),
            "-netdev".into(),
            "user,id=transient-sshdev,hostfwd=tcp::0-:22".into(),
            "-device".into(),
            "virtio-net-pci,netdev=transient-sshdev".into(),
        ];

        let mut runner = HypervisorRunner::new(HypervisorOptions {
            binary: PathBuf::from("qemu-system-x86_64"),
            args,
            stdio: StdioMode::Quiet,
            monitor_socket: Some(monitor_socket.clone()),
            env: Vec::new(),
            extra_fds: Vec::new(),
        });
        runner.start()?;

        let monitor = MonitorClient::connect(&monitor_socket, qmp_timeout).await?;
        let ssh_port = monitor
            .find_ssh_port_forward()
            .await?
            .ok_or_else(|| TransientError::validation("maintenance VM did not report an SSH port forward"))?;

        let ssh_cfg = SshConfig {
            bin_name: "ssh".into(),
            host: "127.0.0.1".into(),
            port: ssh_port,
            user: "root".into(),
            identity_file,
            connect_timeout: Duration::from_secs(5),
        };

        ssh::probe_until_ready(&ssh_cfg, Instant::now() + ssh_timeout).await?;

        let mut editor = ImageEditor {
            runner,
            monitor,
            ssh: ssh_cfg,
            mounted: false,
        };

        if !skip_mount {
            editor.prepare_mount().await?;
        }

        Ok(editor)
    }

    /// Gracefully shut down the maintenance VM.
    pub async fn close(mut self, shutdown_timeout: Duration) -> TransientResult<()> {
        match self.runner.shutdown(&self.monitor, shutdown_timeout).await {
            Ok(()) => Ok(()),
            Err(_) => self.runner.terminate(shutdown_timeout).await,
        }
    }

    /// Run a command inside the mounted guest root via `chroot /mnt`,
    /// returning its output. Errors are swallowed when `allow_fail` is set.
    pub async fn run_command_in_guest(&self, command: &str, allow_fail: bool) -> TransientResult<()> {
        let wrapped = format!("chroot /mnt /bin/sh -c '{}'", command.replace('\'', r"'\''"));
        let status = ssh::run_session(&self.ssh, Some(&wrapped), SessionStdio::Piped).await;
        match status {
            Ok(status) if status.success() || allow_fail => Ok(()),
            Ok(status) => Err(TransientError::validation(format!(
                "guest command `{command}` failed: {status}"
            ))),
            Err(e) if allow_fail => {
                tracing::debug!(error = %e, command, "ignoring failed guest command (allow_fail)");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Run a host-side command with no guest involvement (e.g. `lsblk` over
    /// SSH without a chroot wrapper).
    async fn run_raw(&self, command: &str) -> TransientResult<std::process::ExitStatus> {
        ssh::run_session(&self.ssh, Some(command), SessionStdio::Piped).await
    }

    /// Copy a file from the host into the mounted guest root.
    pub async fn copy_in(&self, host_path: &Path, guest_path: &str) -> TransientResult<()> {
        let dst = join_abs(Path::new("/mnt"), &[Path::new(guest_path)]);
        ssh::scp(&self.ssh, host_path, &dst.display().to_string(), false).await
    }

    /// Copy a file from the mounted guest root out to the host.
    pub async fn copy_out(&self, guest_path: &str, host_path: &Path) -> TransientResult<()> {
        let src = join_abs(Path::new("/mnt"), &[Path::new(guest_path)]);
        ssh::scp(&self.ssh, host_path, &src.display().to_string(), true).await
    }

    /// `vgchange -ay` (allow-fail, in case there's no LVM), locate `/etc/fstab`
    /// under one of the guest's block devices, mount it at `/mnt`, then
    /// bind-mount `/dev` `/sys` `/proc` and run `mount -a` inside the chroot.
    async fn prepare_mount(&mut self) -> TransientResult<()> {
        let _ = self.run_raw("vgchange -ay").await;
        self.mount_root().await?;

        for src in ["/dev", "/sys", "/proc"] {
            let cmd = format!("mount --bind {src} /mnt{src}");
            let _ = self.run_raw(&cmd).await;
        }
        let _ = self.run_raw("chroot /mnt mount -a").await;
        self.mounted = true;
        Ok(())
    }

    async fn mount_root(&self) -> TransientResult<()> {
        let output = run_capture(&self.ssh, "lsblk -no FSTYPE,PATH -P").await?;
        for line in output.lines() {
            let Some((fstype, path)) = parse_lsblk_pair(line) else {
                continue;
            };
            if fstype.is_empty() {
                continue;
            }
            let mount_cmd = format!("mount -t {fstype} {path} /mnt");
            if self.run_raw(&mount_cmd).await.is_ok_and(|s| s.success()) {
                let has_fstab = self
                    .run_raw("test -f /mnt/etc/fstab")
                    .await
                    .is_ok_and(|s| s.success());
                if has_fstab {
                    return Ok(());
                }
                let _ = self.run_raw("umount /mnt").await;
            }
        }
        Err(TransientError::validation("unable to locate /etc/fstab on any guest block device"))
    }
}

async fn run_capture(ssh: &SshConfig, command: &str) -> TransientResult<String> {
    // Captured via a piped session rather than `run_session`'s fire-and-forget
    // status so callers can parse stdout.
    use std::process::Stdio;
    use tokio::process::Command;

    let mut cmd = Command::new(&ssh.bin_name);
    cmd.args([
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
    cmd.arg(ssh.port.to_string());
    cmd.arg("-i").arg(&ssh.identity_file);
    cmd.arg(format!("{}@{}", ssh.user, ssh.host));
    cmd.arg(command);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let output = cmd
        .output()
        .await
        .map_err(|e| TransientError::retrieval("running guest query command", e))?;
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Parse an `lsblk -P` line of `KEY="value" ...` pairs, extracting
/// `FSTYPE`/`PATH`.
fn parse_lsblk_pair(line: &str) -> Option<(String, String)> {
    let mut fstype = None;
    let mut path = None;
    for part in line.split_whitespace() {
        if let Some(rest) = part.strip_prefix("FSTYPE=\"") {
            fstype = Some(rest.trim_end_matches('"').to_string());
        } else if let Some(rest) = part.strip_prefix("PATH=\"") {
            path = Some(rest.trim_end_matches('"').to_string());
        }
    }
    Some((fstype?, path?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_lsblk_pairs() {
        let line = r#"FSTYPE="ext4" PATH="/dev/sda1""#;
        let (fstype, path) = parse_lsblk_pair(line).unwrap();
        assert_eq!(fstype, "ext4");
        assert_eq!(path, "/dev/sda1");
    }

    #[test]
    fn skips_lines_missing_fstype() {
        let line = r#"FSTYPE="" PATH="/dev/sda2""#;
        let (fstype, _) = parse_lsblk_pair(line).unwrap();
        assert_eq!(fstype, "");
    }
}
