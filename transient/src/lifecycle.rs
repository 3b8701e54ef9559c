//! Lifecycle controller (component K): composes the image store, VM store,
//! hypervisor runner, monitor client, SSH launcher and shared-folder worker
//! into the `run`/`create`/`start` operations.

use std::io::Write;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use base64::Engine;

use crate::config::{CreateConfig, ImageSpec, RunConfig};
use crate::discovery::{DATA_FD_ENV, SENTINEL_ENV};
use crate::error::{TransientError, TransientResult};
use crate::hypervisor::{HypervisorOptions, HypervisorRunner, StdioMode};
use crate::images::{BackendStore, ImageProtocol};
use crate::monitor::MonitorClient;
use crate::sharedfolder::{self, SharedFolderSpec};
use crate::ssh::{self, SessionStdio, SshConfig};
use crate::vmstore::{VmPersistentState, VmStore};

const DEFAULT_NET_DRIVER: &str = "e1000";
const DEFAULT_SSH_USER: &str = "root";
const DEFAULT_SSH_BIN: &str = "ssh";

/// Everything the controller needs that doesn't come from a single
/// invocation's [`RunConfig`].
pub struct LifecycleContext {
    pub vmstore: VmStore,
    pub backend: BackendStore,
    pub protocols: Vec<Box<dyn ImageProtocol>>,
    pub hypervisor_binary: PathBuf,
    pub identity_file: PathBuf,
}

struct Disk {
    path: PathBuf,
    backend_name: String,
}

/// Run a VM to completion per `cfg`, returning the process's overall exit
/// code (the SSH session's code when an SSH console was used, else the
/// hypervisor's own).
pub async fn run(cfg: RunConfig, ctx: &LifecycleContext) -> TransientResult<i32> {
    let needs_ssh = cfg.ssh_console
        || cfg.ssh_command.is_some()
        || cfg.ssh_with_serial
        || !cfg.shared_folder.is_empty();
    let needs_ssh_console = cfg.ssh_console || cfg.ssh_with_serial || cfg.ssh_command.is_some();

    let stateless = cfg.name.is_none() && cfg.copy_in_before.is_empty() && cfg.copy_out_after.is_empty();

    let (disks, mut state, vm_name) = if stateless {
        let mut disks = Vec::new();
        for image_str in &cfg.image {
            let spec: ImageSpec = image_str.parse()?;
            let backend_image = ctx.backend.retrieve(&spec, &ctx.protocols).await?;
            disks.push(Disk {
                path: backend_image.path,
                backend_name: spec.name,
            });
        }
        let name = format!("transient-{}", uuid::Uuid::new_v4());
        (disks, None, name)
    } else {
        let create_cfg = CreateConfig {
            name: cfg.name.clone(),
            image: cfg.image.clone(),
            image_backend: cfg.image_backend.clone(),
            image_frontend: cfg.image_frontend.clone(),
            copy_in_before: Vec::new(),
            shared_folder: Vec::new(),
            ssh_user: cfg.ssh_user.clone(),
            ssh_bin_name: cfg.ssh_bin_name.clone(),
            ssh_net_driver: cfg.ssh_net_driver.clone(),
            qemu_args: Vec::new(),
        };

        let state = match &cfg.name {
            Some(name) if ctx.vmstore.exists(name) => {
                ctx.vmstore.lock_by_name(name, Some(Duration::from_secs(30)))?
            }
            _ => ctx.vmstore.create(create_cfg, &ctx.protocols).await?,
        };

        let disks = state
            .images
            .iter()
            .map(|i| Disk {
                path: i.path.clone(),
                backend_name: i.backend_name.clone(),
            })
            .collect();
        let name = state.name.clone();
        (disks, Some(state), name)
    };

    if let (Some(state), false) = (&state, cfg.copy_in_before.is_empty()) {
        copy_mappings(&cfg.copy_in_before, &ctx.identity_file, state, false).await?;
    }

    if cfg.prepare_only {
        if let Some(state) = state.take() {
            drop(state);
        }
        return Ok(0);
    }

    let ssh_port = if needs_ssh {
        Some(cfg.ssh_port.unwrap_or_else(allocate_random_port))
    } else {
        None
    };

    let mut args = vec!["-name".to_string(), vm_name.clone()];
    for (idx, disk) in disks.iter().enumerate() {
        args.push("-drive".into());
        args.push(format!("file={},if=none,id=hd{idx}", disk.path.display()));
        args.push("-device".into());
        args.push(format!("virtio-scsi-pci,id=scsi{idx}"));
        args.push("-device".into());
        args.push(format!("scsi-hd,drive=hd{idx},bootindex={idx}"));
    }
    if stateless {
        args.push("-snapshot".into());
    }

    if needs_ssh_console {
        args.push("-serial".into());
        args.push("stdio".into());
        args.push("-display".into());
        args.push("none".into());
    }

    if let Some(port) = ssh_port {
        let driver = cfg.ssh_net_driver.clone().unwrap_or_else(|| DEFAULT_NET_DRIVER.to_string());
        args.push("-netdev".into());
        args.push(format!("user,id=transient-sshdev,hostfwd=tcp::{port}-:22"));
        args.push("-device".into());
        args.push(format!("{driver},netdev=transient-sshdev"));
    }
    args.extend(cfg.qemu_args.iter().cloned());

    let descriptor = crate::discovery::InstanceDescriptor {
        name: cfg.name.clone(),
        vmstore: state.as_ref().map(|s| s.dir.clone()),
        primary_image: disks.first().map(|d| d.backend_name.clone()),
        stateless,
        transient_pid: std::process::id(),
        ssh_port,
    };
    let payload = base64::engine::general_purpose::STANDARD.encode(
        serde_json::to_vec(&descriptor).map_err(|e| TransientError::Internal(format!("encoding descriptor: {e}")))?,
    );
    let data_fd = write_descriptor_fd(payload.as_bytes())?;

    let monitor_dir = tempfile::tempdir().map_err(|e| TransientError::retrieval("creating monitor socket dir", e))?;
    let monitor_socket = monitor_dir.path().join("monitor.sock");

    let mut runner = HypervisorRunner::new(HypervisorOptions {
        binary: ctx.hypervisor_binary.clone(),
        args,
        stdio: if needs_ssh_console {
            StdioMode::Quiet
        } else {
            StdioMode::Interactive
        },
        monitor_socket: if needs_ssh { Some(monitor_socket.clone()) } else { None },
        env: vec![
            (SENTINEL_ENV.to_string(), "1".to_string()),
            (DATA_FD_ENV.to_string(), "3".to_string()),
        ],
        extra_fds: vec![data_fd.as_raw_fd()],
    });
    runner.start()?;
    drop(data_fd);

    let returncode = if needs_ssh_console {
        let qmp_timeout = Duration::from_secs(cfg.qmp_timeout.unwrap_or(60));
        let monitor = MonitorClient::connect(&monitor_socket, qmp_timeout).await?;

        let ssh_cfg = SshConfig {
            bin_name: cfg.ssh_bin_name.clone().unwrap_or_else(|| DEFAULT_SSH_BIN.to_string()),
            host: "127.0.0.1".into(),
            port: ssh_port.expect("needs_ssh_console implies a port"),
            user: cfg.ssh_user.clone().unwrap_or_else(|| DEFAULT_SSH_USER.to_string()),
            identity_file: ctx.identity_file.clone(),
            connect_timeout: Duration::from_secs(5),
        };

        let ssh_timeout = Duration::from_secs(cfg.ssh_timeout.unwrap_or(60));
        ssh::probe_until_ready(&ssh_cfg, Instant::now() + ssh_timeout).await?;

        let mut shared_handles = Vec::new();
        for mapping in &cfg.shared_folder {
            let (host_dir, guest_dir) = mapping
                .split_once(':')
                .ok_or_else(|| TransientError::validation(format!("invalid shared folder spec `{mapping}`")))?;
            let spec = SharedFolderSpec {
                host_dir: PathBuf::from(host_dir),
                guest_dir: guest_dir.to_string(),
            };
            shared_handles.push(sharedfolder::mount(&ssh_cfg, &spec, Duration::from_secs(2)).await?);
        }

        let status = ssh::run_session(&ssh_cfg, cfg.ssh_command.as_deref(), SessionStdio::Inherit).await?;

        let shutdown_timeout = cfg.shutdown_timeout.unwrap_or(60);
        if shutdown_timeout > 0 {
            match runner
                .shutdown(&monitor, Duration::from_secs(shutdown_timeout))
                .await
            {
                Ok(()) => {}
                Err(_) => {
                    tracing::error!(shutdown_timeout, "timed out waiting for guest shutdown, terminating");
                    runner.terminate(Duration::from_secs(shutdown_timeout)).await?;
                }
            }
        } else {
            // shutdown_timeout == 0: the caller wants the VM left running.
            let _ = runner.shutdown(&monitor, Duration::from_secs(0)).await;
        }

        for handle in shared_handles {
            handle.abort();
        }

        status.code().unwrap_or(1)
    } else {
        match runner.wait(None).await {
            Ok(()) => 0,
            Err(TransientError::Subprocess { status: Some(code), .. }) => code,
            Err(e) => return Err(e),
        }
    };

    if !cfg.copy_out_after.is_empty() {
        if let Some(state) = &state {
            copy_mappings(&cfg.copy_out_after, &ctx.identity_file, state, true).await?;
        }
    }

    if cfg.name.is_none() {
        if let Some(state) = state.take() {
            let dir = state.dir.clone();
            drop(state);
            let _ = std::fs::remove_dir_all(dir);
        }
    }

    Ok(returncode)
}

/// Create a VM's persistent state without starting it (the `create` verb).
pub async fn create(cfg: CreateConfig, ctx: &LifecycleContext) -> TransientResult<VmPersistentState> {
    ctx.vmstore.create(cfg, &ctx.protocols).await
}

/// Start an already-created VM (the `start` verb): load its state, then
/// run exactly as `run` would for a non-stateless invocation.
pub async fn start(name: &str, overrides: RunConfig, ctx: &LifecycleContext) -> TransientResult<i32> {
    if !ctx.vmstore.exists(name) {
        return Err(TransientError::validation(format!("no such VM `{name}`")));
    }
    let mut cfg = overrides;
    cfg.name = Some(name.to_string());
    run(cfg, ctx).await
}

async fn copy_mappings(
    mappings: &[String],
    identity_file: &std::path::Path,
    state: &VmPersistentState,
    copy_out: bool,
) -> TransientResult<()> {
    let primary = state
        .primary_image()
        .ok_or_else(|| TransientError::validation("VM has no primary disk to copy files into/out of"))?;

    let kernel = crate::editor::MaintenanceKernel {
        kernel: PathBuf::from("/usr/share/transient/maintenance-kernel"),
        initramfs: PathBuf::from("/usr/share/transient/maintenance-initramfs"),
    };
    let editor = crate::editor::ImageEditor::open(
        &primary.path,
        &kernel,
        identity_file.to_path_buf(),
        Duration::from_secs(60),
        Duration::from_secs(60),
        false,
    )
    .await?;

    for mapping in mappings {
        let (host, guest) = mapping
            .split_once(':')
            .ok_or_else(|| TransientError::validation(format!("invalid copy mapping `{mapping}`")))?;
        if copy_out {
            editor.copy_out(guest, std::path::Path::new(host)).await?;
        } else {
            editor.copy_in(std::path::Path::new(host), guest).await?;
        }
    }

    editor.close(Duration::from_secs(30)).await
}

fn allocate_random_port() -> u16 {
    std::net::TcpListener::bind(("127.0.0.1", 0))
        .and_then(|l| l.local_addr())
        .map(|addr| addr.port())
        .unwrap_or(0)
}

/// Write `payload` into a pipe and return the read end as an fd to pass
/// through to the hypervisor child; the write end is closed immediately so
/// the child sees EOF right after the data.
fn write_descriptor_fd(payload: &[u8]) -> TransientResult<OwnedFd> {
    let (read_fd, write_fd) = nix::unistd::pipe().map_err(|e| TransientError::Io(std::io::Error::from(e)))?;
    let mut write_file = std::fs::File::from(write_fd);
    write_file.write_all(payload)?;
    drop(write_file);
    Ok(read_fd)
}
