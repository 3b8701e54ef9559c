use std::path::PathBuf;

use clap::Args;
use transient::config::RunConfig;

use crate::cli::{GlobalFlags, ImageOptions};

/// Run a virtual machine, stateless unless `--name` or a copy mapping is given.
#[derive(Args, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub images: ImageOptions,

    /// Name this run's persistent state; omit for a disposable VM
    #[arg(long = "name")]
    pub name: Option<String>,

    /// Copy a host file in before boot (`host:guest`). Repeatable.
    #[arg(short = 'b', long = "copy-in-before")]
    pub copy_in_before: Vec<String>,

    /// Copy a guest file out after shutdown (`guest:host`). Repeatable.
    #[arg(short = 'a', long = "copy-out-after")]
    pub copy_out_after: Vec<String>,

    /// Export a host directory into the guest (`host:guest`). Repeatable.
    #[arg(short = 's', long = "shared-folder")]
    pub shared_folder: Vec<String>,

    /// Attach an interactive SSH console once the guest is reachable
    #[arg(long = "ssh", alias = "ssh-console")]
    pub ssh_console: bool,

    /// Like --ssh, but also attach the hypervisor's serial console
    #[arg(long = "sshs", alias = "ssh-with-serial")]
    pub ssh_with_serial: bool,

    /// SSH login user
    #[arg(short = 'u', long = "ssh-user")]
    pub ssh_user: Option<String>,

    #[arg(long = "ssh-bin-name")]
    pub ssh_bin_name: Option<String>,

    /// Seconds to wait for the guest's SSH server to come up
    #[arg(long = "ssh-timeout")]
    pub ssh_timeout: Option<u64>,

    /// Forward a fixed host port instead of allocating one
    #[arg(long = "ssh-port")]
    pub ssh_port: Option<u16>,

    /// Run a single command over SSH instead of an interactive shell
    #[arg(long = "ssh-command", alias = "cmd")]
    pub ssh_command: Option<String>,

    #[arg(long = "ssh-net-driver")]
    pub ssh_net_driver: Option<String>,

    /// Seconds to wait for ACPI shutdown before terminating the hypervisor
    #[arg(long = "shutdown-timeout")]
    pub shutdown_timeout: Option<u64>,

    #[arg(long = "qmp-timeout")]
    pub qmp_timeout: Option<u64>,

    #[arg(long = "copy-timeout")]
    pub copy_timeout: Option<u64>,

    /// Provision everything and exit without starting the hypervisor
    #[arg(long = "prepare-only")]
    pub prepare_only: bool,

    /// Load additional options from a TOML config file
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Extra arguments passed through to the hypervisor, after `--`
    #[arg(last = true)]
    pub qemu_args: Vec<String>,
}

pub async fn execute(args: RunArgs, global: &GlobalFlags) -> anyhow::Result<i32> {
    let ctx = global.build_context(&args.images)?;

    let mut cfg = RunConfig {
        name: args.name,
        image: args.images.image,
        image_backend: args.images.image_backend,
        image_frontend: args.images.image_frontend,
        copy_in_before: args.copy_in_before,
        copy_out_after: args.copy_out_after,
        shared_folder: args.shared_folder,
        ssh_console: args.ssh_console,
        ssh_with_serial: args.ssh_with_serial,
        ssh_user: args.ssh_user,
        ssh_bin_name: args.ssh_bin_name,
        ssh_timeout: args.ssh_timeout,
        ssh_port: args.ssh_port,
        ssh_command: args.ssh_command,
        ssh_net_driver: args.ssh_net_driver,
        shutdown_timeout: args.shutdown_timeout,
        qmp_timeout: args.qmp_timeout,
        copy_timeout: args.copy_timeout,
        prepare_only: args.prepare_only,
        qemu_args: args.qemu_args,
    };

    if let Some(config_path) = &args.config {
        let from_file: transient::config::StartConfig = transient::config::load_config_file(config_path)?;
        let create_equivalent = transient::config::CreateConfig {
            name: cfg.name.clone(),
            image: cfg.image.clone(),
            image_backend: cfg.image_backend.clone(),
            image_frontend: cfg.image_frontend.clone(),
            ..Default::default()
        };
        cfg = transient::config::compose(&create_equivalent, &from_file);
    }

    let code = transient::lifecycle::run(cfg, &ctx).await?;
    Ok(code)
}
