use clap::Args;
use transient::config::{CreateConfig, RunConfig, StartConfig};

use crate::cli::{GlobalFlags, ImageOptions};

/// Start an already-created VM.
#[derive(Args, Debug)]
pub struct StartArgs {
    /// Name of the VM to start
    pub name: String,

    #[command(flatten)]
    pub images: ImageOptions,

    #[arg(short = 'b', long = "copy-in-before")]
    pub copy_in_before: Vec<String>,

    #[arg(short = 'a', long = "copy-out-after")]
    pub copy_out_after: Vec<String>,

    #[arg(short = 's', long = "shared-folder")]
    pub shared_folder: Vec<String>,

    #[arg(long = "ssh", alias = "ssh-console")]
    pub ssh_console: bool,

    #[arg(long = "sshs", alias = "ssh-with-serial")]
    pub ssh_with_serial: bool,

    #[arg(short = 'u', long = "ssh-user")]
    pub ssh_user: Option<String>,

    #[arg(long = "ssh-bin-name")]
    pub ssh_bin_name: Option<String>,

    #[arg(long = "ssh-timeout")]
    pub ssh_timeout: Option<u64>,

    #[arg(long = "ssh-port")]
    pub ssh_port: Option<u16>,

    #[arg(long = "ssh-command", alias = "cmd")]
    pub ssh_command: Option<String>,

    #[arg(long = "ssh-net-driver")]
    pub ssh_net_driver: Option<String>,

    #[arg(long = "shutdown-timeout")]
    pub shutdown_timeout: Option<u64>,

    #[arg(long = "qmp-timeout")]
    pub qmp_timeout: Option<u64>,

    #[arg(long = "copy-timeout")]
    pub copy_timeout: Option<u64>,

    #[arg(long = "prepare-only")]
    pub prepare_only: bool,

    #[arg(last = true)]
    pub qemu_args: Vec<String>,
}

pub async fn execute(args: StartArgs, global: &GlobalFlags) -> anyhow::Result<i32> {
    let ctx = global.build_context(&args.images)?;

    let start_cfg = StartConfig {
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
    let overrides: RunConfig = transient::config::compose(&CreateConfig::default(), &start_cfg);

    let code = transient::lifecycle::start(&args.name, overrides, &ctx).await?;
    Ok(code)
}
