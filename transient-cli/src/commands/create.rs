use clap::Args;
use transient::config::CreateConfig;

use crate::cli::{GlobalFlags, ImageOptions};

/// Create a VM's persistent state without starting it.
#[derive(Args, Debug)]
pub struct CreateArgs {
    #[command(flatten)]
    pub images: ImageOptions,

    /// Name for the new VM; generated if omitted
    #[arg(long = "name")]
    pub name: Option<String>,

    /// Copy a host file in before the VM's first boot (`host:guest`)
    #[arg(short = 'b', long = "copy-in-before")]
    pub copy_in_before: Vec<String>,

    /// Export a host directory into the guest on every future run (`host:guest`)
    #[arg(short = 's', long = "shared-folder")]
    pub shared_folder: Vec<String>,

    #[arg(short = 'u', long = "ssh-user")]
    pub ssh_user: Option<String>,

    #[arg(long = "ssh-bin-name")]
    pub ssh_bin_name: Option<String>,

    #[arg(long = "ssh-net-driver")]
    pub ssh_net_driver: Option<String>,

    /// Extra arguments passed through to the hypervisor on every future run
    #[arg(last = true)]
    pub qemu_args: Vec<String>,
}

pub async fn execute(args: CreateArgs, global: &GlobalFlags) -> anyhow::Result<()> {
    let ctx = global.build_context(&args.images)?;

    let cfg = CreateConfig {
        name: args.name,
        image: args.images.image,
        image_backend: args.images.image_backend,
        image_frontend: args.images.image_frontend,
        copy_in_before: args.copy_in_before,
        shared_folder: args.shared_folder,
        ssh_user: args.ssh_user,
        ssh_bin_name: args.ssh_bin_name,
        ssh_net_driver: args.ssh_net_driver,
        qemu_args: args.qemu_args,
    };

    let state = transient::lifecycle::create(cfg, &ctx).await?;
    println!("{}", state.name);
    Ok(())
}
