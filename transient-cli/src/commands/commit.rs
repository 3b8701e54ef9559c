use std::time::Duration;

use clap::Args;

use crate::cli::{GlobalFlags, ImageOptions};

/// Flatten a VM's primary disk into a new, read-only backend image.
#[derive(Args, Debug)]
pub struct CommitArgs {
    /// Name of the VM to commit
    pub vm_name: String,

    /// Name for the resulting backend image
    pub new_image_name: String,

    #[command(flatten)]
    pub images: ImageOptions,
}

pub async fn execute(args: CommitArgs, global: &GlobalFlags) -> anyhow::Result<()> {
    let ctx = global.build_context(&args.images)?;

    let state = ctx.vmstore.lock_by_name(&args.vm_name, Some(Duration::from_secs(30)))?;
    ctx.vmstore.commit(&state, &args.new_image_name).await?;
    drop(state);

    println!("committed {} to {}", args.vm_name, args.new_image_name);
    Ok(())
}
