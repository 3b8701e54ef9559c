use std::path::Path;
use std::time::Duration;

use clap::Args;

use crate::cli::{parse_mapping, GlobalFlags, ImageOptions};

/// Copy a file into or out of a (stopped) VM's primary disk, via the
/// maintenance-VM editor — the same mechanism `run`'s copy-in-before /
/// copy-out-after flags use, exposed as a standalone verb.
#[derive(Args, Debug)]
pub struct CpArgs {
    /// Name of the VM whose primary disk to mount
    pub vm_name: String,

    /// `host:guest` to copy in, or `guest:host` to copy out
    pub mapping: String,

    /// Copy from the guest to the host instead of host to guest
    #[arg(long = "from-guest")]
    pub from_guest: bool,

    #[command(flatten)]
    pub images: ImageOptions,
}

pub async fn execute(args: CpArgs, global: &GlobalFlags) -> anyhow::Result<()> {
    let ctx = global.build_context(&args.images)?;
    let (left, right) = parse_mapping(&args.mapping)?;

    let state = ctx.vmstore.lock_by_name(&args.vm_name, Some(Duration::from_secs(30)))?;
    let primary = state
        .primary_image()
        .ok_or_else(|| anyhow::anyhow!("VM `{}` has no primary disk", args.vm_name))?;

    let editor = transient::editor::ImageEditor::open(
        &primary.path,
        &global.maintenance_kernel(),
        global.identity_file()?,
        Duration::from_secs(60),
        Duration::from_secs(60),
        false,
    )
    .await?;

    if args.from_guest {
        editor.copy_out(&left, Path::new(&right)).await?;
    } else {
        editor.copy_in(Path::new(&left), &right).await?;
    }

    editor.close(Duration::from_secs(30)).await?;
    drop(state);

    println!("copied {}", args.mapping);
    Ok(())
}
