use clap::Args;

use crate::cli::{GlobalFlags, ImageOptions};
use crate::util::prompt_yes_no;

/// Remove a VM's persistent state.
#[derive(Args, Debug)]
pub struct RmArgs {
    /// Name of the VM to remove
    pub name: String,

    #[command(flatten)]
    pub images: ImageOptions,

    /// Skip the confirmation prompt and remove even if the state is locked
    #[arg(short = 'f', long = "force")]
    pub force: bool,
}

pub async fn execute(args: RmArgs, global: &GlobalFlags) -> anyhow::Result<()> {
    let ctx = global.build_context(&args.images)?;

    if !args.force && !prompt_yes_no(&format!("remove VM `{}`?", args.name))? {
        return Ok(());
    }

    if args.force {
        ctx.vmstore.force_rm(&args.name)?;
    } else {
        ctx.vmstore.rm_by_name(&args.name, Some(std::time::Duration::from_secs(5)))?;
    }

    println!("removed {}", args.name);
    Ok(())
}
