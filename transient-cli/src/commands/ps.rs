use std::path::PathBuf;
use std::time::Duration;

use clap::Args;
use comfy_table::{presets::UTF8_FULL, Table};
use transient::discovery::{self, DiscoveryFilter};

use crate::cli::GlobalFlags;

/// List running instances discoverable via process scanning.
#[derive(Args, Debug)]
pub struct PsArgs {
    /// Only show the instance with this name
    #[arg(long = "name")]
    pub name: Option<String>,

    /// Only show instances with a forwarded SSH port
    #[arg(long = "with-ssh")]
    pub with_ssh: bool,

    /// Wait up to this many seconds for a matching instance to appear
    #[arg(long = "timeout")]
    pub timeout: Option<u64>,

    /// Only show instances whose persistent state lives under this vmstore directory
    #[arg(long = "vmstore")]
    pub vmstore: Option<PathBuf>,
}

pub async fn execute(args: PsArgs, _global: &GlobalFlags) -> anyhow::Result<()> {
    let filter = DiscoveryFilter {
        name: args.name,
        with_ssh: args.with_ssh,
        vmstore: args.vmstore,
    };
    let timeout = args.timeout.map(Duration::from_secs);
    let instances = discovery::scan(&filter, timeout).await?;

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["PID", "NAME", "STATELESS", "SSH PORT", "PRIMARY IMAGE"]);
    for instance in &instances {
        table.add_row(vec![
            instance.qemu_pid.to_string(),
            instance.descriptor.name.clone().unwrap_or_else(|| "-".into()),
            instance.descriptor.stateless.to_string(),
            instance
                .descriptor
                .ssh_port
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".into()),
            instance.descriptor.primary_image.clone().unwrap_or_else(|| "-".into()),
        ]);
    }
    println!("{table}");
    Ok(())
}
