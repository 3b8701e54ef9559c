use std::time::Duration;

use clap::Args;
use transient::discovery::{self, DiscoveryFilter};
use transient::ssh::{SessionStdio, SshConfig};

use crate::cli::GlobalFlags;

/// Open an SSH session into a running VM, found by name via process
/// discovery.
#[derive(Args, Debug)]
pub struct SshArgs {
    /// Name of the running VM to connect to
    pub name: String,

    #[arg(short = 'u', long = "ssh-user", default_value = "root")]
    pub ssh_user: String,

    #[arg(long = "ssh-bin-name", default_value = "ssh")]
    pub ssh_bin_name: String,

    /// Seconds to wait for the instance to be discoverable
    #[arg(long = "timeout", default_value_t = 30)]
    pub timeout: u64,

    /// Run a single command instead of an interactive shell, after `--`
    #[arg(last = true)]
    pub command: Vec<String>,
}

pub async fn execute(args: SshArgs, global: &GlobalFlags) -> anyhow::Result<i32> {
    let filter = DiscoveryFilter {
        name: Some(args.name.clone()),
        with_ssh: true,
        vmstore: None,
    };
    let found = discovery::scan(&filter, Some(Duration::from_secs(args.timeout))).await?;
    let instance = found
        .into_iter()
        .next()
        .ok_or_else(|| anyhow::anyhow!("no SSH-reachable VM named `{}`", args.name))?;
    let port = instance
        .descriptor
        .ssh_port
        .ok_or_else(|| anyhow::anyhow!("VM `{}` has no forwarded SSH port", args.name))?;

    let cfg = SshConfig {
        bin_name: args.ssh_bin_name,
        host: "127.0.0.1".into(),
        port,
        user: args.ssh_user,
        identity_file: global.identity_file()?,
        connect_timeout: Duration::from_secs(5),
    };

    let command = if args.command.is_empty() {
        None
    } else {
        Some(args.command.join(" "))
    };
    let status = transient::ssh::run_session(&cfg, command.as_deref(), SessionStdio::Inherit).await?;
    Ok(status.code().unwrap_or(1))
}
