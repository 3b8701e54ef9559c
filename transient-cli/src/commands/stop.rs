use std::time::Duration;

use clap::Args;
use transient::discovery::{self, DiscoveryFilter};

use crate::cli::GlobalFlags;

/// Request a graceful shutdown of a running VM, found by name via process
/// discovery (component L) rather than the VM store, since the hypervisor
/// may be running detached from any `transient` invocation still waiting on
/// it.
#[derive(Args, Debug)]
pub struct StopArgs {
    /// Name of the running VM to stop
    pub name: String,

    /// Seconds to wait for the hypervisor to exit after SIGTERM before
    /// escalating to SIGKILL
    #[arg(long = "kill-after", default_value_t = 10)]
    pub kill_after: u64,
}

pub async fn execute(args: StopArgs, _global: &GlobalFlags) -> anyhow::Result<()> {
    let filter = DiscoveryFilter {
        name: Some(args.name.clone()),
        with_ssh: false,
        vmstore: None,
    };
    let found = discovery::scan(&filter, Some(Duration::from_secs(2))).await?;
    if found.is_empty() {
        anyhow::bail!("no running VM named `{}`", args.name);
    }

    for instance in &found {
        send_signal(instance.qemu_pid, "TERM")?;
    }

    let deadline = std::time::Instant::now() + Duration::from_secs(args.kill_after);
    loop {
        let still_running = discovery::scan_once(&filter);
        if still_running.is_empty() {
            break;
        }
        if std::time::Instant::now() >= deadline {
            for instance in &still_running {
                send_signal(instance.qemu_pid, "KILL")?;
            }
            break;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    println!("stopped {}", args.name);
    Ok(())
}

fn send_signal(pid: u32, signal: &str) -> anyhow::Result<()> {
    let status = std::process::Command::new("kill")
        .arg(format!("-{signal}"))
        .arg(pid.to_string())
        .status()?;
    if !status.success() {
        anyhow::bail!("failed to signal pid {pid} with SIG{signal}");
    }
    Ok(())
}
