//! `transient`: command-line entry point. Parses arguments, wires up
//! logging, races the dispatched command against a top-level SIGINT, and
//! maps the result onto a process exit code.

mod cli;
mod commands;
mod util;

use clap::{CommandFactory, Parser};
use cli::{Cli, Command};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Command::Completions { shell } = cli.command {
        clap_complete::generate(shell, &mut Cli::command(), "transient", &mut std::io::stdout());
        return;
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli::verbosity_filter(cli.global.verbose)));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let code = tokio::select! {
        result = dispatch(cli) => {
            match result {
                Ok(code) => code,
                Err(err) => {
                    report_error(&err);
                    exit_code_for(&err)
                }
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("interrupted");
            1
        }
    };

    std::process::exit(code);
}

async fn dispatch(cli: Cli) -> anyhow::Result<i32> {
    let global = cli.global;
    match cli.command {
        Command::Run(args) => commands::run::execute(args, &global).await,
        Command::Create(args) => commands::create::execute(args, &global).await.map(|()| 0),
        Command::Start(args) => commands::start::execute(args, &global).await,
        Command::Rm(args) => commands::rm::execute(args, &global).await.map(|()| 0),
        Command::Stop(args) => commands::stop::execute(args, &global).await.map(|()| 0),
        Command::Ssh(args) => commands::ssh::execute(args, &global).await,
        Command::Ps(args) => commands::ps::execute(args, &global).await.map(|()| 0),
        Command::Commit(args) => commands::commit::execute(args, &global).await.map(|()| 0),
        Command::Cp(args) => commands::cp::execute(args, &global).await.map(|()| 0),
        Command::Image(cmd) => commands::image::execute(cmd, &global).await.map(|()| 0),
        Command::Completions { .. } => unreachable!("handled before dispatch"),
    }
}

fn report_error(err: &anyhow::Error) {
    eprintln!("transient: {err}");
}

/// Recover a `TransientError`'s exit-code policy through `anyhow`'s type
/// erasure, defaulting to 1 for errors raised directly by this crate
/// (`anyhow::bail!` and friends).
fn exit_code_for(err: &anyhow::Error) -> i32 {
    err.downcast_ref::<transient::TransientError>()
        .map(|e| e.exit_code())
        .unwrap_or(1)
}
