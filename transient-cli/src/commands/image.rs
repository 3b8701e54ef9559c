use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Subcommand};
use comfy_table::{presets::UTF8_FULL, Table};

use crate::cli::{GlobalFlags, ImageOptions};
use crate::util::prompt_yes_no;

#[derive(Subcommand, Debug)]
pub enum ImageCommand {
    /// List backend and frontend (per-vm) images
    Ls(LsArgs),
    /// Build a new backend image from an Imagefile
    Build(BuildArgs),
    /// Remove a backend image
    Rm(RmArgs),
}

#[derive(Args, Debug)]
pub struct LsArgs {
    #[command(flatten)]
    pub images: ImageOptions,

    /// Only show this image name
    #[arg(long = "name")]
    pub name: Option<String>,
}

#[derive(Args, Debug)]
pub struct BuildArgs {
    /// Imagefile to build from; defaults to `Imagefile` in the working directory
    #[arg(short = 'f', long = "file")]
    pub file: Option<PathBuf>,

    #[arg(long = "image-backend")]
    pub image_backend: Option<PathBuf>,

    #[arg(long = "ssh-timeout")]
    pub ssh_timeout: Option<u64>,

    #[arg(long = "qmp-timeout")]
    pub qmp_timeout: Option<u64>,

    /// Write the finished image to `build-dir` instead of the backend store
    #[arg(long = "local")]
    pub local: bool,

    /// Name for the resulting image
    pub name: String,

    /// Working directory for the build
    pub build_dir: PathBuf,
}

#[derive(Args, Debug)]
pub struct RmArgs {
    /// Name of the backend image to remove
    pub name: String,

    #[command(flatten)]
    pub images: ImageOptions,

    #[arg(short = 'f', long = "force")]
    pub force: bool,
}

pub async fn execute(cmd: ImageCommand, global: &GlobalFlags) -> anyhow::Result<()> {
    match cmd {
        ImageCommand::Ls(args) => ls(args, global),
        ImageCommand::Build(args) => build(args, global).await,
        ImageCommand::Rm(args) => rm(args, global),
    }
}

fn ls(args: LsArgs, global: &GlobalFlags) -> anyhow::Result<()> {
    let backend = transient::images::BackendStore::new(global.backend_dir(&args.images));
    let vmstore = transient::vmstore::VmStore::new(
        global.vmstore_dir(&args.images),
        transient::images::BackendStore::new(global.backend_dir(&args.images)),
    );

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["KIND", "NAME", "SIZE", "FORMAT", "OWNER"]);

    for image in backend.list(args.name.as_deref())? {
        table.add_row(vec![
            "backend".to_string(),
            image.name,
            transient::util::format_bytes(image.actual_size),
            image.format,
            "-".to_string(),
        ]);
    }

    for state in vmstore.iter_states()? {
        for frontend in &state.images {
            if let Some(filter) = &args.name {
                if &frontend.backend_name != filter {
                    continue;
                }
            }
            let size = std::fs::metadata(&frontend.path).map(|m| m.len()).unwrap_or(0);
            table.add_row(vec![
                "frontend".to_string(),
                frontend.backend_name.clone(),
                transient::util::format_bytes(size),
                "qcow2".to_string(),
                state.name.clone(),
            ]);
        }
    }

    println!("{table}");
    Ok(())
}

async fn build(args: BuildArgs, global: &GlobalFlags) -> anyhow::Result<()> {
    let file = args.file.unwrap_or_else(|| PathBuf::from("Imagefile"));
    let source = std::fs::read_to_string(&file)
        .map_err(|e| anyhow::anyhow!("reading Imagefile {}: {e}", file.display()))?;
    let program = transient::build::parse_program(&source)?;

    let backend_dir = args
        .image_backend
        .unwrap_or_else(|| global.data_root().join("backend"));
    let ctx = transient::build::BuildContext {
        backend: transient::images::BackendStore::new(backend_dir),
        protocols: transient::images::default_protocols(),
        kernel: global.maintenance_kernel(),
        identity_file: global.identity_file()?,
        ssh_timeout: Duration::from_secs(args.ssh_timeout.unwrap_or(60)),
        qmp_timeout: Duration::from_secs(args.qmp_timeout.unwrap_or(60)),
    };

    let destination = transient::build::build(&program, &ctx, &args.name, args.local, &args.build_dir).await?;
    println!("{}", destination.display());
    Ok(())
}

fn rm(args: RmArgs, global: &GlobalFlags) -> anyhow::Result<()> {
    let backend = transient::images::BackendStore::new(global.backend_dir(&args.images));
    if !args.force && !prompt_yes_no(&format!("remove image `{}`?", args.name))? {
        return Ok(());
    }
    backend.delete(&args.name)?;
    println!("removed {}", args.name);
    Ok(())
}
