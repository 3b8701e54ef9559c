//! Image-build interpreter (component J): validates an Imagefile's
//! instruction ordering, then executes it against a maintenance-VM-mounted
//! disk via [`crate::editor::ImageEditor`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::build::grammar::{DiskLabel, Instruction, PartitionFlag};
use crate::config::ImageSpec;
use crate::disk::qemu_img;
use crate::editor::{ImageEditor, MaintenanceKernel};
use crate::error::{TransientError, TransientResult};
use crate::images::{BackendStore, ImageProtocol};

/// Validate instruction ordering and multiplicity:
/// - exactly one `FROM`, first;
/// - `DISK`/`PARTITION` only for from-scratch images (`FROM scratch`),
///   immediately after `FROM`, `DISK` before `PARTITION`;
/// - at least one `PARTITION` mounting at `/` when building from scratch.
pub fn validate(program: &[Instruction]) -> TransientResult<()> {
    let from_count = program.iter().filter(|i| matches!(i, Instruction::From { .. })).count();
    if from_count != 1 {
        return Err(TransientError::validation(
            "exactly one FROM instruction must appear per Imagefile",
        ));
    }

    let Instruction::From { source } = &program[0] else {
        return Err(TransientError::validation(
            "FROM instruction must appear before any other instructions",
        ));
    };
    let from_scratch = source == "scratch";

    let disk_count = program.iter().filter(|i| matches!(i, Instruction::Disk { .. })).count();
    if disk_count > 1 {
        return Err(TransientError::validation(
            "only one DISK instruction can appear in an Imagefile",
        ));
    }
    if from_scratch && disk_count != 1 {
        return Err(TransientError::validation(
            "exactly one DISK instruction must appear in images built from scratch",
        ));
    }
    if !from_scratch && disk_count != 0 {
        return Err(TransientError::validation(
            "DISK and PARTITION instructions can only appear on images built from scratch",
        ));
    }

    let partition_count = program.iter().filter(|i| matches!(i, Instruction::Partition { .. })).count();
    if from_scratch && partition_count == 0 {
        return Err(TransientError::validation(
            "at least one PARTITION instruction must appear in images built from scratch",
        ));
    }
    if !from_scratch && partition_count != 0 {
        return Err(TransientError::validation(
            "DISK and PARTITION instructions can only appear on images built from scratch",
        ));
    }

    let mounts_root = program.iter().any(|i| {
        matches!(i, Instruction::Partition { mount: Some(m), .. } if m == "/")
    });
    if from_scratch && !mounts_root {
        return Err(TransientError::validation(
            "at least one PARTITION instruction must mount at /",
        ));
    }

    if from_scratch {
        let mut seen_disk = false;
        let mut seen_partition = false;
        let mut seen_other = false;
        for instr in &program[1..] {
            match instr {
                Instruction::Disk { .. } => {
                    if seen_disk || seen_partition || seen_other {
                        return Err(TransientError::validation(
                            "DISK instruction must appear immediately after FROM",
                        ));
                    }
                    seen_disk = true;
                }
                Instruction::Partition { .. } => {
                    if !seen_disk || seen_other {
                        return Err(TransientError::validation(
                            "PARTITION instructions must appear immediately after DISK",
                        ));
                    }
                    seen_partition = true;
                }
                _ => {
                    seen_other = true;
                }
            }
        }
    }

    Ok(())
}

pub struct BuildContext {
    pub backend: BackendStore,
    pub protocols: Vec<Box<dyn ImageProtocol>>,
    pub kernel: MaintenanceKernel,
    pub identity_file: PathBuf,
    pub ssh_timeout: Duration,
    pub qmp_timeout: Duration,
}

/// Run an Imagefile's instructions against a fresh working image, producing
/// the finished disk at `destination`.
pub async fn build(
    program: &[Instruction],
    ctx: &BuildContext,
    name: &str,
    local: bool,
    build_dir: &Path,
) -> TransientResult<PathBuf> {
    validate(program)?;

    let Instruction::From { source } = &program[0] else {
        unreachable!("validated above");
    };
    let from_scratch = source == "scratch";

    std::fs::create_dir_all(build_dir)?;
    let working = build_dir.join(format!(".{name}.building.qcow2"));

    if from_scratch {
        let disk_size = program
            .iter()
            .find_map(|i| match i {
                Instruction::Disk { size_bytes, .. } => Some(*size_bytes),
                _ => None,
            })
            .expect("validated: exactly one DISK instruction");
        let working_for_create = working.clone();
        tokio::task::spawn_blocking(move || qemu_img::create(&working_for_create, disk_size))
            .await
            .map_err(|e| TransientError::Internal(format!("qemu-img create task: {e}")))??;
    } else {
        let spec: ImageSpec = source.parse()?;
        let backend_image = ctx.backend.retrieve(&spec, &ctx.protocols).await?;
        let backing_path = backend_image.path.clone();
        let working_for_copy = working.clone();
        tokio::task::spawn_blocking(move || qemu_img::full_copy(&backing_path, &working_for_copy))
            .await
            .map_err(|e| TransientError::Internal(format!("qemu-img copy task: {e}")))??;
    }

    let mut editor = ImageEditor::open(
        &working,
        &ctx.kernel,
        ctx.identity_file.clone(),
        ctx.qmp_timeout,
        ctx.ssh_timeout,
        from_scratch, // skip the normal root-probe mount; we partition first
    )
    .await?;

    if from_scratch {
        run_disk_and_partitions(&editor, program).await?;
    }

    for instr in program.iter().skip(1) {
        match instr {
            Instruction::Disk { .. } | Instruction::Partition { .. } | Instruction::From { .. } => continue,
            Instruction::Run { command } => {
                editor.run_command_in_guest(command, false).await?;
            }
            Instruction::Inspect => {
                tracing::info!("pausing for interactive inspection (INSPECT)");
            }
            Instruction::Copy { sources, destination } => {
                for src in sources {
                    editor.copy_in(Path::new(src), destination).await?;
                }
            }
            Instruction::Add { sources, destination } => {
                for src in sources {
                    if src.ends_with(".tar.gz") || src.ends_with(".tar.xz") {
                        let cmd = format!("bsdtar xfP - --directory={destination}");
                        editor.run_command_in_guest(&cmd, false).await?;
                    } else {
                        editor.copy_in(Path::new(src), destination).await?;
                    }
                }
            }
        }
    }

    editor.close(Duration::from_secs(30)).await?;

    let destination = if local {
        build_dir.join(format!("{name}.qcow2"))
    } else {
        ctx.backend.final_path(name)
    };
    std::fs::rename(&working, &destination)?;
    let mut perms = std::fs::metadata(&destination)?.permissions();
    perms.set_readonly(true);
    std::fs::set_permissions(&destination, perms)?;

    Ok(destination)
}

/// Build the `sfdisk` scripts for the `DISK` instruction and each
/// `PARTITION` instruction in order, then mount them shallowest-path-first.
async fn run_disk_and_partitions(editor: &ImageEditor, program: &[Instruction]) -> TransientResult<()> {
    for instr in program {
        if let Instruction::Disk { label, .. } = instr {
            let label_str = match label {
                DiskLabel::Gpt => "gpt",
                DiskLabel::Mbr => "dos",
            };
            let cmd = format!("echo 'label: {label_str}' | sfdisk /dev/sda");
            editor.run_command_in_guest(&cmd, false).await?;
        }
    }

    let mut mounts = Vec::new();
    for instr in program {
        if let Instruction::Partition {
            number,
            size_bytes,
            format,
            format_options,
            mount,
            flags,
        } = instr
        {
            let mut sfdisk_line = String::new();
            if let Some(size) = size_bytes {
                sfdisk_line.push_str(&format!("size={size},"));
            }
            if flags.contains(&PartitionFlag::Boot) {
                sfdisk_line.push_str("bootable,");
            }
            if flags.contains(&PartitionFlag::Efi) {
                sfdisk_line.push_str("type=U,");
            } else if flags.contains(&PartitionFlag::BiosGrub) {
                sfdisk_line.push_str("type=21686148-6449-6E6F-744E-656564454649,");
            } else if flags.is_empty() {
                sfdisk_line.push_str("type=L,");
            }

            let cmd = format!("echo '{sfdisk_line}' | sfdisk /dev/sda -a");
            editor.run_command_in_guest(&cmd, false).await?;

            if let Some(fmt) = format {
                let options = format_options.clone().unwrap_or_default();
                let mkfs_cmd = format!("mkfs.{fmt} {options} /dev/sda{number}");
                editor.run_command_in_guest(&mkfs_cmd, false).await?;
            }

            if let Some(mount) = mount {
                mounts.push((mount.clone(), *number));
            }
        }
    }

    mounts.sort_by_key(|(m, _)| m.matches('/').count());
    for (mount, number) in mounts {
        let mkdir_cmd = format!("mkdir -p /mnt{mount}");
        editor.run_command_in_guest(&mkdir_cmd, false).await?;
        let mount_cmd = format!("mount /dev/sda{number} /mnt{mount}");
        editor.run_command_in_guest(&mount_cmd, false).await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::grammar::parse_program;

    #[test]
    fn rejects_from_scratch_without_disk() {
        let program = parse_program("FROM scratch\nPARTITION 1 MOUNT /\n").unwrap();
        assert!(validate(&program).is_err());
    }

    #[test]
    fn rejects_partition_before_disk() {
        let program = parse_program(
            "FROM scratch\nPARTITION 1 MOUNT /\nDISK 2GB GPT\n",
        )
        .unwrap();
        assert!(validate(&program).is_err());
    }

    #[test]
    fn rejects_no_root_mount() {
        let program = parse_program(
            "FROM scratch\nDISK 2GB GPT\nPARTITION 1 MOUNT /boot\n",
        )
        .unwrap();
        assert!(validate(&program).is_err());
    }

    #[test]
    fn accepts_well_formed_from_scratch_program() {
        let program = parse_program(
            "FROM scratch\nDISK 2GB GPT\nPARTITION 1 MOUNT / FORMAT ext4\nRUN echo hi\n",
        )
        .unwrap();
        assert!(validate(&program).is_ok());
    }

    #[test]
    fn rejects_disk_on_non_scratch_image() {
        let program = parse_program("FROM centos/7\nDISK 2GB GPT\n").unwrap();
        assert!(validate(&program).is_err());
    }
}
