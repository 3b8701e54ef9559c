//! Wrapper around the `qemu-img` command-line tool.
//!
//! The tool itself (image-format conversion) is an external collaborator
//! and not re-specified here; this module only shells out to it for the
//! two operations the rest of the crate needs: flattening a COW chain on
//! commit, and reading a disk's metadata as JSON.

use std::path::Path;
use std::process::Command;

use serde::Deserialize;

use crate::error::{TransientError, TransientResult};

/// Check if `qemu-img` is available on the system.
pub fn is_available() -> bool {
    Command::new("qemu-img")
        .arg("--version")
        .output()
        .is_ok_and(|o| o.status.success())
}

fn require_qemu_img() -> TransientResult<()> {
    if !is_available() {
        return Err(TransientError::validation(
            "qemu-img is required but not found. \
             Install it via: apt install qemu-utils (Debian/Ubuntu), \
             dnf install qemu-img (Fedora/RHEL), \
             or brew install qemu (macOS).",
        ));
    }
    Ok(())
}

/// Flatten a QCOW2 file with a backing chain into a single standalone file
/// with no backing reference. Equivalent to:
/// `qemu-img convert -O qcow2 <src> <dst>`.
pub fn convert(src: &Path, dst: &Path) -> TransientResult<()> {
    require_qemu_img()?;

    tracing::info!(src = %src.display(), dst = %dst.display(), "flattening qcow2 disk image");

    let output = Command::new("qemu-img")
        .args(["convert", "-O", "qcow2"])
        .arg(src)
        .arg(dst)
        .output()
        .map_err(|e| TransientError::retrieval("running qemu-img convert", e))?;

    if !output.status.success() {
        return Err(TransientError::subprocess("qemu-img convert", &output));
    }
    Ok(())
}

/// Create a full copy of a disk image (no COW, standalone, no backing
/// reference).
pub fn full_copy(src: &Path, dst: &Path) -> TransientResult<()> {
    convert(src, dst)
}

/// Create a new qcow2 overlay backed by `backing_file`, the mechanism
/// behind every frontend (per-VM) image: a thin COW layer on top of a
/// read-only backend image.
pub fn create_overlay(backing_file: &Path, dst: &Path) -> TransientResult<()> {
    require_qemu_img()?;

    let output = Command::new("qemu-img")
        .args(["create", "-f", "qcow2", "-F", "qcow2"])
        .arg(format!("-obacking_file={}", backing_file.display()))
        .arg(dst)
        .output()
        .map_err(|e| TransientError::retrieval("running qemu-img create (overlay)", e))?;

    if !output.status.success() {
        return Err(TransientError::subprocess("qemu-img create", &output));
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct RawQemuImgInfo {
    #[serde(rename = "virtual-size")]
    virtual_size: u64,
    #[serde(rename = "actual-size", default)]
    actual_size: u64,
    format: String,
}

pub struct DiskInfo {
    pub virtual_size: u64,
    pub actual_size: u64,
    pub format: String,
}

/// `qemu-img info -U --output=json <path>`, parsed.
pub fn info(path: &Path) -> TransientResult<DiskInfo> {
    require_qemu_img()?;

    let output = Command::new("qemu-img")
        .args(["info", "-U", "--output=json"])
        .arg(path)
        .output()
        .map_err(|e| TransientError::retrieval("running qemu-img info", e))?;

    if !output.status.success() {
        return Err(TransientError::subprocess("qemu-img info", &output));
    }

    let raw: RawQemuImgInfo = serde_json::from_slice(&output.stdout)
        .map_err(|e| TransientError::Internal(format!("parsing qemu-img info output: {e}")))?;

    Ok(DiskInfo {
        virtual_size: raw.virtual_size,
        actual_size: raw.actual_size,
        format: raw.format,
    })
}

/// Create a new, empty qcow2 image of the given virtual `size_bytes`.
pub fn create(path: &Path, size_bytes: u64) -> TransientResult<()> {
    require_qemu_img()?;

    let output = Command::new("qemu-img")
        .args(["create", "-f", "qcow2"])
        .arg(path)
        .arg(size_bytes.to_string())
        .output()
        .map_err(|e| TransientError::retrieval("running qemu-img create", e))?;

    if !output.status.success() {
        return Err(TransientError::subprocess("qemu-img create", &output));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_availability_without_panicking() {
        let _ = is_available();
    }
}
