//! Backend image store (component G): maps a logical image name to a
//! read-only file in the backend directory, with protocol-pluggable
//! retrieval, atomic promotion, and content listing.

pub mod file;
pub mod http;
pub mod protocol;
pub mod vagrant;

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::{ImageSpec, Protocol};
use crate::disk::qemu_img;
use crate::error::{TransientError, TransientResult};
use crate::util::{self, storage_safe_decode, storage_safe_encode};

pub use protocol::{default_protocols, ImageProtocol};

#[derive(Debug, Clone)]
pub struct BackendImage {
    pub name: String,
    pub path: PathBuf,
    pub actual_size: u64,
    pub virtual_size: u64,
    pub format: String,
}

pub struct BackendStore {
    dir: PathBuf,
}

impl BackendStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        BackendStore { dir: dir.into() }
    }

    pub fn final_path(&self, name: &str) -> PathBuf {
        self.dir.join(storage_safe_encode(name))
    }

    fn working_path(&self, name: &str) -> PathBuf {
        self.dir.join(".working").join(storage_safe_encode(name))
    }

    pub fn exists(&self, name: &str) -> bool {
        self.final_path(name).exists()
    }

    /// Retrieval algorithm: at most one concurrent retrieval per backend
    /// path, and the final file never appears partially written.
    pub async fn retrieve(
        &self,
        spec: &ImageSpec,
        protocols: &[Box<dyn ImageProtocol>],
    ) -> TransientResult<BackendImage> {
        let final_path = self.final_path(&spec.name);
        if final_path.exists() {
            return self.describe(&spec.name);
        }

        let work_path = self.working_path(&spec.name);
        let work_path_for_lock = work_path.clone();
        let _lock = tokio::task::spawn_blocking(move || {
            util::lock_file(&work_path_for_lock, None, Duration::from_millis(200))
        })
        .await
        .map_err(|e| TransientError::Internal(format!("lock task: {e}")))??;

        // Another process may have finished while we waited for the lock.
        if final_path.exists() {
            return self.describe(&spec.name);
        }

        let protocol = protocol::protocol_for(protocols, spec.protocol).ok_or_else(|| {
            TransientError::validation(format!("unknown protocol for image `{}`", spec.name))
        })?;

        {
            let mut sink = tokio::fs::File::create(&work_path).await?;
            protocol.retrieve(spec, &mut sink).await?;
        }

        tokio::fs::rename(&work_path, &final_path).await?;
        set_readonly(&final_path)?;

        self.describe(&spec.name)
    }

    /// Promote a VM's primary overlay to a new backend image: flatten via
    /// the qcow2 converter, set read-only, atomic rename.
    pub async fn commit(&self, overlay: &Path, new_name: &str) -> TransientResult<BackendImage> {
        let final_path = self.final_path(new_name);
        if final_path.exists() {
            return Err(TransientError::validation(format!(
                "backend image `{new_name}` already exists"
            )));
        }

        let work_path = self.working_path(new_name);
        let work_path_for_lock = work_path.clone();
        let _lock = tokio::task::spawn_blocking(move || {
            util::lock_file(&work_path_for_lock, None, Duration::from_millis(200))
        })
        .await
        .map_err(|e| TransientError::Internal(format!("lock task: {e}")))??;

        if let Some(parent) = work_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let overlay = overlay.to_path_buf();
        let work_path_for_convert = work_path.clone();
        tokio::task::spawn_blocking(move || qemu_img::convert(&overlay, &work_path_for_convert))
            .await
            .map_err(|e| TransientError::Internal(format!("qemu-img convert task: {e}")))??;

        tokio::fs::rename(&work_path, &final_path).await?;
        set_readonly(&final_path)?;
        self.describe(new_name)
    }

    pub fn delete(&self, name: &str) -> TransientResult<()> {
        std::fs::remove_file(self.final_path(name))?;
        Ok(())
    }

    pub fn list(&self, filter: Option<&str>) -> TransientResult<Vec<BackendImage>> {
        let mut out = Vec::new();
        if !self.dir.exists() {
            return Ok(out);
        }
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let encoded = file_name.to_string_lossy();
            if encoded.starts_with('.') {
                continue;
            }
            let name = storage_safe_decode(&encoded);
            if let Some(filter) = filter {
                if name != filter {
                    continue;
                }
            }
            out.push(self.describe(&name)?);
        }
        Ok(out)
    }

    /// Disk metadata via `qemu-img info -U --output=json` — the external
    /// tool call itself is out of scope; only its JSON contract is relied
    /// upon here, same as the original implementation's `_get_disk_info`.
    fn describe(&self, name: &str) -> TransientResult<BackendImage> {
        let path = self.final_path(name);
        let info = qemu_img::info(&path)?;
        Ok(BackendImage {
            name: name.to_string(),
            path,
            actual_size: info.actual_size,
            virtual_size: info.virtual_size,
            format: info.format,
        })
    }
}

fn set_readonly(path: &Path) -> TransientResult<()> {
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_readonly(true);
    std::fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn final_path_uses_encoded_name() {
        let store = BackendStore::new("/data/backend");
        assert_eq!(
            store.final_path("with-dash"),
            PathBuf::from("/data/backend/with%2Ddash")
        );
    }
}
