//! Persistent VM state store (component I): one directory per named VM
//! under the configured VM-store path, each holding a `config` TOML file
//! (the single-writer lock target) and one qcow2 overlay per disk.
//!
//! Frontend overlay files are named
//! `<vm-name-encoded>-<disk-index>-<backend-name-encoded>`, which is why
//! backend names reserve `-` as an escaped character — see
//! [`crate::util::storage_safe_encode`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::{CreateConfig, ImageSpec};
use crate::disk::qemu_img;
use crate::error::{TransientError, TransientResult};
use crate::images::{BackendStore, ImageProtocol};
use crate::util::{self, storage_safe_decode, storage_safe_encode, FileLock};

/// One overlay disk belonging to a VM.
#[derive(Debug, Clone)]
pub struct FrontendImage {
    pub path: PathBuf,
    pub disk_index: u32,
    pub backend_name: String,
}

/// A loaded VM's on-disk state. Holding one of these with `lock` set means
/// the `config` file's advisory lock is held for the value's lifetime.
pub struct VmPersistentState {
    pub name: String,
    pub dir: PathBuf,
    pub config: CreateConfig,
    pub images: Vec<FrontendImage>,
    lock: Option<FileLock>,
}

impl VmPersistentState {
    fn config_path(dir: &Path) -> PathBuf {
        dir.join("config")
    }

    /// The disk at index 0 — the boot image every VM has exactly one of.
    pub fn primary_image(&self) -> Option<&FrontendImage> {
        self.images.iter().find(|i| i.disk_index == 0)
    }

    fn load(name: &str, dir: PathBuf, lock: Option<FileLock>) -> TransientResult<Self> {
        let config: CreateConfig = crate::config::load_config_file(&Self::config_path(&dir))?;
        let mut images = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let encoded = file_name.to_string_lossy();
            if encoded == "config" || encoded.starts_with('.') {
                continue;
            }
            if let Some(image) = parse_frontend_filename(&encoded) {
                images.push(FrontendImage {
                    path: entry.path(),
                    disk_index: image.0,
                    backend_name: image.1,
                });
            }
        }
        images.sort_by_key(|i| i.disk_index);
        Ok(VmPersistentState {
            name: name.to_string(),
            dir,
            config,
            images,
            lock,
        })
    }
}

/// `<vm-name-encoded>-<disk-index>-<backend-name-encoded>`
fn frontend_filename(vm_name: &str, disk_index: u32, backend_name: &str) -> String {
    format!(
        "{}-{}-{}",
        storage_safe_encode(vm_name),
        disk_index,
        storage_safe_encode(backend_name)
    )
}

fn parse_frontend_filename(encoded: &str) -> Option<(u32, String)> {
    let mut parts = encoded.splitn(3, '-');
    let _vm_name = parts.next()?;
    let index: u32 = parts.next()?.parse().ok()?;
    let backend_encoded = parts.next()?;
    Some((index, storage_safe_decode(backend_encoded)))
}

pub struct VmStore {
    path: PathBuf,
    backend: BackendStore,
}

impl VmStore {
    pub fn new(path: impl Into<PathBuf>, backend: BackendStore) -> Self {
        VmStore {
            path: path.into(),
            backend,
        }
    }

    pub fn backend(&self) -> &BackendStore {
        &self.backend
    }

    fn vm_dir(&self, name: &str) -> PathBuf {
        self.path.join(storage_safe_encode(name))
    }

    pub fn exists(&self, name: &str) -> bool {
        self.vm_dir(name).exists()
    }

    /// Create a new VM's persistent state: retrieve/reuse each requested
    /// backend image, create one qcow2 overlay per disk backed by it, write
    /// the config, then atomically publish the whole directory via a
    /// dotfile-prefixed temp dir and rename.
    ///
    /// `name` is generated (a uuid4) if `create.name` is unset.
    pub async fn create(
        &self,
        mut create: CreateConfig,
        protocols: &[Box<dyn ImageProtocol>],
    ) -> TransientResult<VmPersistentState> {
        let name = create
            .name
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        create.name = Some(name.clone());

        let final_dir = self.vm_dir(&name);
        if final_dir.exists() {
            return Err(TransientError::validation(format!(
                "a VM named `{name}` already exists"
            )));
        }

        std::fs::create_dir_all(&self.path)?;
        let tmp_dir = tempfile::Builder::new()
            .prefix(".")
            .tempdir_in(&self.path)
            .map_err(|e| TransientError::retrieval("creating vm state temp dir", e))?;

        let mut images = Vec::new();
        for (index, image_str) in create.image.iter().enumerate() {
            let spec: ImageSpec = image_str.parse()?;
            let backend_image = self.backend.retrieve(&spec, protocols).await?;
            let overlay_name = frontend_filename(&name, index as u32, &spec.name);
            let overlay_path = tmp_dir.path().join(&overlay_name);
            let backing_path = backend_image.path.clone();
            tokio::task::spawn_blocking(move || qemu_img::create_overlay(&backing_path, &overlay_path))
                .await
                .map_err(|e| TransientError::Internal(format!("overlay create task: {e}")))??;
            images.push(FrontendImage {
                path: tmp_dir.path().join(&overlay_name),
                disk_index: index as u32,
                backend_name: spec.name,
            });
        }

        let toml_text = toml::to_string_pretty(&create)
            .map_err(|e| TransientError::Internal(format!("serializing vm config: {e}")))?;
        std::fs::write(VmPersistentState::config_path(tmp_dir.path()), toml_text)?;

        let tmp_path = tmp_dir.into_path();
        std::fs::rename(&tmp_path, &final_dir).inspect_err(|_| {
            let _ = std::fs::remove_dir_all(&tmp_path);
        })?;

        for image in &mut images {
            image.path = final_dir.join(image.path.file_name().expect("overlay has a name"));
        }

        Ok(VmPersistentState {
            name,
            dir: final_dir,
            config: create,
            images,
            lock: None,
        })
    }

    /// Lock and load a VM's state by name. Per the store's single-writer
    /// discipline, both "no such VM" and "lock acquisition timed out" are
    /// reported as the same distinguished lock-held error.
    pub fn lock_by_name(&self, name: &str, timeout: Option<Duration>) -> TransientResult<VmPersistentState> {
        let dir = self.vm_dir(name);
        let config_path = VmPersistentState::config_path(&dir);
        if !config_path.exists() {
            return Err(TransientError::LockHeldElsewhere { path: config_path });
        }
        let lock = util::lock_file(&config_path, timeout, Duration::from_millis(200))?;
        VmPersistentState::load(name, dir, Some(lock))
    }

    /// Best-effort read without taking the lock — used for listing.
    pub fn unlocked_snapshot(&self, name: &str) -> TransientResult<VmPersistentState> {
        let dir = self.vm_dir(name);
        VmPersistentState::load(name, dir, None)
    }

    /// Lock, then remove a VM's entire state directory.
    pub fn rm_by_name(&self, name: &str, timeout: Option<Duration>) -> TransientResult<()> {
        let state = self.lock_by_name(name, timeout)?;
        let dir = state.dir.clone();
        drop(state);
        std::fs::remove_dir_all(dir)?;
        Ok(())
    }

    /// Remove a VM's state directory without locking it first — for
    /// operator-forced cleanup when the normal lock path can't make
    /// progress.
    pub fn force_rm(&self, name: &str) -> TransientResult<()> {
        let dir = self.vm_dir(name);
        if !dir.exists() {
            return Err(TransientError::validation(format!("no such VM `{name}`")));
        }
        std::fs::remove_dir_all(dir)?;
        Ok(())
    }

    /// Iterate over every VM whose lock can be acquired immediately,
    /// silently skipping entries that are locked elsewhere or otherwise
    /// unreadable (a stale or concurrently-mutated entry).
    pub fn iter_states(&self) -> TransientResult<Vec<VmPersistentState>> {
        let mut out = Vec::new();
        if !self.path.exists() {
            return Ok(out);
        }
        for entry in std::fs::read_dir(&self.path)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let encoded = file_name.to_string_lossy();
            if encoded.starts_with('.') {
                continue;
            }
            let name = storage_safe_decode(&encoded);
            match self.lock_by_name(&name, Some(Duration::ZERO)) {
                Ok(state) => out.push(state),
                Err(TransientError::LockHeldElsewhere { .. }) => continue,
                Err(e) => {
                    tracing::debug!(name = %name, error = %e, "skipping unreadable vm state");
                    continue;
                }
            }
        }
        Ok(out)
    }

    /// Flatten a VM's primary overlay into a new backend image.
    pub async fn commit(&self, state: &VmPersistentState, new_name: &str) -> TransientResult<()> {
        let primary = state
            .primary_image()
            .ok_or_else(|| TransientError::validation("VM has no primary disk to commit"))?;
        self.backend.commit(&primary.path, new_name).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frontend_filename_roundtrips_through_encoding() {
        let name = frontend_filename("my-vm", 2, "cent-os");
        let (index, backend) = parse_frontend_filename(&name).unwrap();
        assert_eq!(index, 2);
        assert_eq!(backend, "cent-os");
    }

    #[test]
    fn vm_dir_uses_encoded_name() {
        let store = VmStore::new("/data/vms", BackendStore::new("/data/backend"));
        assert_eq!(store.vm_dir("with-dash"), PathBuf::from("/data/vms/with%2Ddash"));
    }
}
