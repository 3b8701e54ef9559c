//! `vagrant` image protocol: resolve a `name:version` reference against the
//! Vagrant Cloud catalog API, pick the `libvirt` provider's box tarball, and
//! stream-copy the member ending `box.img` out of it.

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::config::{ImageSpec, Protocol};
use crate::error::{TransientError, TransientResult};

use super::protocol::ImageProtocol;

const VAGRANT_CLOUD_BASE: &str = "https://vagrantcloud.com/api/v1/box";

#[derive(Default)]
pub struct VagrantProtocol;

#[derive(Debug, Deserialize)]
struct BoxMetadata {
    versions: Vec<BoxVersion>,
}

#[derive(Debug, Deserialize)]
struct BoxVersion {
    version: String,
    providers: Vec<BoxProvider>,
}

#[derive(Debug, Deserialize)]
struct BoxProvider {
    name: String,
    download_url: String,
}

#[async_trait]
impl ImageProtocol for VagrantProtocol {
    fn matches(&self, protocol: Protocol) -> bool {
        protocol == Protocol::Vagrant
    }

    async fn retrieve(
        &self,
        spec: &ImageSpec,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> TransientResult<()> {
        let (owner_name, version) = spec
            .source
            .rsplit_once(':')
            .ok_or_else(|| {
                TransientError::validation(format!(
                    "invalid vagrant box reference `{}`: expected name:version",
                    spec.source
                ))
            })?;

        let download_url = fetch_provider_url(owner_name, version).await?;

        let tmp = tempfile::NamedTempFile::new()?;
        let tmp_path = tmp.path().to_path_buf();
        download_to_file(&download_url, &tmp_path).await?;

        let box_img = tokio::task::spawn_blocking(move || extract_box_img(&tmp_path))
            .await
            .map_err(|e| TransientError::Internal(format!("vagrant extraction task: {e}")))??;

        sink.write_all(&box_img).await?;
        Ok(())
    }
}

async fn fetch_provider_url(owner_name: &str, version: &str) -> TransientResult<String> {
    let url = format!("{VAGRANT_CLOUD_BASE}/{owner_name}");
    let metadata: BoxMetadata = reqwest::get(&url)
        .await
        .map_err(|e| TransientError::retrieval(format!("GET {url}"), e))?
        .json()
        .await
        .map_err(|e| TransientError::retrieval(format!("parsing metadata from {url}"), e))?;

    let matched_version = metadata
        .versions
        .into_iter()
        .find(|v| v.version == version)
        .ok_or_else(|| {
            TransientError::validation(format!(
                "no version `{version}` for vagrant box `{owner_name}`"
            ))
        })?;

    matched_version
        .providers
        .into_iter()
        .find(|p| p.name == "libvirt")
        .map(|p| p.download_url)
        .ok_or_else(|| {
            TransientError::validation(format!(
                "vagrant box `{owner_name}:{version}` has no libvirt provider"
            ))
        })
}

async fn download_to_file(url: &str, dest: &std::path::Path) -> TransientResult<()> {
    let mut response = reqwest::get(url)
        .await
        .map_err(|e| TransientError::retrieval(format!("GET {url}"), e))?;
    if !response.status().is_success() {
        return Err(TransientError::validation(format!(
            "HTTP {} downloading vagrant box from {url}",
            response.status()
        )));
    }

    let mut file = tokio::fs::File::create(dest).await?;
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| TransientError::retrieval("reading vagrant box tarball", e))?
    {
        file.write_all(&chunk).await?;
    }
    Ok(())
}

/// Locate the tar member whose path ends `box.img` and return its raw
/// bytes, unmodified (no recompression).
fn extract_box_img(tar_path: &std::path::Path) -> TransientResult<Vec<u8>> {
    let file = std::fs::File::open(tar_path)?;
    let mut archive = tar::Archive::new(file);
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.to_path_buf();
        if path.to_string_lossy().ends_with("box.img") {
            let mut buf = Vec::new();
            std::io::Read::read_to_end(&mut entry, &mut buf)?;
            return Ok(buf);
        }
    }
    Err(TransientError::validation(
        "vagrant box tarball has no member ending box.img",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_box_img_member() {
        let dir = tempfile::tempdir().unwrap();
        let tar_path = dir.path().join("box.tar");
        {
            let file = std::fs::File::create(&tar_path).unwrap();
            let mut builder = tar::Builder::new(file);
            let data = b"fake disk bytes";
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_cksum();
            builder
                .append_data(&mut header, "metadata/box.img", &data[..])
                .unwrap();
            builder.finish().unwrap();
        }

        let bytes = extract_box_img(&tar_path).unwrap();
        assert_eq!(bytes, b"fake disk bytes");
    }
}
