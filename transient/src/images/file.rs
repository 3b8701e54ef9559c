//! `file` image protocol: open a local path, stream to the sink through
//! the auto-detecting decompressor.

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::config::{ImageSpec, Protocol};
use crate::error::{TransientError, TransientResult};
use crate::util::StreamDecompressor;

use super::protocol::ImageProtocol;

#[derive(Default)]
pub struct FileProtocol;

#[async_trait]
impl ImageProtocol for FileProtocol {
    fn matches(&self, protocol: Protocol) -> bool {
        protocol == Protocol::File
    }

    async fn retrieve(
        &self,
        spec: &ImageSpec,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> TransientResult<()> {
        let mut src = tokio::fs::File::open(&spec.source)
            .await
            .map_err(|e| TransientError::retrieval(format!("opening {}", spec.source), e))?;

        let mut decompressor = StreamDecompressor::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = src.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            let out = decompressor.decompress(&buf[..n])?;
            if !out.is_empty() {
                sink.write_all(&out).await?;
            }
        }
        let tail = decompressor.finish()?;
        if !tail.is_empty() {
            sink.write_all(&tail).await?;
        }
        Ok(())
    }
}
