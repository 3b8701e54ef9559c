//! `http` image protocol: stream the URL body, feeding a
//! `Content-Length`-driven progress counter when available, always through
//! the auto-detecting decompressor.

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::config::{ImageSpec, Protocol};
use crate::error::{TransientError, TransientResult};
use crate::util::StreamDecompressor;

use super::protocol::ImageProtocol;

#[derive(Default)]
pub struct HttpProtocol;

#[async_trait]
impl ImageProtocol for HttpProtocol {
    fn matches(&self, protocol: Protocol) -> bool {
        protocol == Protocol::Http
    }

    async fn retrieve(
        &self,
        spec: &ImageSpec,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> TransientResult<()> {
        let client = reqwest::Client::new();
        let response = client
            .get(&spec.source)
            .send()
            .await
            .map_err(|e| TransientError::retrieval(format!("GET {}", spec.source), e))?;

        if !response.status().is_success() {
            return Err(TransientError::validation(format!(
                "HTTP {} retrieving {}",
                response.status(),
                spec.source
            )));
        }

        let total = response.content_length();
        tracing::debug!(url = %spec.source, ?total, "starting http image retrieval");

        let mut decompressor = StreamDecompressor::new();
        let mut received: u64 = 0;
        let mut stream = response;
        while let Some(chunk) = stream
            .chunk()
            .await
            .map_err(|e| TransientError::retrieval("reading http body", e))?
        {
            received += chunk.len() as u64;
            let out = decompressor.decompress(&chunk)?;
            if !out.is_empty() {
                sink.write_all(&out).await?;
            }
        }
        let tail = decompressor.finish()?;
        if !tail.is_empty() {
            sink.write_all(&tail).await?;
        }
        tracing::debug!(received, "http image retrieval complete");
        Ok(())
    }
}
