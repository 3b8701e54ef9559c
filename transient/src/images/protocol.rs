//! `ImageProtocol`: dynamic dispatch over pluggable image retrieval
//! backends, consulted in order from a static list — per the Design Notes,
//! modeled as a trait object rather than an enum match so new protocols can
//! be added without touching the store.

use async_trait::async_trait;
use tokio::io::AsyncWrite;

use crate::config::{ImageSpec, Protocol};
use crate::error::TransientResult;

#[async_trait]
pub trait ImageProtocol: Send + Sync {
    fn matches(&self, protocol: Protocol) -> bool;

    /// Stream `spec`'s content into `sink`, passing through the
    /// auto-detecting decompressor. Implementations must not assume `sink`
    /// is seekable — it is the locked `.working/<name>` file opened for
    /// append-only writes.
    async fn retrieve(
        &self,
        spec: &ImageSpec,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> TransientResult<()>;
}

/// The static, ordered list of implementations consulted by the backend
/// store.
pub fn default_protocols() -> Vec<Box<dyn ImageProtocol>> {
    vec![
        Box::new(super::vagrant::VagrantProtocol::default()),
        Box::new(super::http::HttpProtocol::default()),
        Box::new(super::file::FileProtocol::default()),
    ]
}

pub fn protocol_for(
    protocols: &[Box<dyn ImageProtocol>],
    protocol: Protocol,
) -> Option<&dyn ImageProtocol> {
    protocols
        .iter()
        .find(|p| p.matches(protocol))
        .map(|p| p.as_ref())
}
