use async_trait::async_trait;
use thiserror::Error;

use crate::core::node::NodeAddress;

/// Errors raised while listing or probing nodes
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum DiscoveryError {
    #[error("Discovery request failed: {0}")]
    Request(String),

    #[error("Discovery request timed out after {0} seconds")]
    Timeout(u64),

    #[error("Invalid discovery response: {0}")]
    InvalidResponse(String),
}

pub type DiscoveryResult<T> = Result<T, DiscoveryError>;

/// Source of candidate backend nodes and their liveness probes.
#[async_trait]
pub trait NodeDiscovery: Send + Sync + 'static {
    /// Fetch the full candidate list, in discovery order.
    async fn fetch_nodes(&self) -> DiscoveryResult<Vec<NodeAddress>>;

    /// Liveness probe for one node. `Ok(false)` means the node answered but is not healthy.
    async fn probe(&self, node: &NodeAddress) -> DiscoveryResult<bool>;
}
