use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::core::node::NodeAddress;

/// Errors from JSON-RPC calls forwarded to a backend node
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum BackendClientError {
    /// Connection to the node failed
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Timeout error after {0} seconds")]
    Timeout(u64),

    /// The node answered with a non-success HTTP status
    #[error("Backend returned error status: {status}, node: {node}")]
    Status { node: String, status: u16 },

    /// The node answered with a body that is not a JSON-RPC response
    #[error("Invalid backend response: {0}")]
    InvalidResponse(String),

    /// The node answered with a JSON-RPC error object
    #[error("{message}")]
    Rpc { code: i64, message: String },
}

impl BackendClientError {
    /// Whether the failure says something about the node's health.
    ///
    /// A JSON-RPC error is the node working as intended (e.g. a reverted call).
    pub fn is_node_fault(&self) -> bool {
        !matches!(self, BackendClientError::Rpc { .. })
    }
}

pub type BackendClientResult<T> = Result<T, BackendClientError>;

/// Port for forwarding JSON-RPC calls to a backend node.
#[async_trait]
pub trait BackendClient: Send + Sync + 'static {
    /// Call `method` with `params` on `node` and return the `result` member.
    async fn call(
        &self,
        node: &NodeAddress,
        method: &str,
        params: &Value,
    ) -> BackendClientResult<Value>;
}
