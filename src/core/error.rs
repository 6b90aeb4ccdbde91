use thiserror::Error;

use crate::{core::rpc::RpcError, ports::backend_client::BackendClientError};

/// Errors surfaced by the gateway while serving a request.
///
/// None of these are fatal to the process; each one maps onto either a
/// JSON-RPC error payload or a transport-level rejection.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum GatewayError {
    /// The node registry is empty.
    #[error("No backend available")]
    NoBackendAvailable,

    /// Admission control turned the request away.
    #[error("Rejected by rate-limiting")]
    RateLimited,

    /// The upstream log relay is not connected.
    #[error("Upstream log server is unavailable")]
    UpstreamUnavailable,

    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    #[error("Method does not exist")]
    UnknownMethod(String),

    /// An unparseable frame arrived on the upstream link.
    #[error("Upstream protocol error: {0}")]
    UpstreamProtocolError(String),

    #[error("Subscriptions are not supported on this transport")]
    SubscriptionsNotSupported,

    #[error("Subscription serving disabled")]
    SubscriptionsDisabled,

    /// The client connection closed before the request completed.
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Invalid params: {0}")]
    InvalidParams(String),

    /// The active node failed to answer.
    #[error(transparent)]
    Backend(#[from] BackendClientError),
}

/// Result type for gateway operations
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Error code shared by every gateway-level JSON-RPC error.
pub const GATEWAY_ERROR_CODE: i64 = -1;

impl GatewayError {
    /// Convert into the JSON-RPC error payload sent to clients.
    pub fn to_rpc_error(&self) -> RpcError {
        match self {
            GatewayError::Backend(BackendClientError::Rpc { code, message }) => RpcError {
                code: *code,
                message: message.clone(),
            },
            other => RpcError {
                code: GATEWAY_ERROR_CODE,
                message: other.to_string(),
            },
        }
    }
}

impl From<GatewayError> for RpcError {
    fn from(err: GatewayError) -> Self {
        err.to_rpc_error()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_method_maps_to_code_minus_one() {
        let err = GatewayError::UnknownMethod("eth_fooBar".to_string()).to_rpc_error();
        assert_eq!(err.code, -1);
        assert_eq!(err.message, "Method does not exist");
    }

    #[test]
    fn backend_rpc_errors_keep_their_code() {
        let err = GatewayError::Backend(BackendClientError::Rpc {
            code: -32000,
            message: "execution reverted".to_string(),
        })
        .to_rpc_error();
        assert_eq!(err.code, -32000);
        assert_eq!(err.message, "execution reverted");
    }
}
