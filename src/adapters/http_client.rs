use std::time::Duration;

use async_trait::async_trait;
use eyre::{Result, WrapErr};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::{
    config::BackendConfig,
    core::{node::NodeAddress, rpc::JSONRPC_VERSION},
    ports::backend_client::{BackendClient, BackendClientError, BackendClientResult},
};

/// Build the shared reqwest client used by every outbound HTTP adapter.
pub fn build_http_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout.min(Duration::from_secs(5)))
        .pool_idle_timeout(Duration::from_secs(30))
        .tcp_nodelay(true)
        .user_agent(concat!("shardgate/", env!("CARGO_PKG_VERSION")))
        .build()
        .wrap_err("Failed to build HTTP client")
}

/// Map a transport failure without leaking addresses or payloads.
pub(crate) fn describe_reqwest_error(error: &reqwest::Error) -> &'static str {
    if error.is_connect() {
        "connection refused or unreachable"
    } else if error.is_timeout() {
        "connection timed out"
    } else if error.is_body() {
        "response body error"
    } else if error.is_decode() {
        "response decode error"
    } else {
        "request failed"
    }
}

#[derive(Debug, Deserialize)]
struct RpcEnvelope {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    #[serde(default = "default_error_code")]
    code: i64,
    #[serde(default)]
    message: String,
}

fn default_error_code() -> i64 {
    -32000
}

/// JSON-RPC client that forwards calls to a node's RPC endpoint over HTTP.
pub struct HttpBackendClient {
    client: Client,
    rpc_path: String,
    timeout_secs: u64,
}

impl HttpBackendClient {
    pub fn new(config: &BackendConfig) -> Result<Self> {
        Ok(Self {
            client: build_http_client(Duration::from_secs(config.request_timeout_secs))?,
            rpc_path: config.rpc_path.clone(),
            timeout_secs: config.request_timeout_secs,
        })
    }

    fn endpoint(&self, node: &NodeAddress) -> String {
        format!("{}{}", node.base_url(), self.rpc_path)
    }

    /// Pull `result` out of a JSON-RPC response body.
    fn parse_envelope(body: Value) -> BackendClientResult<Value> {
        let envelope: RpcEnvelope = serde_json::from_value(body)
            .map_err(|e| BackendClientError::InvalidResponse(e.to_string()))?;
        match envelope.error {
            Some(error) => Err(BackendClientError::Rpc {
                code: error.code,
                message: error.message,
            }),
            None => Ok(envelope.result.unwrap_or(Value::Null)),
        }
    }
}

#[async_trait]
impl BackendClient for HttpBackendClient {
    async fn call(
        &self,
        node: &NodeAddress,
        method: &str,
        params: &Value,
    ) -> BackendClientResult<Value> {
        let url = self.endpoint(node);
        let body = json!({
            "jsonrpc": JSONRPC_VERSION,
            "method": method,
            "params": params,
            "id": 1,
        });

        tracing::debug!(node = %node, method, "Forwarding RPC call");
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    BackendClientError::Timeout(self.timeout_secs)
                } else {
                    BackendClientError::Connection(describe_reqwest_error(&e).to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(BackendClientError::Status {
                node: node.to_string(),
                status: status.as_u16(),
            });
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| BackendClientError::InvalidResponse(describe_reqwest_error(&e).to_string()))?;
        Self::parse_envelope(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_joins_rpc_path() {
        let client = HttpBackendClient::new(&BackendConfig::default()).unwrap();
        assert_eq!(
            client.endpoint(&NodeAddress::new("10.0.0.1", 9001)),
            "http://10.0.0.1:9001/"
        );
    }

    #[test]
    fn test_parse_result() {
        let value = HttpBackendClient::parse_envelope(json!({"jsonrpc": "2.0", "id": 1, "result": "0x10"}));
        assert_eq!(value.unwrap(), json!("0x10"));

        let missing = HttpBackendClient::parse_envelope(json!({"jsonrpc": "2.0", "id": 1}));
        assert_eq!(missing.unwrap(), Value::Null);
    }

    #[test]
    fn test_parse_rpc_error_is_not_a_node_fault() {
        let err = HttpBackendClient::parse_envelope(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "error": {"code": 3, "message": "execution reverted"}
        }))
        .unwrap_err();
        assert!(!err.is_node_fault());
        assert_eq!(err.to_string(), "execution reverted");
    }

    #[test]
    fn test_parse_garbage_is_invalid_response() {
        let err = HttpBackendClient::parse_envelope(json!([1, 2, 3])).unwrap_err();
        assert!(matches!(err, BackendClientError::InvalidResponse(_)));
        assert!(err.is_node_fault());
    }
}
