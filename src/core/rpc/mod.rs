//! JSON-RPC 2.0 envelope types and method dispatch.
pub mod dispatcher;
pub mod handlers;

pub use dispatcher::{RpcDispatcher, RpcHandler, Transport};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

/// Inbound request. Fields are optional so that malformed frames can be
/// recognised and rejected by the transport instead of failing to parse.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    #[serde(default)]
    pub jsonrpc: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub id: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(method: impl Into<String>, params: Value, id: Value) -> Self {
        Self {
            jsonrpc: Some(JSONRPC_VERSION.to_string()),
            method: Some(method.into()),
            params,
            id: Some(id),
        }
    }

    /// Well-formed means `jsonrpc == "2.0"` and a non-null id.
    pub fn is_well_formed(&self) -> bool {
        self.jsonrpc.as_deref() == Some(JSONRPC_VERSION)
            && self.id.as_ref().is_some_and(|id| !id.is_null())
    }

    pub fn method_name(&self) -> &str {
        self.method.as_deref().unwrap_or_default()
    }

    pub fn id_or_null(&self) -> Value {
        self.id.clone().unwrap_or(Value::Null)
    }
}

/// JSON-RPC error object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcError {
    pub message: String,
    pub code: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub id: Value,
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            id,
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Value, error: RpcError) -> Self {
        Self {
            id,
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: None,
            error: Some(error),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn to_json_string(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            tracing::error!(error = %e, "Failed to serialize JSON-RPC response");
            r#"{"id":null,"jsonrpc":"2.0","error":{"message":"Internal error","code":-1}}"#
                .to_string()
        })
    }
}

/// `eth_subscription` notification pushed to a subscriber.
pub fn subscription_notification(subscription: &str, result: Value) -> Value {
    serde_json::json!({
        "jsonrpc": JSONRPC_VERSION,
        "method": "eth_subscription",
        "params": {
            "subscription": subscription,
            "result": result,
        }
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn request_well_formedness() {
        let ok: JsonRpcRequest =
            serde_json::from_value(json!({"jsonrpc": "2.0", "id": 1, "method": "eth_chainId"}))
                .unwrap();
        assert!(ok.is_well_formed());

        let no_id: JsonRpcRequest =
            serde_json::from_value(json!({"jsonrpc": "2.0", "method": "eth_chainId"})).unwrap();
        assert!(!no_id.is_well_formed());

        let wrong_version: JsonRpcRequest =
            serde_json::from_value(json!({"jsonrpc": "1.0", "id": 1})).unwrap();
        assert!(!wrong_version.is_well_formed());
    }

    #[test]
    fn response_envelope_shape() {
        let ok = JsonRpcResponse::success(json!(7), Value::Null);
        assert_eq!(
            serde_json::to_value(&ok).unwrap(),
            json!({"id": 7, "jsonrpc": "2.0", "result": null})
        );

        let err = JsonRpcResponse::failure(
            json!("a"),
            RpcError {
                message: "Method does not exist".to_string(),
                code: -1,
            },
        );
        assert_eq!(
            serde_json::to_value(&err).unwrap(),
            json!({"id": "a", "jsonrpc": "2.0", "error": {"message": "Method does not exist", "code": -1}})
        );
    }
}
