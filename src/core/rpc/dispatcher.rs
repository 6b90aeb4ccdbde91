use std::{collections::HashMap, fmt, net::IpAddr, sync::Arc};

use async_trait::async_trait;
use serde_json::Value;
use tracing::Instrument;

use crate::{
    core::{
        error::{GatewayError, GatewayResult},
        relay::EventRelay,
        rpc::{JsonRpcRequest, JsonRpcResponse},
        subscription::ClientHandle,
    },
    metrics,
};

/// Transport a request arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Http,
    WebSocket,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Http => "http",
            Transport::WebSocket => "ws",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-request context handed to every handler.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub transport: Transport,
    pub source: IpAddr,
    /// The client connection, on transports that keep one.
    pub client: Option<ClientHandle>,
}

impl RequestContext {
    pub fn http(source: IpAddr) -> Self {
        Self {
            transport: Transport::Http,
            source,
            client: None,
        }
    }

    pub fn websocket(source: IpAddr, client: ClientHandle) -> Self {
        Self {
            transport: Transport::WebSocket,
            source,
            client: Some(client),
        }
    }
}

/// A JSON-RPC method implementation
#[async_trait]
pub trait RpcHandler: Send + Sync + 'static {
    async fn handle(&self, ctx: &RequestContext, params: &Value) -> GatewayResult<Value>;
}

/// What the transport should do after dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// Send this response now.
    Reply(JsonRpcResponse),
    /// The response arrives later through the client connection.
    Deferred,
}

impl DispatchOutcome {
    /// The immediate response, if any.
    pub fn into_reply(self) -> Option<JsonRpcResponse> {
        match self {
            DispatchOutcome::Reply(response) => Some(response),
            DispatchOutcome::Deferred => None,
        }
    }
}

/// Method-name keyed registry shared by the HTTP and WebSocket transports.
pub struct RpcDispatcher {
    handlers: HashMap<String, Arc<dyn RpcHandler>>,
    relay: Arc<EventRelay>,
}

impl RpcDispatcher {
    pub fn new(relay: Arc<EventRelay>) -> Self {
        Self {
            handlers: HashMap::new(),
            relay,
        }
    }

    pub fn register(&mut self, method: impl Into<String>, handler: Arc<dyn RpcHandler>) {
        self.handlers.insert(method.into(), handler);
    }

    pub fn has_method(&self, method: &str) -> bool {
        is_subscription_method(method) || self.handlers.contains_key(method)
    }

    pub fn method_count(&self) -> usize {
        self.handlers.len()
    }

    /// Run `request` and normalize the outcome into a JSON-RPC envelope.
    ///
    /// Handler errors never escape; they become error responses.
    pub async fn dispatch(&self, ctx: &RequestContext, request: &JsonRpcRequest) -> DispatchOutcome {
        let method = request.method_name();
        let id = request.id_or_null();
        let span = tracing::info_span!(
            "rpc_request",
            transport = %ctx.transport,
            method,
            source = %ctx.source
        );

        let result = self
            .dispatch_inner(ctx, method, &id, &request.params)
            .instrument(span)
            .await;

        let label = if self.has_method(method) { method } else { "unknown" };
        match result {
            Ok(Some(value)) => {
                metrics::increment_rpc_request(ctx.transport.as_str(), label, "ok");
                DispatchOutcome::Reply(JsonRpcResponse::success(id, value))
            }
            Ok(None) => {
                metrics::increment_rpc_request(ctx.transport.as_str(), label, "deferred");
                DispatchOutcome::Deferred
            }
            Err(err) => {
                tracing::debug!(method, error = %err, "RPC call failed");
                metrics::increment_rpc_request(ctx.transport.as_str(), label, "error");
                DispatchOutcome::Reply(JsonRpcResponse::failure(id, err.to_rpc_error()))
            }
        }
    }

    async fn dispatch_inner(
        &self,
        ctx: &RequestContext,
        method: &str,
        id: &Value,
        params: &Value,
    ) -> GatewayResult<Option<Value>> {
        if is_subscription_method(method) {
            // Subscriptions need a persistent socket to deliver to.
            let Some(client) = ctx.client.as_ref() else {
                return Err(GatewayError::SubscriptionsNotSupported);
            };
            if method == "eth_subscribe" {
                self.relay.subscribe(client, id.clone(), params)?;
            } else {
                self.relay.unsubscribe(client, id.clone(), params)?;
            }
            return Ok(None);
        }

        let handler = self
            .handlers
            .get(method)
            .ok_or_else(|| GatewayError::UnknownMethod(method.to_string()))?;
        handler.handle(ctx, params).await.map(Some)
    }
}

fn is_subscription_method(method: &str) -> bool {
    matches!(method, "eth_subscribe" | "eth_unsubscribe")
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::config::{UpstreamConfig, WebsocketConfig};

    struct Echo;

    #[async_trait]
    impl RpcHandler for Echo {
        async fn handle(&self, _ctx: &RequestContext, params: &Value) -> GatewayResult<Value> {
            Ok(params.clone())
        }
    }

    fn dispatcher() -> RpcDispatcher {
        let relay = Arc::new(EventRelay::new(
            &WebsocketConfig::default(),
            &UpstreamConfig::default(),
            "127.0.0.1__8080".to_string(),
        ));
        let mut dispatcher = RpcDispatcher::new(relay);
        dispatcher.register("test_echo", Arc::new(Echo));
        dispatcher
    }

    fn localhost() -> IpAddr {
        "127.0.0.1".parse().unwrap()
    }

    #[tokio::test]
    async fn known_method_is_dispatched() {
        let outcome = dispatcher()
            .dispatch(
                &RequestContext::http(localhost()),
                &JsonRpcRequest::new("test_echo", json!([1, 2]), json!(5)),
            )
            .await;
        assert_eq!(
            outcome,
            DispatchOutcome::Reply(JsonRpcResponse::success(json!(5), json!([1, 2])))
        );
    }

    #[tokio::test]
    async fn unknown_method_is_an_error_response() {
        let response = dispatcher()
            .dispatch(
                &RequestContext::http(localhost()),
                &JsonRpcRequest::new("eth_fooBar", json!([]), json!(1)),
            )
            .await
            .into_reply()
            .unwrap();
        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            json!({"id": 1, "jsonrpc": "2.0", "error": {"message": "Method does not exist", "code": -1}})
        );
    }

    #[tokio::test]
    async fn subscriptions_rejected_over_http() {
        let response = dispatcher()
            .dispatch(
                &RequestContext::http(localhost()),
                &JsonRpcRequest::new("eth_subscribe", json!(["logs"]), json!(1)),
            )
            .await
            .into_reply()
            .unwrap();
        assert_eq!(
            response.error.unwrap().message,
            "Subscriptions are not supported on this transport"
        );
    }

    #[tokio::test]
    async fn subscribe_over_websocket_without_upstream_fails_fast() {
        let (client, _rx) = ClientHandle::new();
        let response = dispatcher()
            .dispatch(
                &RequestContext::websocket(localhost(), client),
                &JsonRpcRequest::new("eth_subscribe", json!(["logs"]), json!(1)),
            )
            .await
            .into_reply()
            .unwrap();
        assert_eq!(
            response.error.unwrap().message,
            "Upstream log server is unavailable"
        );
    }
}
