//! Built-in method handlers: local constants, proxying to the active node,
//! collector fallback and transaction status recording.
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};

use crate::{
    config::GatewayConfig,
    core::{
        error::{GatewayError, GatewayResult},
        node_registry::NodeRegistry,
        rpc::dispatcher::{RequestContext, RpcDispatcher, RpcHandler},
        tx_status::TxStatusRecorder,
    },
    ports::{backend_client::BackendClient, collector::Collector, tx_status_sink::TxStatus},
};

/// Methods forwarded verbatim to the active node.
pub const PROXIED_METHODS: &[&str] = &[
    "web3_sha3",
    "eth_blockNumber",
    "eth_gasPrice",
    "eth_maxPriorityFeePerGas",
    "eth_feeHistory",
    "eth_getBalance",
    "eth_getStorageAt",
    "eth_getTransactionCount",
    "eth_getCode",
    "eth_call",
    "eth_estimateGas",
    "eth_getBlockByHash",
    "eth_getBlockByNumber",
    "eth_getBlockTransactionCountByHash",
    "eth_getBlockTransactionCountByNumber",
    "eth_getUncleCountByBlockHash",
    "eth_getUncleCountByBlockNumber",
    "eth_getUncleByBlockHashAndIndex",
    "eth_getUncleByBlockNumberAndIndex",
    "eth_getTransactionByBlockHashAndIndex",
    "eth_getTransactionByBlockNumberAndIndex",
    "eth_getAccessList",
    "eth_newFilter",
    "eth_newBlockFilter",
    "eth_newPendingTransactionFilter",
    "eth_uninstallFilter",
    "eth_getFilterChanges",
    "eth_getFilterLogs",
    "eth_coinbase",
    "eth_sign",
    "eth_signTransaction",
    "eth_sendTransaction",
];

/// Methods that fall back to the collector when the node has nothing.
pub const COLLECTOR_BACKED_METHODS: &[&str] = &[
    "eth_getTransactionByHash",
    "eth_getTransactionReceipt",
    "eth_getLogs",
];

/// Answers with a fixed value.
pub struct ConstantHandler(pub Value);

#[async_trait]
impl RpcHandler for ConstantHandler {
    async fn handle(&self, _ctx: &RequestContext, _params: &Value) -> GatewayResult<Value> {
        Ok(self.0.clone())
    }
}

/// Forwards a call to the active node and keeps its error count current.
pub struct ProxyHandler {
    method: String,
    nodes: Arc<NodeRegistry>,
    backend: Arc<dyn BackendClient>,
}

impl ProxyHandler {
    pub fn new(
        method: impl Into<String>,
        nodes: Arc<NodeRegistry>,
        backend: Arc<dyn BackendClient>,
    ) -> Self {
        Self {
            method: method.into(),
            nodes,
            backend,
        }
    }

    /// Call `method` on the active node.
    pub async fn forward(&self, method: &str, params: &Value) -> GatewayResult<Value> {
        let node = self.nodes.select_active()?;
        match self.backend.call(&node, method, params).await {
            Ok(value) => {
                self.nodes.record_proxy_success(&node);
                Ok(value)
            }
            Err(e) => {
                if e.is_node_fault() {
                    tracing::warn!(node = %node, method, error = %e, "Proxied call failed");
                    self.nodes.record_proxy_error(&node);
                }
                Err(GatewayError::Backend(e))
            }
        }
    }
}

#[async_trait]
impl RpcHandler for ProxyHandler {
    async fn handle(&self, _ctx: &RequestContext, params: &Value) -> GatewayResult<Value> {
        self.forward(&self.method, params).await
    }
}

/// Proxy first; ask the collector when the node returns nothing or fails.
pub struct CollectorFallbackHandler {
    proxy: ProxyHandler,
    collector: Option<Arc<dyn Collector>>,
}

impl CollectorFallbackHandler {
    pub fn new(proxy: ProxyHandler, collector: Option<Arc<dyn Collector>>) -> Self {
        Self { proxy, collector }
    }

    async fn from_collector(&self, collector: &dyn Collector, params: &Value) -> Option<Value> {
        let outcome = match self.proxy.method.as_str() {
            "eth_getLogs" => {
                let filter = params.get(0).cloned().unwrap_or_else(|| json!({}));
                collector
                    .logs_by_filter(&filter)
                    .await
                    .map(|logs| Some(Value::Array(logs)))
            }
            _ => match params.get(0).and_then(Value::as_str) {
                Some(tx_hash) => collector.transaction_by_hash(tx_hash).await,
                None => Ok(None),
            },
        };

        match outcome {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(method = %self.proxy.method, error = %e, "Collector lookup failed");
                None
            }
        }
    }
}

fn is_empty_result(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

#[async_trait]
impl RpcHandler for CollectorFallbackHandler {
    async fn handle(&self, ctx: &RequestContext, params: &Value) -> GatewayResult<Value> {
        let primary = self.proxy.handle(ctx, params).await;
        let Some(collector) = self.collector.as_deref() else {
            return primary;
        };

        match primary {
            Ok(value) if !is_empty_result(&value) => Ok(value),
            // The node understood the call and refused it; the collector would not do better.
            Err(GatewayError::Backend(e)) if !e.is_node_fault() => Err(GatewayError::Backend(e)),
            primary => match self.from_collector(collector, params).await {
                Some(value) => {
                    tracing::debug!(method = %self.proxy.method, "Served from collector");
                    Ok(value)
                }
                None => primary,
            },
        }
    }
}

/// `eth_sendRawTransaction`: forward, then record the outcome.
pub struct SendRawTransactionHandler {
    proxy: ProxyHandler,
    recorder: Option<Arc<TxStatusRecorder>>,
}

impl SendRawTransactionHandler {
    pub fn new(proxy: ProxyHandler, recorder: Option<Arc<TxStatusRecorder>>) -> Self {
        Self { proxy, recorder }
    }
}

#[async_trait]
impl RpcHandler for SendRawTransactionHandler {
    async fn handle(&self, ctx: &RequestContext, params: &Value) -> GatewayResult<Value> {
        let node_url = self.proxy.nodes.select_active().ok().map(|n| n.base_url());
        let result = self.proxy.handle(ctx, params).await;

        if let Some(recorder) = &self.recorder {
            let (tx_hash, accepted, reason) = match &result {
                Ok(value) => (value.as_str().map(str::to_string), true, None),
                Err(e) => (None, false, Some(e.to_string())),
            };
            recorder.record(TxStatus {
                tx_hash,
                accepted,
                reason,
                source_ip: ctx.source.to_string(),
                node_url,
                timestamp: Utc::now(),
            });
        }
        result
    }
}

/// Shared collaborators the built-in handlers need.
pub struct HandlerDeps {
    pub nodes: Arc<NodeRegistry>,
    pub backend: Arc<dyn BackendClient>,
    pub collector: Option<Arc<dyn Collector>>,
    pub tx_recorder: Option<Arc<TxStatusRecorder>>,
}

/// Register every built-in method on `dispatcher`.
pub fn register_default_handlers(
    dispatcher: &mut RpcDispatcher,
    config: &GatewayConfig,
    deps: &HandlerDeps,
) {
    let constants = [
        ("web3_clientVersion", json!(config.client_version)),
        ("net_version", json!(config.chain_id.to_string())),
        ("eth_chainId", json!(format!("0x{:x}", config.chain_id))),
        ("net_listening", json!(true)),
        ("net_peerCount", json!("0x0")),
        ("eth_syncing", json!(false)),
        ("eth_accounts", json!([])),
        ("eth_mining", json!(false)),
        ("eth_hashrate", json!("0x0")),
        ("eth_protocolVersion", json!("0x41")),
    ];
    for (method, value) in constants {
        dispatcher.register(method, Arc::new(ConstantHandler(value)));
    }

    let proxy = |method: &str| ProxyHandler::new(method, deps.nodes.clone(), deps.backend.clone());

    for method in PROXIED_METHODS {
        dispatcher.register(*method, Arc::new(proxy(*method)));
    }

    for method in COLLECTOR_BACKED_METHODS {
        dispatcher.register(
            *method,
            Arc::new(CollectorFallbackHandler::new(
                proxy(*method),
                deps.collector.clone(),
            )),
        );
    }

    dispatcher.register(
        "eth_sendRawTransaction",
        Arc::new(SendRawTransactionHandler::new(
            proxy("eth_sendRawTransaction"),
            deps.tx_recorder.clone(),
        )),
    );

    tracing::debug!(methods = dispatcher.method_count(), "Registered RPC handlers");
}
