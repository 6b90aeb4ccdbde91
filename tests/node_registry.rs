// Node set lifecycle driven through the maintenance jobs
use std::{
    collections::HashSet,
    net::{IpAddr, Ipv4Addr},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use serde_json::{Value, json};
use shardgate::{
    MaintenanceTasks,
    config::GatewayConfig,
    core::{
        GatewayService, NodeAddress,
        rpc::{JsonRpcRequest, dispatcher::RequestContext},
    },
    ports::{
        backend_client::{BackendClient, BackendClientError, BackendClientResult},
        node_discovery::{DiscoveryError, DiscoveryResult, NodeDiscovery},
        tx_status_sink::{TxStatus, TxStatusSink},
    },
};

fn node(last: u8) -> NodeAddress {
    NodeAddress::new(format!("10.0.0.{last}"), 9001)
}

#[derive(Default)]
struct ScriptedDiscovery {
    nodes: Mutex<Option<Vec<NodeAddress>>>,
    down: Mutex<HashSet<NodeAddress>>,
}

impl ScriptedDiscovery {
    fn serve(&self, nodes: Vec<NodeAddress>) {
        *self.nodes.lock().unwrap() = Some(nodes);
    }

    fn fail(&self) {
        *self.nodes.lock().unwrap() = None;
    }

    fn take_down(&self, address: NodeAddress) {
        self.down.lock().unwrap().insert(address);
    }
}

#[async_trait]
impl NodeDiscovery for ScriptedDiscovery {
    async fn fetch_nodes(&self) -> DiscoveryResult<Vec<NodeAddress>> {
        self.nodes
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| DiscoveryError::Request("archiver unreachable".to_string()))
    }

    async fn probe(&self, node: &NodeAddress) -> DiscoveryResult<bool> {
        Ok(!self.down.lock().unwrap().contains(node))
    }
}

/// Fails every call sent to the listed nodes.
struct FlakyBackend {
    broken: HashSet<NodeAddress>,
}

#[async_trait]
impl BackendClient for FlakyBackend {
    async fn call(
        &self,
        node: &NodeAddress,
        _method: &str,
        _params: &Value,
    ) -> BackendClientResult<Value> {
        if self.broken.contains(node) {
            Err(BackendClientError::Connection("connection reset".to_string()))
        } else {
            Ok(json!("0x10"))
        }
    }
}

struct DiscardSink;

#[async_trait]
impl TxStatusSink for DiscardSink {
    async fn persist(&self, _batch: Vec<TxStatus>) -> eyre::Result<()> {
        Ok(())
    }
}

fn setup(broken: &[NodeAddress]) -> (Arc<GatewayService>, Arc<ScriptedDiscovery>, MaintenanceTasks) {
    let config = GatewayConfig::builder().seed_nodes(["10.0.0.1:9001"]).build();
    let backend = FlakyBackend {
        broken: broken.iter().cloned().collect(),
    };
    let gateway =
        Arc::new(GatewayService::new(Arc::new(config), Arc::new(backend), None).unwrap());
    let discovery = Arc::new(ScriptedDiscovery::default());
    let tasks = MaintenanceTasks::new(gateway.clone(), discovery.clone(), Arc::new(DiscardSink));
    (gateway, discovery, tasks)
}

#[tokio::test]
async fn refresh_publishes_generations_and_keeps_active_node() {
    let (gateway, discovery, tasks) = setup(&[]);

    discovery.serve(vec![node(1), node(2)]);
    tasks.refresh_nodes().await.unwrap();
    let first = gateway.nodes().snapshot();
    assert_eq!(first.addresses(), &[node(1), node(2)]);
    assert_eq!(first.active(), Some(&node(1)));

    discovery.serve(vec![node(3), node(1)]);
    tasks.refresh_nodes().await.unwrap();
    let second = gateway.nodes().snapshot();
    assert_eq!(second.active(), Some(&node(1)));
    assert!(!second.contains(&node(2)));

    // Readers holding the old generation still see it in full.
    assert_eq!(first.len(), 2);
    assert!(first.contains(&node(2)));
}

#[tokio::test]
async fn failed_refresh_keeps_current_generation() {
    let (gateway, discovery, tasks) = setup(&[]);
    discovery.serve(vec![node(1)]);
    tasks.refresh_nodes().await.unwrap();

    discovery.fail();
    assert!(tasks.refresh_nodes().await.is_err());
    assert_eq!(gateway.nodes().snapshot().addresses(), &[node(1)]);
}

#[tokio::test]
async fn unresponsive_active_node_is_replaced_after_threshold() {
    let (gateway, discovery, tasks) = setup(&[]);
    discovery.serve(vec![node(1), node(2)]);
    tasks.refresh_nodes().await.unwrap();
    discovery.take_down(node(1));

    // Default threshold is three consecutive failed probes.
    for _ in 0..2 {
        tasks.check_health().await.unwrap();
        assert_eq!(gateway.nodes().select_active().unwrap(), node(1));
    }
    tasks.check_health().await.unwrap();

    let snapshot = gateway.nodes().snapshot();
    assert!(!snapshot.contains(&node(1)));
    assert_eq!(snapshot.active(), Some(&node(2)));
}

#[tokio::test]
async fn proxy_failures_get_the_active_node_pruned() {
    let (gateway, discovery, tasks) = setup(&[node(1)]);
    discovery.serve(vec![node(1), node(2)]);
    tasks.refresh_nodes().await.unwrap();

    let ctx = RequestContext::http(IpAddr::V4(Ipv4Addr::LOCALHOST));
    let request = JsonRpcRequest::new("eth_blockNumber", json!([]), json!(1));
    for _ in 0..3 {
        let reply = gateway
            .dispatcher()
            .dispatch(&ctx, &request)
            .await
            .into_reply()
            .unwrap();
        assert!(reply.is_error());
    }

    tasks.prune_bad_nodes().unwrap();
    assert_eq!(gateway.nodes().select_active().unwrap(), node(2));

    let reply = gateway
        .dispatcher()
        .dispatch(&ctx, &request)
        .await
        .into_reply()
        .unwrap();
    assert!(!reply.is_error());
}

#[tokio::test]
async fn empty_registry_answers_no_backend() {
    let (gateway, _discovery, _tasks) = setup(&[]);
    let ctx = RequestContext::http(IpAddr::V4(Ipv4Addr::LOCALHOST));
    let reply = gateway
        .dispatcher()
        .dispatch(
            &ctx,
            &JsonRpcRequest::new("eth_blockNumber", json!([]), json!(7)),
        )
        .await
        .into_reply()
        .unwrap();

    let body = serde_json::to_value(&reply).unwrap();
    assert_eq!(body["id"], 7);
    assert_eq!(body["error"]["code"], -1);
    assert_eq!(body["error"]["message"], "No backend available");
}
