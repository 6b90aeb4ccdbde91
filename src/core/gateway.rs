//! Gateway composition root.
//!
//! The `GatewayService` owns one instance of every stateful component and
//! hands out shared references to the transports and maintenance tasks:
//! * Node registry (active node, health bookkeeping)
//! * Admission controller (per-source scoring)
//! * Event relay (subscription index and upstream link)
//! * RPC dispatcher (method registry shared by both transports)
//! * Transaction status buffer
//!
//! Construction performs no I/O; the adapters drive the periodic work.
use std::{sync::Arc, time::Instant};

use eyre::{Result, eyre};
use serde::Serialize;

use crate::{
    config::GatewayConfig,
    core::{
        admission::AdmissionController,
        node_registry::NodeRegistry,
        relay::{EventRelay, LinkState},
        rpc::{
            RpcDispatcher,
            handlers::{HandlerDeps, register_default_handlers},
        },
        tx_status::TxStatusRecorder,
    },
    ports::{backend_client::BackendClient, collector::Collector},
};

/// Point-in-time view served by the status route.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayStatus {
    pub nodes: usize,
    pub active_node: Option<String>,
    pub relay: LinkState,
    pub subscriptions: usize,
    pub tracked_sources: usize,
    pub pending_tx_statuses: usize,
    pub uptime_secs: u64,
}

/// Central orchestrator; cheap to share behind an `Arc`.
pub struct GatewayService {
    config: Arc<GatewayConfig>,
    nodes: Arc<NodeRegistry>,
    admission: Arc<AdmissionController>,
    relay: Arc<EventRelay>,
    dispatcher: Arc<RpcDispatcher>,
    tx_recorder: Arc<TxStatusRecorder>,
    started_at: Instant,
}

impl GatewayService {
    /// Build every component from configuration.
    ///
    /// `collector` is consulted only when enabled in configuration.
    pub fn new(
        config: Arc<GatewayConfig>,
        backend: Arc<dyn BackendClient>,
        collector: Option<Arc<dyn Collector>>,
    ) -> Result<Self> {
        let nodes = Arc::new(NodeRegistry::new(&config.discovery, &config.maintenance));
        let admission = Arc::new(
            AdmissionController::new(&config.rate_limit)
                .map_err(|e| eyre!("Failed to create admission controller: {e}"))?,
        );
        let relay = Arc::new(EventRelay::new(
            &config.websocket,
            &config.upstream,
            config.ipport(),
        ));
        let tx_recorder = Arc::new(TxStatusRecorder::new());

        let deps = HandlerDeps {
            nodes: nodes.clone(),
            backend,
            collector: collector.filter(|_| config.collector.enabled),
            tx_recorder: config
                .backend
                .record_tx_status
                .then(|| tx_recorder.clone()),
        };
        let mut dispatcher = RpcDispatcher::new(relay.clone());
        register_default_handlers(&mut dispatcher, &config, &deps);

        Ok(Self {
            config,
            nodes,
            admission,
            relay,
            dispatcher: Arc::new(dispatcher),
            tx_recorder,
            started_at: Instant::now(),
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn nodes(&self) -> &Arc<NodeRegistry> {
        &self.nodes
    }

    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.admission
    }

    pub fn relay(&self) -> &Arc<EventRelay> {
        &self.relay
    }

    pub fn dispatcher(&self) -> &Arc<RpcDispatcher> {
        &self.dispatcher
    }

    pub fn tx_recorder(&self) -> &Arc<TxStatusRecorder> {
        &self.tx_recorder
    }

    pub fn status(&self) -> GatewayStatus {
        let snapshot = self.nodes.snapshot();
        GatewayStatus {
            nodes: snapshot.len(),
            active_node: snapshot.active().map(ToString::to_string),
            relay: self.relay.link_state(),
            subscriptions: self.relay.subscription_count(),
            tracked_sources: self.admission.tracked_sources(),
            pending_tx_statuses: self.tx_recorder.pending(),
            uptime_secs: self.started_at.elapsed().as_secs(),
        }
    }
}
