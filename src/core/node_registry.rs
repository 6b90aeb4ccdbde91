//! Live view of the backend node set.
//!
//! Readers load an immutable [`NodeSnapshot`] through `ArcSwap`, so a reader
//! sees either the previous generation or the next one in full. Writers
//! (refresh, health check, pruning, subscription announcements) are
//! serialized behind a mutex and publish a new snapshot on every change.
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard},
};

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;

use crate::{
    config::{DiscoveryConfig, MaintenanceConfig},
    core::{
        error::{GatewayError, GatewayResult},
        node::{NodeAddress, NodeHealth},
        node_selection::{NodeSelectionStrategy, NodeSelectorFactory},
    },
    metrics,
    ports::node_discovery::{DiscoveryResult, NodeDiscovery},
};

/// One immutable generation of the registry.
#[derive(Debug, Default)]
pub struct NodeSnapshot {
    nodes: HashMap<NodeAddress, Arc<NodeHealth>>,
    /// Discovery order, used by the selection policy.
    order: Vec<NodeAddress>,
    active: Option<NodeAddress>,
}

impl NodeSnapshot {
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn active(&self) -> Option<&NodeAddress> {
        self.active.as_ref()
    }

    pub fn contains(&self, address: &NodeAddress) -> bool {
        self.nodes.contains_key(address)
    }

    pub fn addresses(&self) -> &[NodeAddress] {
        &self.order
    }

    pub fn health(&self, address: &NodeAddress) -> Option<&Arc<NodeHealth>> {
        self.nodes.get(address)
    }
}

/// Tracks known backend nodes and the node currently serving traffic.
pub struct NodeRegistry {
    snapshot: ArcSwap<NodeSnapshot>,
    writer: Mutex<()>,
    selector: Box<dyn NodeSelectionStrategy>,
    /// Nodes that announced a subscription from this gateway, with the time of the last announcement.
    subscribed: scc::HashMap<NodeAddress, DateTime<Utc>>,
    unhealthy_threshold: u32,
    bad_node_threshold: u32,
}

impl NodeRegistry {
    pub fn new(discovery: &DiscoveryConfig, maintenance: &MaintenanceConfig) -> Self {
        Self::with_strategy(
            NodeSelectorFactory::create_strategy(discovery.active_node_policy),
            discovery.unhealthy_threshold,
            maintenance.bad_node_threshold,
        )
    }

    pub fn with_strategy(
        selector: Box<dyn NodeSelectionStrategy>,
        unhealthy_threshold: u32,
        bad_node_threshold: u32,
    ) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(NodeSnapshot::default()),
            writer: Mutex::new(()),
            selector,
            subscribed: scc::HashMap::new(),
            unhealthy_threshold: unhealthy_threshold.max(1),
            bad_node_threshold: bad_node_threshold.max(1),
        }
    }

    /// The current generation. Cheap; never blocks on writers.
    pub fn snapshot(&self) -> Arc<NodeSnapshot> {
        self.snapshot.load_full()
    }

    fn lock_writer(&self) -> MutexGuard<'_, ()> {
        self.writer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, next: NodeSnapshot) {
        metrics::set_known_nodes(next.len());
        let previous = self.snapshot.swap(Arc::new(next));
        let current = self.snapshot.load();
        for address in previous.order.iter().filter(|a| !current.contains(a)) {
            metrics::forget_node(&address.to_string());
            self.subscribed.remove_sync(address);
        }
    }

    /// Replace the node set with `candidates`.
    ///
    /// The active node survives if it is still a member; otherwise the
    /// selection policy picks a new one. Health bookkeeping is carried over
    /// for nodes present in both generations.
    pub fn refresh(&self, candidates: Vec<NodeAddress>) {
        let _guard = self.lock_writer();
        let current = self.snapshot.load();

        let mut seen = HashSet::with_capacity(candidates.len());
        let order: Vec<NodeAddress> = candidates
            .into_iter()
            .filter(|address| seen.insert(address.clone()))
            .collect();

        let nodes = order
            .iter()
            .map(|address| {
                let health = current
                    .nodes
                    .get(address)
                    .cloned()
                    .unwrap_or_else(|| Arc::new(NodeHealth::new(address.clone())));
                (address.clone(), health)
            })
            .collect::<HashMap<_, _>>();

        let active = match &current.active {
            Some(active) if nodes.contains_key(active) => Some(active.clone()),
            _ => self.selector.select_node(&order),
        };

        if active != current.active {
            tracing::info!(
                previous = ?current.active.as_ref().map(ToString::to_string),
                next = ?active.as_ref().map(ToString::to_string),
                "Active node changed on refresh"
            );
        }
        tracing::debug!(nodes = order.len(), "Node list refreshed");

        self.publish(NodeSnapshot {
            nodes,
            order,
            active,
        });
    }

    /// Fetch candidates from `discovery` and refresh. A failed fetch leaves
    /// the current generation untouched.
    pub async fn refresh_from(&self, discovery: &dyn NodeDiscovery) -> DiscoveryResult<usize> {
        let candidates = discovery.fetch_nodes().await?;
        let count = candidates.len();
        self.refresh(candidates);
        Ok(count)
    }

    /// The active node, or [`GatewayError::NoBackendAvailable`] when the registry is empty.
    pub fn select_active(&self) -> GatewayResult<NodeAddress> {
        self.snapshot
            .load()
            .active
            .clone()
            .ok_or(GatewayError::NoBackendAvailable)
    }

    /// Health handle of the active node, if any.
    pub fn active_health(&self) -> GatewayResult<Arc<NodeHealth>> {
        let snapshot = self.snapshot.load();
        snapshot
            .active
            .as_ref()
            .and_then(|active| snapshot.nodes.get(active).cloned())
            .ok_or(GatewayError::NoBackendAvailable)
    }

    /// Record that `address` accepted a subscription request from this gateway.
    ///
    /// Returns false if the address is not a known node; nothing is recorded then.
    pub async fn mark_subscribed(&self, address: &NodeAddress, become_active: bool) -> bool {
        // Under the writer lock so a concurrent refresh cannot drop the node
        // between the membership check and the record.
        let _guard = self.lock_writer();
        let current = self.snapshot.load();
        if !current.contains(address) {
            return false;
        }
        self.subscribed.upsert_sync(address.clone(), Utc::now());

        if become_active && current.active.as_ref() != Some(address) {
            tracing::info!(node = %address, "Node subscription accepted, switching active node");
            self.publish(NodeSnapshot {
                nodes: current.nodes.clone(),
                order: current.order.clone(),
                active: Some(address.clone()),
            });
        }
        true
    }

    /// Last subscription announcement from `address`.
    pub async fn subscribed_at(&self, address: &NodeAddress) -> Option<DateTime<Utc>> {
        self.subscribed
            .get_async(address)
            .await
            .map(|entry| *entry.get())
    }

    /// Apply a liveness probe outcome. Returns true if the node was removed.
    pub fn record_probe_result(&self, address: &NodeAddress, healthy: bool) -> bool {
        let Some(health) = self.snapshot.load().nodes.get(address).cloned() else {
            return false;
        };

        if healthy {
            health.mark_probe_success();
            return false;
        }

        let failures = health.mark_probe_failure();
        tracing::info!(
            node = %address,
            failures,
            threshold = self.unhealthy_threshold,
            "Liveness probe failed"
        );
        if failures >= self.unhealthy_threshold {
            tracing::warn!(node = %address, failures, "Removing unresponsive node");
            self.remove_nodes(&[address.clone()]);
            return true;
        }
        false
    }

    /// Probe every known node concurrently and apply the results.
    ///
    /// Probe errors count as failures and are only logged.
    pub async fn health_check(&self, prober: &dyn NodeDiscovery) -> usize {
        let snapshot = self.snapshot();
        let probes = snapshot.addresses().iter().map(|address| async move {
            let healthy = match prober.probe(address).await {
                Ok(healthy) => healthy,
                Err(e) => {
                    tracing::debug!(node = %address, error = %e, "Probe request failed");
                    false
                }
            };
            (address.clone(), healthy)
        });

        let results = join_all(probes).await;
        let removed = results
            .iter()
            .filter(|(address, healthy)| self.record_probe_result(address, *healthy))
            .count();
        tracing::debug!(checked = results.len(), removed, "Health check cycle completed");
        removed
    }

    /// A proxied call to `address` failed.
    pub fn record_proxy_error(&self, address: &NodeAddress) {
        if let Some(health) = self.snapshot.load().nodes.get(address) {
            let errors = health.record_proxy_error();
            tracing::debug!(node = %address, errors, "Proxy error recorded");
        }
    }

    pub fn record_proxy_success(&self, address: &NodeAddress) {
        if let Some(health) = self.snapshot.load().nodes.get(address) {
            health.record_proxy_success();
        }
    }

    /// Remove nodes whose proxy error count reached the bad-node threshold.
    pub fn prune_bad(&self) -> Vec<NodeAddress> {
        let bad: Vec<NodeAddress> = {
            let snapshot = self.snapshot.load();
            snapshot
                .order
                .iter()
                .filter(|address| {
                    snapshot
                        .nodes
                        .get(*address)
                        .is_some_and(|h| h.proxy_errors() >= self.bad_node_threshold)
                })
                .cloned()
                .collect()
        };

        if !bad.is_empty() {
            tracing::warn!(
                nodes = ?bad.iter().map(ToString::to_string).collect::<Vec<_>>(),
                "Pruning bad nodes"
            );
            self.remove_nodes(&bad);
        }
        bad
    }

    fn remove_nodes(&self, addresses: &[NodeAddress]) {
        let _guard = self.lock_writer();
        let current = self.snapshot.load();

        let order: Vec<NodeAddress> = current
            .order
            .iter()
            .filter(|address| !addresses.contains(address))
            .cloned()
            .collect();
        if order.len() == current.order.len() {
            return;
        }

        let nodes = current
            .nodes
            .iter()
            .filter(|(address, _)| !addresses.contains(address))
            .map(|(address, health)| (address.clone(), health.clone()))
            .collect();

        let active = match &current.active {
            Some(active) if !addresses.contains(active) => Some(active.clone()),
            _ => {
                let next = self.selector.select_node(&order);
                tracing::info!(
                    next = ?next.as_ref().map(ToString::to_string),
                    "Active node removed, reselected"
                );
                next
            }
        };

        self.publish(NodeSnapshot {
            nodes,
            order,
            active,
        });
    }
}
