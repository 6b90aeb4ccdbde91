//! Lightweight metrics helpers for Shardgate.
//!
//! Thin wrappers around the `metrics` crate macros. No exporter is installed
//! here; the embedding application may install any compatible recorder, and
//! without one every call is a no-op.
//!
//! Provided metrics (labels vary by family):
//! * `shardgate_node_health_status` (gauge per node)
//! * `shardgate_known_nodes` (gauge)
//! * `shardgate_admission_decisions_total` (counter, label `decision`)
//! * `shardgate_tracked_sources` (gauge)
//! * `shardgate_relay_link_state` (gauge, 0 disconnected / 1 connecting / 2 connected)
//! * `shardgate_upstream_frames_total` (counter, label `kind`)
//! * `shardgate_upstream_reconnects_total` (counter)
//! * `shardgate_active_subscriptions` (gauge)
//! * `shardgate_rpc_requests_total` (counter, labels `transport`, `method`, `outcome`)
//! * `shardgate_http_request_duration_seconds` (histogram)
use std::{collections::HashMap, sync::Mutex, time::Instant};

use metrics::{
    Unit, counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram,
};
use once_cell::sync::Lazy;

pub const SHARDGATE_NODE_HEALTH_STATUS: &str = "shardgate_node_health_status";
pub const SHARDGATE_KNOWN_NODES: &str = "shardgate_known_nodes";
pub const SHARDGATE_ADMISSION_DECISIONS_TOTAL: &str = "shardgate_admission_decisions_total";
pub const SHARDGATE_TRACKED_SOURCES: &str = "shardgate_tracked_sources";
pub const SHARDGATE_RELAY_LINK_STATE: &str = "shardgate_relay_link_state";
pub const SHARDGATE_UPSTREAM_FRAMES_TOTAL: &str = "shardgate_upstream_frames_total";
pub const SHARDGATE_UPSTREAM_RECONNECTS_TOTAL: &str = "shardgate_upstream_reconnects_total";
pub const SHARDGATE_ACTIVE_SUBSCRIPTIONS: &str = "shardgate_active_subscriptions";
pub const SHARDGATE_RPC_REQUESTS_TOTAL: &str = "shardgate_rpc_requests_total";
pub const SHARDGATE_HTTP_REQUEST_DURATION_SECONDS: &str = "shardgate_http_request_duration_seconds";

/// Last reported health per node, kept for the status snapshot.
pub static NODE_HEALTH_GAUGES: Lazy<Mutex<HashMap<String, f64>>> = Lazy::new(|| {
    describe_gauge!(
        SHARDGATE_NODE_HEALTH_STATUS,
        "Health status of individual nodes (1 for healthy, 0 for unhealthy)"
    );
    describe_gauge!(SHARDGATE_KNOWN_NODES, "Number of nodes in the current registry snapshot.");
    describe_counter!(
        SHARDGATE_ADMISSION_DECISIONS_TOTAL,
        Unit::Count,
        "Admission decisions by outcome."
    );
    describe_gauge!(SHARDGATE_TRACKED_SOURCES, "Source addresses tracked by admission control.");
    describe_gauge!(SHARDGATE_RELAY_LINK_STATE, "State of the upstream log server link.");
    describe_counter!(
        SHARDGATE_UPSTREAM_FRAMES_TOTAL,
        Unit::Count,
        "Frames received from the upstream log server, by kind."
    );
    describe_counter!(
        SHARDGATE_UPSTREAM_RECONNECTS_TOTAL,
        Unit::Count,
        "Reconnect attempts to the upstream log server."
    );
    describe_gauge!(SHARDGATE_ACTIVE_SUBSCRIPTIONS, "Live client log subscriptions.");
    describe_counter!(
        SHARDGATE_RPC_REQUESTS_TOTAL,
        Unit::Count,
        "JSON-RPC requests dispatched, by transport, method and outcome."
    );
    describe_histogram!(
        SHARDGATE_HTTP_REQUEST_DURATION_SECONDS,
        Unit::Seconds,
        "Latency of HTTP requests served by the gateway."
    );

    Mutex::new(HashMap::new())
});

pub fn set_node_health_status(node: &str, is_healthy: bool) {
    let health_value = if is_healthy { 1.0 } else { 0.0 };

    match NODE_HEALTH_GAUGES.lock() {
        Ok(mut gauges) => {
            gauges.insert(node.to_string(), health_value);
        }
        Err(_) => {
            tracing::error!("Failed to acquire lock for node health gauges");
            return;
        }
    }

    gauge!(SHARDGATE_NODE_HEALTH_STATUS, "node" => node.to_string()).set(health_value);
}

/// Drop gauges for nodes no longer in the registry.
pub fn forget_node(node: &str) {
    if let Ok(mut gauges) = NODE_HEALTH_GAUGES.lock() {
        gauges.remove(node);
    }
}

pub fn set_known_nodes(count: usize) {
    gauge!(SHARDGATE_KNOWN_NODES).set(count as f64);
}

pub fn increment_admission_decision(decision: &str) {
    counter!(SHARDGATE_ADMISSION_DECISIONS_TOTAL, "decision" => decision.to_string()).increment(1);
}

pub fn set_tracked_sources(count: usize) {
    gauge!(SHARDGATE_TRACKED_SOURCES).set(count as f64);
}

pub fn set_relay_link_state(state: u8) {
    gauge!(SHARDGATE_RELAY_LINK_STATE).set(f64::from(state));
}

pub fn increment_upstream_frame(kind: &str) {
    counter!(SHARDGATE_UPSTREAM_FRAMES_TOTAL, "kind" => kind.to_string()).increment(1);
}

pub fn increment_upstream_reconnect() {
    counter!(SHARDGATE_UPSTREAM_RECONNECTS_TOTAL).increment(1);
}

pub fn set_active_subscriptions(count: usize) {
    gauge!(SHARDGATE_ACTIVE_SUBSCRIPTIONS).set(count as f64);
}

pub fn increment_rpc_request(transport: &str, method: &str, outcome: &str) {
    counter!(
        SHARDGATE_RPC_REQUESTS_TOTAL,
        "transport" => transport.to_string(),
        "method" => method.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

pub fn record_http_request_duration(path: &str, status: u16, duration: std::time::Duration) {
    histogram!(
        SHARDGATE_HTTP_REQUEST_DURATION_SECONDS,
        "path" => path.to_string(),
        "status" => status.to_string()
    )
    .record(duration.as_secs_f64());
}

/// RAII helper measuring HTTP request duration.
pub struct RequestTimer {
    start: Instant,
    path: String,
    status: u16,
}

impl RequestTimer {
    pub fn new(path: &str) -> Self {
        Self {
            start: Instant::now(),
            path: path.to_string(),
            status: 0,
        }
    }

    pub fn set_status(&mut self, status: u16) {
        self.status = status;
    }
}

impl Drop for RequestTimer {
    fn drop(&mut self) {
        record_http_request_duration(&self.path, self.status, self.start.elapsed());
    }
}

/// Register metric descriptions (idempotent).
pub fn init_metrics() {
    Lazy::force(&NODE_HEALTH_GAUGES);
    tracing::debug!("Shardgate metric descriptions registered");
}

/// Last reported health per node.
pub fn node_health_snapshot() -> HashMap<String, f64> {
    NODE_HEALTH_GAUGES
        .lock()
        .map(|gauges| gauges.clone())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_node_health_status() {
        set_node_health_status("10.1.1.1:9001", true);
        assert_eq!(node_health_snapshot().get("10.1.1.1:9001"), Some(&1.0));

        set_node_health_status("10.1.1.1:9001", false);
        assert_eq!(node_health_snapshot().get("10.1.1.1:9001"), Some(&0.0));

        forget_node("10.1.1.1:9001");
        assert!(!node_health_snapshot().contains_key("10.1.1.1:9001"));
    }

    #[test]
    fn test_request_timer_records_on_drop() {
        let mut timer = RequestTimer::new("/");
        timer.set_status(200);
        drop(timer);
    }

    #[test]
    fn test_calls_without_recorder_are_noops() {
        init_metrics();
        increment_rpc_request("http", "eth_chainId", "ok");
        set_relay_link_state(2);
        increment_admission_decision("accept");
    }
}
