//! Configuration data structures for Shardgate.
//!
//! These types map directly to TOML (also JSON / YAML) configuration files. They are
//! serde‑friendly and include defaults so that minimal configs remain concise.
//! The configuration is loaded once at startup and never re-derived at runtime.
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_chain_id() -> u64 {
    8082
}

fn default_client_version() -> String {
    format!("shardgate/{}", env!("CARGO_PKG_VERSION"))
}

/// Top level gateway configuration.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GatewayConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Address this gateway advertises to the upstream log server (the `ipport` identity).
    #[serde(default)]
    pub public_ip: Option<String>,
    #[serde(default)]
    pub public_port: Option<u16>,
    #[serde(default = "default_chain_id")]
    pub chain_id: u64,
    #[serde(default = "default_client_version")]
    pub client_version: String,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub websocket: WebsocketConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub collector: CollectorConfig,
    /// Shared secret required by protected routes. Protected routes always answer 401 when unset.
    #[serde(default)]
    pub admin_token: Option<String>,
}

impl GatewayConfig {
    /// Create a new gateway configuration builder
    pub fn builder() -> GatewayConfigBuilder {
        GatewayConfigBuilder::default()
    }

    /// The `ip__port` identity sent with upstream subscribe frames.
    pub fn ipport(&self) -> String {
        let (listen_ip, listen_port) = self
            .listen_addr
            .rsplit_once(':')
            .map(|(ip, port)| (ip.to_string(), port.parse::<u16>().unwrap_or(8080)))
            .unwrap_or_else(|| (self.listen_addr.clone(), 8080));
        let ip = self.public_ip.clone().unwrap_or(listen_ip);
        let port = self.public_port.unwrap_or(listen_port);
        format!("{ip}__{port}")
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            public_ip: None,
            public_port: None,
            chain_id: default_chain_id(),
            client_version: default_client_version(),
            discovery: DiscoveryConfig::default(),
            maintenance: MaintenanceConfig::default(),
            backend: BackendConfig::default(),
            rate_limit: RateLimitConfig::default(),
            websocket: WebsocketConfig::default(),
            upstream: UpstreamConfig::default(),
            collector: CollectorConfig::default(),
            admin_token: None,
        }
    }
}

/// Builder for GatewayConfig, mostly used by tests and embedders.
#[derive(Default)]
pub struct GatewayConfigBuilder {
    config: GatewayConfig,
}

impl GatewayConfigBuilder {
    /// Set the listen address
    pub fn listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.listen_addr = addr.into();
        self
    }

    /// Set the chain id served by `eth_chainId` / `net_version`
    pub fn chain_id(mut self, chain_id: u64) -> Self {
        self.config.chain_id = chain_id;
        self
    }

    /// Seed the static node list used when no archiver is configured
    pub fn seed_nodes<I, S>(mut self, nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.discovery.seed_nodes = nodes.into_iter().map(Into::into).collect();
        self
    }

    /// Set rate limiting configuration
    pub fn rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.config.rate_limit = rate_limit;
        self
    }

    /// Set WebSocket configuration
    pub fn websocket(mut self, websocket: WebsocketConfig) -> Self {
        self.config.websocket = websocket;
        self
    }

    /// Set upstream log server configuration
    pub fn upstream(mut self, upstream: UpstreamConfig) -> Self {
        self.config.upstream = upstream;
        self
    }

    /// Set the admin token used by protected routes
    pub fn admin_token(mut self, token: impl Into<String>) -> Self {
        self.config.admin_token = Some(token.into());
        self
    }

    /// Build the final GatewayConfig
    pub fn build(self) -> GatewayConfig {
        self.config
    }
}

/// Which node becomes active when the current active node disappears.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ActiveNodePolicy {
    /// The first node in discovery order.
    #[default]
    FirstDiscovered,
    /// A uniformly random node.
    Random,
    /// Rotate through the node list on every reselection.
    RoundRobin,
}

/// Node discovery and liveness probing.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Archiver base URL serving the full node list. Seed nodes are used when unset.
    pub archiver_url: Option<String>,
    /// Static `host:port` list used when no archiver is configured.
    pub seed_nodes: Vec<String>,
    pub refresh_interval_secs: u64,
    pub request_timeout_secs: u64,
    /// Path appended to `http://host:port` for the liveness probe.
    pub probe_path: String,
    /// Consecutive probe failures tolerated before a node is removed.
    pub unhealthy_threshold: u32,
    pub active_node_policy: ActiveNodePolicy,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            archiver_url: None,
            seed_nodes: Vec::new(),
            refresh_interval_secs: 10,
            request_timeout_secs: 2,
            probe_path: "/nodeinfo".to_string(),
            unhealthy_threshold: 3,
            active_node_policy: ActiveNodePolicy::FirstDiscovered,
        }
    }
}

/// Periodic maintenance task intervals.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct MaintenanceConfig {
    pub health_check_interval_secs: u64,
    pub bad_node_prune_interval_secs: u64,
    pub tx_flush_interval_secs: u64,
    /// Proxy errors after which a node is considered bad and pruned.
    pub bad_node_threshold: u32,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            health_check_interval_secs: 60,
            bad_node_prune_interval_secs: 60,
            tx_flush_interval_secs: 5,
            bad_node_threshold: 3,
        }
    }
}

/// Backend JSON-RPC proxy settings.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct BackendConfig {
    /// Path of the node's JSON-RPC endpoint.
    pub rpc_path: String,
    pub request_timeout_secs: u64,
    /// Record `eth_sendRawTransaction` outcomes for the tx status sink.
    pub record_tx_status: bool,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            rpc_path: "/".to_string(),
            request_timeout_secs: 10,
            record_tx_status: true,
        }
    }
}

fn default_method_weights() -> HashMap<String, u32> {
    HashMap::from([
        ("eth_getLogs".to_string(), 10),
        ("eth_call".to_string(), 2),
        ("eth_estimateGas".to_string(), 2),
        ("eth_sendRawTransaction".to_string(), 3),
    ])
}

/// Admission control configuration.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Global switch. When false every request is accepted.
    pub enabled: bool,
    /// Over-threshold sources are soft-rejected instead of rejected.
    pub soft_reject: bool,
    /// Rolling window, parsed by humantime, e.g. "1m".
    pub window: String,
    /// Weighted requests allowed per source within `window`.
    pub threshold: u32,
    /// Per-method weights. Unlisted methods weigh 1.
    pub method_weights: HashMap<String, u32>,
    /// Multiplier applied to `eth_getLogs` queries without an address filter.
    pub broad_query_multiplier: u32,
    pub soft_reject_min_delay_ms: u64,
    pub soft_reject_max_delay_ms: u64,
    /// Source IPs or CIDR networks that are always rejected.
    pub block_list: Vec<String>,
    /// Source IPs or CIDR networks that are soft-limited once over threshold.
    pub spammer_list: Vec<String>,
    /// Upper bound on tracked sources before idle ones are evicted.
    pub max_tracked_sources: usize,
    pub eviction_interval_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            soft_reject: false,
            window: "1m".to_string(),
            threshold: 600,
            method_weights: default_method_weights(),
            broad_query_multiplier: 2,
            soft_reject_min_delay_ms: 10_000,
            soft_reject_max_delay_ms: 20_000,
            block_list: Vec::new(),
            spammer_list: Vec::new(),
            max_tracked_sources: 100_000,
            eviction_interval_secs: 60,
        }
    }
}

/// Client-facing WebSocket transport.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct WebsocketConfig {
    pub enabled: bool,
    pub serve_subscriptions: bool,
}

impl Default for WebsocketConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            serve_subscriptions: true,
        }
    }
}

/// Upstream log server the relay connects to.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct UpstreamConfig {
    pub enabled: bool,
    /// WebSocket URL of the log server subscription endpoint.
    pub url: String,
    pub reconnect_delay_secs: u64,
    pub connect_timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: "ws://127.0.0.1:4446/evm_log_subscription".to_string(),
            reconnect_delay_secs: 5,
            connect_timeout_secs: 10,
        }
    }
}

/// Historical data collector used as a fallback source.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CollectorConfig {
    pub enabled: bool,
    pub base_url: String,
    pub request_timeout_secs: u64,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: "http://127.0.0.1:6001".to_string(),
            request_timeout_secs: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ipport_from_listen_addr() {
        let config = GatewayConfig::builder().listen_addr("10.0.0.5:8081").build();
        assert_eq!(config.ipport(), "10.0.0.5__8081");
    }

    #[test]
    fn test_ipport_prefers_public_identity() {
        let mut config = GatewayConfig::default();
        config.public_ip = Some("203.0.113.9".to_string());
        config.public_port = Some(443);
        assert_eq!(config.ipport(), "203.0.113.9__443");
    }

    #[test]
    fn test_default_weights() {
        let config = RateLimitConfig::default();
        assert_eq!(config.method_weights.get("eth_getLogs"), Some(&10));
        assert!(!config.method_weights.contains_key("eth_getBalance"));
    }
}
