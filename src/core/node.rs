use std::{
    fmt,
    str::FromStr,
    sync::atomic::{AtomicU8, AtomicU32, Ordering},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::metrics::set_node_health_status;

const HEALTH_STATUS_UNHEALTHY: u8 = 0;
const HEALTH_STATUS_HEALTHY: u8 = 1;

/// Errors related to node addresses
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum NodeError {
    #[error("Invalid node address: {0}")]
    InvalidAddress(String),
}

/// Liveness of a node as last observed by the health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

/// Address of a backend node. Two nodes are the same node iff their addresses match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeAddress {
    host: String,
    port: u16,
}

impl NodeAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse a `host:port` pair. Bracketed IPv6 hosts (`[::1]:9001`) are accepted.
    pub fn parse(s: &str) -> Result<Self, NodeError> {
        let (host, port) = s
            .trim()
            .rsplit_once(':')
            .ok_or_else(|| NodeError::InvalidAddress(s.to_string()))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(NodeError::InvalidAddress(s.to_string()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| NodeError::InvalidAddress(s.to_string()))?;
        Ok(Self::new(host, port))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `http://host:port`, the base every node endpoint hangs off.
    pub fn base_url(&self) -> String {
        if self.host.contains(':') {
            format!("http://[{}]:{}", self.host, self.port)
        } else {
            format!("http://{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for NodeAddress {
    type Err = NodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NodeAddress::parse(s)
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Per-node health bookkeeping shared between the request path and the
/// maintenance tasks.
#[derive(Debug)]
pub struct NodeHealth {
    address: NodeAddress,
    status: AtomicU8,
    /// Consecutive failed liveness probes
    consecutive_failures: AtomicU32,
    /// Consecutive proxied calls that failed
    proxy_errors: AtomicU32,
}

impl NodeHealth {
    /// New nodes start out healthy with clean counters.
    pub fn new(address: NodeAddress) -> Self {
        Self {
            address,
            status: AtomicU8::new(HEALTH_STATUS_HEALTHY),
            consecutive_failures: AtomicU32::new(0),
            proxy_errors: AtomicU32::new(0),
        }
    }

    pub fn address(&self) -> &NodeAddress {
        &self.address
    }

    pub fn status(&self) -> HealthStatus {
        if self.status.load(Ordering::Acquire) == HEALTH_STATUS_HEALTHY {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        }
    }

    /// Record a successful probe and reset the failure streak.
    pub fn mark_probe_success(&self) {
        self.status.store(HEALTH_STATUS_HEALTHY, Ordering::Release);
        self.consecutive_failures.store(0, Ordering::Release);
        set_node_health_status(&self.address.to_string(), true);
    }

    /// Record a failed probe, returning the new failure streak.
    pub fn mark_probe_failure(&self) -> u32 {
        self.status.store(HEALTH_STATUS_UNHEALTHY, Ordering::Release);
        set_node_health_status(&self.address.to_string(), false);
        self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Record a failed proxied call, returning the new error count.
    pub fn record_proxy_error(&self) -> u32 {
        self.proxy_errors.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn record_proxy_success(&self) {
        self.proxy_errors.store(0, Ordering::Release);
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    pub fn proxy_errors(&self) -> u32 {
        self.proxy_errors.load(Ordering::Relaxed)
    }
}
