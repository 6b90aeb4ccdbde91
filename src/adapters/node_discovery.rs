use std::time::Duration;

use async_trait::async_trait;
use eyre::{Result, WrapErr, eyre};
use reqwest::Client;
use serde::Deserialize;

use crate::{
    adapters::http_client::{build_http_client, describe_reqwest_error},
    config::DiscoveryConfig,
    core::node::NodeAddress,
    ports::node_discovery::{DiscoveryError, DiscoveryResult, NodeDiscovery},
};

/// Archiver route listing every active node.
pub const ARCHIVER_NODELIST_PATH: &str = "/full-nodelist";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NodeListResponse {
    #[serde(default)]
    node_list: Vec<NodeListEntry>,
}

#[derive(Debug, Deserialize)]
struct NodeListEntry {
    ip: String,
    port: u16,
}

/// Where the candidate list comes from.
#[derive(Debug, Clone)]
enum NodeSource {
    Archiver(String),
    Static(Vec<NodeAddress>),
}

/// HTTP discovery: node list from an archiver (or a static seed list) and a
/// GET liveness probe against every node.
pub struct HttpNodeDiscovery {
    client: Client,
    source: NodeSource,
    probe_path: String,
    timeout_secs: u64,
}

impl HttpNodeDiscovery {
    pub fn new(config: &DiscoveryConfig) -> Result<Self> {
        let source = match &config.archiver_url {
            Some(url) => NodeSource::Archiver(url.trim_end_matches('/').to_string()),
            None => {
                let seeds = config
                    .seed_nodes
                    .iter()
                    .map(|seed| NodeAddress::parse(seed))
                    .collect::<Result<Vec<_>, _>>()
                    .wrap_err("Invalid seed node")?;
                if seeds.is_empty() {
                    return Err(eyre!("Either discovery.archiver_url or discovery.seed_nodes must be set"));
                }
                NodeSource::Static(seeds)
            }
        };

        Ok(Self {
            client: build_http_client(Duration::from_secs(config.request_timeout_secs))?,
            source,
            probe_path: config.probe_path.clone(),
            timeout_secs: config.request_timeout_secs,
        })
    }

    fn map_error(&self, error: reqwest::Error) -> DiscoveryError {
        if error.is_timeout() {
            DiscoveryError::Timeout(self.timeout_secs)
        } else {
            DiscoveryError::Request(describe_reqwest_error(&error).to_string())
        }
    }

    async fn fetch_from_archiver(&self, base: &str) -> DiscoveryResult<Vec<NodeAddress>> {
        let url = format!("{base}{ARCHIVER_NODELIST_PATH}");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| self.map_error(e))?;
        if !response.status().is_success() {
            return Err(DiscoveryError::InvalidResponse(format!(
                "archiver answered {}",
                response.status()
            )));
        }

        let body: NodeListResponse = response
            .json()
            .await
            .map_err(|e| DiscoveryError::InvalidResponse(describe_reqwest_error(&e).to_string()))?;
        Ok(body
            .node_list
            .into_iter()
            .map(|entry| NodeAddress::new(entry.ip, entry.port))
            .collect())
    }
}

#[async_trait]
impl NodeDiscovery for HttpNodeDiscovery {
    async fn fetch_nodes(&self) -> DiscoveryResult<Vec<NodeAddress>> {
        match &self.source {
            NodeSource::Archiver(base) => self.fetch_from_archiver(base).await,
            NodeSource::Static(seeds) => Ok(seeds.clone()),
        }
    }

    async fn probe(&self, node: &NodeAddress) -> DiscoveryResult<bool> {
        let url = format!("{}{}", node.base_url(), self.probe_path);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| self.map_error(e))?;
        Ok(response.status().is_success())
    }
}
