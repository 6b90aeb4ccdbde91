use std::time::Duration;

use async_trait::async_trait;
use eyre::Result;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;

use crate::{
    adapters::http_client::{build_http_client, describe_reqwest_error},
    config::CollectorConfig,
    ports::collector::{Collector, CollectorError, CollectorResult},
};

/// Safety bound on log result pages fetched for one query.
const MAX_LOG_PAGES: u64 = 1_000;

#[derive(Debug, Deserialize)]
struct TransactionResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    transactions: Vec<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LogPage {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    logs: Vec<Value>,
    #[serde(default)]
    total_pages: u64,
}

/// Client for the collector's read-only HTTP API.
pub struct HttpCollector {
    client: Client,
    base_url: String,
}

impl HttpCollector {
    pub fn new(config: &CollectorConfig) -> Result<Self> {
        Ok(Self {
            client: build_http_client(Duration::from_secs(config.request_timeout_secs))?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> CollectorResult<T> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| CollectorError::Request(describe_reqwest_error(&e).to_string()))?;
        if !response.status().is_success() {
            return Err(CollectorError::Request(format!(
                "collector answered {}",
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| CollectorError::InvalidResponse(describe_reqwest_error(&e).to_string()))
    }

    /// Base log query URL for an `eth_getLogs` filter object, without the page.
    pub fn log_query_url(&self, filter: &Value) -> String {
        let mut query: Vec<(String, String)> = Vec::new();

        match filter.get("address") {
            Some(Value::String(address)) => query.push(("address".into(), address.to_lowercase())),
            Some(Value::Array(addresses)) => {
                for address in addresses.iter().filter_map(Value::as_str) {
                    query.push(("address".into(), address.to_lowercase()));
                }
            }
            _ => {}
        }

        if let Some(topics) = filter.get("topics").and_then(Value::as_array) {
            for (position, topic) in topics.iter().enumerate() {
                if let Some(topic) = topic.as_str() {
                    query.push((format!("topic{position}"), topic.to_lowercase()));
                }
            }
        }

        for key in ["fromBlock", "toBlock", "blockHash"] {
            if let Some(value) = filter.get(key).and_then(Value::as_str) {
                query.push((key.to_string(), value.to_string()));
            }
        }

        let query = query
            .iter()
            .map(|(k, v)| format!("{k}={}", urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&");
        format!("{}/api/log?{query}", self.base_url)
    }
}

#[async_trait]
impl Collector for HttpCollector {
    async fn transaction_by_hash(&self, tx_hash: &str) -> CollectorResult<Option<Value>> {
        let url = format!(
            "{}/api/transaction?txHash={}",
            self.base_url,
            urlencoding::encode(tx_hash)
        );
        let body: TransactionResponse = self.get_json(&url).await?;
        if !body.success {
            return Ok(None);
        }
        Ok(body
            .transactions
            .first()
            .and_then(|tx| tx.pointer("/wrappedEVMAccount/readableReceipt"))
            .filter(|receipt| !receipt.is_null())
            .cloned())
    }

    async fn logs_by_filter(&self, filter: &Value) -> CollectorResult<Vec<Value>> {
        let base = self.log_query_url(filter);
        let mut logs = Vec::new();
        let mut page = 1;
        let mut total_pages = 1;

        while page <= total_pages.min(MAX_LOG_PAGES) {
            let body: LogPage = self.get_json(&format!("{base}&page={page}")).await?;
            if !body.success || (page == 1 && body.logs.is_empty()) {
                break;
            }
            if page == 1 {
                total_pages = body.total_pages.max(1);
            }
            logs.extend(
                body.logs
                    .into_iter()
                    .filter_map(|item| item.get("log").cloned()),
            );
            page += 1;
        }

        tracing::debug!(logs = logs.len(), pages = page - 1, "Collector log query finished");
        Ok(logs)
    }
}
