use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum CollectorError {
    #[error("Collector request failed: {0}")]
    Request(String),

    #[error("Invalid collector response: {0}")]
    InvalidResponse(String),
}

pub type CollectorResult<T> = Result<T, CollectorError>;

/// Read-only historical data source consulted when the active node lacks data.
#[async_trait]
pub trait Collector: Send + Sync + 'static {
    /// Readable receipt of a transaction, if the collector has it.
    async fn transaction_by_hash(&self, tx_hash: &str) -> CollectorResult<Option<Value>>;

    /// All logs matching an `eth_getLogs` filter object, across every result page.
    async fn logs_by_filter(&self, filter: &Value) -> CollectorResult<Vec<Value>>;
}
