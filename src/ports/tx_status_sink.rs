use async_trait::async_trait;
use chrono::{DateTime, Utc};
use eyre::Result;
use serde::{Deserialize, Serialize};

/// Outcome of one `eth_sendRawTransaction` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxStatus {
    /// Hash returned by the node, when accepted.
    pub tx_hash: Option<String>,
    pub accepted: bool,
    /// Node error message, when rejected.
    pub reason: Option<String>,
    pub source_ip: String,
    pub node_url: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Storage collaborator that receives buffered transaction statuses.
#[async_trait]
pub trait TxStatusSink: Send + Sync + 'static {
    async fn persist(&self, batch: Vec<TxStatus>) -> Result<()>;
}
