use async_trait::async_trait;
use eyre::Result;

use crate::ports::tx_status_sink::{TxStatus, TxStatusSink};

/// Default sink: writes each transaction outcome as a structured log line
/// under the `shardgate::tx_status` target.
#[derive(Debug, Default)]
pub struct LogTxStatusSink;

#[async_trait]
impl TxStatusSink for LogTxStatusSink {
    async fn persist(&self, batch: Vec<TxStatus>) -> Result<()> {
        for status in &batch {
            tracing::info!(
                target: "shardgate::tx_status",
                tx_hash = status.tx_hash.as_deref().unwrap_or(""),
                accepted = status.accepted,
                reason = status.reason.as_deref().unwrap_or(""),
                source_ip = %status.source_ip,
                node = status.node_url.as_deref().unwrap_or(""),
                timestamp = %status.timestamp.to_rfc3339(),
                "Transaction status"
            );
        }
        Ok(())
    }
}
