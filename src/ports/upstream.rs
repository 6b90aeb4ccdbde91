use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum UpstreamError {
    #[error("Failed to connect to upstream log server: {0}")]
    Connect(String),

    #[error("Connection to upstream log server timed out after {0} seconds")]
    Timeout(u64),
}

/// An open link to the upstream log server.
///
/// `outbound` carries text frames to the server; `inbound` yields frames from
/// it and ends when the connection is lost. Dropping `outbound` closes the link.
pub struct UpstreamLink {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<String>,
}

/// Port that opens the relay's upstream link.
#[async_trait]
pub trait UpstreamConnector: Send + Sync + 'static {
    async fn connect(&self) -> Result<UpstreamLink, UpstreamError>;
}
