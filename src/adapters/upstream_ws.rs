use std::{fmt::Display, time::Duration};

use async_trait::async_trait;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::{
    sync::{mpsc, oneshot},
    time::timeout,
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::Instrument;

use crate::{
    config::UpstreamConfig,
    ports::upstream::{UpstreamConnector, UpstreamError, UpstreamLink},
};

/// Opens the relay link to the log server over WebSocket.
///
/// Each link is pumped by two tasks: one writes queued control frames, the
/// other forwards text frames until the server goes away.
pub struct WsUpstreamConnector {
    url: String,
    connect_timeout_secs: u64,
}

impl WsUpstreamConnector {
    pub fn new(config: &UpstreamConfig) -> Self {
        Self {
            url: config.url.clone(),
            connect_timeout_secs: config.connect_timeout_secs,
        }
    }
}

#[async_trait]
impl UpstreamConnector for WsUpstreamConnector {
    async fn connect(&self) -> Result<UpstreamLink, UpstreamError> {
        tracing::info!(url = %self.url, "Connecting to upstream log server");

        let connecting = connect_async(self.url.as_str());
        let (stream, response) = timeout(Duration::from_secs(self.connect_timeout_secs), connecting)
            .await
            .map_err(|_| UpstreamError::Timeout(self.connect_timeout_secs))?
            .map_err(|e| UpstreamError::Connect(e.to_string()))?;
        tracing::info!(
            status = response.status().as_u16(),
            "Connected to upstream log server"
        );

        let (write, read) = stream.split();
        Ok(spawn_pumps(write, read))
    }
}

/// Start the writer and reader tasks for one link.
///
/// The reader stops as soon as the writer does, so a failed write surfaces
/// to the relay as a closed inbound stream.
fn spawn_pumps<W, R, E>(write: W, read: R) -> UpstreamLink
where
    W: Sink<Message> + Unpin + Send + 'static,
    W::Error: Display + Send,
    R: Stream<Item = Result<Message, E>> + Unpin + Send + 'static,
    E: Display + Send + 'static,
{
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<String>();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<String>();
    let (writer_alive, writer_gone) = oneshot::channel::<()>();

    tokio::spawn(
        write_frames(write, outbound_rx, writer_alive)
            .instrument(tracing::debug_span!("upstream_writer")),
    );
    tokio::spawn(
        read_frames(read, inbound_tx, writer_gone)
            .instrument(tracing::debug_span!("upstream_reader")),
    );

    UpstreamLink {
        outbound: outbound_tx,
        inbound: inbound_rx,
    }
}

async fn write_frames<W>(
    mut write: W,
    mut outbound: mpsc::UnboundedReceiver<String>,
    _alive: oneshot::Sender<()>,
) where
    W: Sink<Message> + Unpin,
    W::Error: Display,
{
    while let Some(text) = outbound.recv().await {
        if let Err(e) = write.send(Message::Text(text.into())).await {
            tracing::warn!(error = %e, "Failed to write upstream frame, dropping link");
            return;
        }
    }
    // Relay dropped the link
    let _ = write.send(Message::Close(None)).await;
}

async fn read_frames<R, E>(
    mut read: R,
    inbound: mpsc::UnboundedSender<String>,
    mut writer_gone: oneshot::Receiver<()>,
) where
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    loop {
        let message = tokio::select! {
            message = read.next() => message,
            _ = &mut writer_gone => break,
        };
        match message {
            Some(Ok(Message::Text(text))) => {
                if inbound.send(text.to_string()).is_err() {
                    break;
                }
            }
            Some(Ok(Message::Close(frame))) => {
                tracing::warn!(?frame, "Upstream log server closed the connection");
                break;
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                tracing::warn!(error = %e, "Upstream log server stream error");
                break;
            }
            None => break,
        }
    }
}
