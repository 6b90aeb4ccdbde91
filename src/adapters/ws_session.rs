use std::{net::IpAddr, sync::Arc, time::Duration};

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::time::timeout;
use tracing::Instrument;

use crate::{
    adapters::http_handler::admit,
    core::{
        GatewayService,
        error::GATEWAY_ERROR_CODE,
        rpc::{JsonRpcRequest, JsonRpcResponse, RpcError, dispatcher::RequestContext},
        subscription::{ClientHandle, Outbound},
    },
};

/// Close code for frames that are not JSON-RPC requests.
pub const CLOSE_PROTOCOL_ERROR: u16 = 1002;
pub const CLOSE_PROTOCOL_ERROR_REASON: &str = "Invalid rpc socket frame";

/// How long queued frames may take to flush after the client goes away.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Parse one client frame. `None` means the socket must be closed.
pub fn parse_frame(text: &str) -> Option<JsonRpcRequest> {
    serde_json::from_str::<JsonRpcRequest>(text)
        .ok()
        .filter(JsonRpcRequest::is_well_formed)
}

/// Serve one client WebSocket until either side closes it.
///
/// Requests are dispatched concurrently; replies and subscription
/// notifications share one ordered writer.
pub async fn serve(socket: WebSocket, gateway: Arc<GatewayService>, source: IpAddr) {
    let (client, mut outbound) = ClientHandle::new();
    let span = tracing::info_span!("ws_session", connection = %client.id(), %source);
    let (mut sink, mut stream) = socket.split();

    let mut writer = tokio::spawn(
        async move {
            while let Some(frame) = outbound.recv().await {
                let message = match frame {
                    Outbound::Text(text) => Message::Text(text.into()),
                    Outbound::Close { code, reason } => {
                        let _ = sink
                            .send(Message::Close(Some(CloseFrame {
                                code,
                                reason: reason.into(),
                            })))
                            .await;
                        break;
                    }
                };
                if sink.send(message).await.is_err() {
                    break;
                }
            }
        }
        .instrument(span.clone()),
    );

    async {
        tracing::debug!("Client connected");
        while let Some(message) = stream.next().await {
            let text = match message {
                Ok(Message::Text(text)) => text.to_string(),
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => text,
                    Err(_) => {
                        client.close(CLOSE_PROTOCOL_ERROR, CLOSE_PROTOCOL_ERROR_REASON);
                        break;
                    }
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => {
                    tracing::debug!(error = %e, "Client socket error");
                    break;
                }
            };

            let Some(request) = parse_frame(&text) else {
                tracing::debug!("Closing socket after malformed frame");
                client.close(CLOSE_PROTOCOL_ERROR, CLOSE_PROTOCOL_ERROR_REASON);
                break;
            };
            tokio::spawn(
                handle_request(gateway.clone(), source, client.clone(), request)
                    .in_current_span(),
            );

            if !client.is_open() {
                break;
            }
        }

        // Release subscriptions before the handle goes away.
        client.mark_closed();
        let released = gateway.relay().on_client_closed(client.id());
        tracing::debug!(released, "Client disconnected");
    }
    .instrument(span)
    .await;

    drop(client);
    if timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err() {
        writer.abort();
    }
}

async fn handle_request(
    gateway: Arc<GatewayService>,
    source: IpAddr,
    client: ClientHandle,
    request: JsonRpcRequest,
) {
    if let Some(rejection) = admit(&gateway, source, &request).await {
        let error = RpcError {
            message: rejection.to_string(),
            code: GATEWAY_ERROR_CODE,
        };
        client.send_text(JsonRpcResponse::failure(request.id_or_null(), error).to_json_string());
        return;
    }

    let ctx = RequestContext::websocket(source, client.clone());
    if let Some(response) = gateway
        .dispatcher()
        .dispatch(&ctx, &request)
        .await
        .into_reply()
    {
        client.send_text(response.to_json_string());
    }
}
