//! Bridge between client log subscriptions and the single upstream log server link.
//!
//! The relay owns the [`SubscriptionRegistry`] and the upstream link. Client
//! sessions call [`EventRelay::subscribe`], [`EventRelay::unsubscribe`] and
//! [`EventRelay::on_client_closed`]; the run loop feeds upstream frames into
//! [`EventRelay::handle_frame`]. Replies to `eth_subscribe`/`eth_unsubscribe`
//! are sent when the upstream acknowledges, not when the call returns.
//!
//! Link states: `Disconnected -> Connecting -> Connected -> Disconnected`.
//! Every transition into `Disconnected` closes all subscriber sockets and
//! clears the registry, since the upstream forgets its subscriptions too.
use std::{
    collections::HashSet,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicU8, Ordering},
    },
    time::Duration,
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::{sync::mpsc, time::sleep};
use tracing::Instrument;

use crate::{
    config::{UpstreamConfig, WebsocketConfig},
    core::{
        error::{GATEWAY_ERROR_CODE, GatewayError, GatewayResult},
        rpc::{JsonRpcResponse, RpcError, subscription_notification},
        subscription::{
            ClientHandle, ConnectionId, LogFilter, SubscriptionId, SubscriptionRegistry,
        },
    },
    metrics,
    ports::upstream::UpstreamConnector,
    utils::graceful_shutdown::ShutdownToken,
};

/// Close code sent to subscribers when the upstream link is lost ("try again later").
pub const CLOSE_UPSTREAM_LOST: u16 = 1013;
pub const CLOSE_UPSTREAM_LOST_REASON: &str = "Upstream log server disconnected";

const STATE_DISCONNECTED: u8 = 0;
const STATE_CONNECTING: u8 = 1;
const STATE_CONNECTED: u8 = 2;

/// State of the upstream link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

impl LinkState {
    fn from_u8(value: u8) -> Self {
        match value {
            STATE_CONNECTING => LinkState::Connecting,
            STATE_CONNECTED => LinkState::Connected,
            _ => LinkState::Disconnected,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            LinkState::Disconnected => STATE_DISCONNECTED,
            LinkState::Connecting => STATE_CONNECTING,
            LinkState::Connected => STATE_CONNECTED,
        }
    }
}

/// Control frames sent to the upstream log server.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum ControlFrame {
    Subscribe {
        subscription_id: SubscriptionId,
        address: Vec<String>,
        topics: Vec<Option<String>>,
        ipport: String,
    },
    Unsubscribe {
        subscription_id: SubscriptionId,
        #[serde(skip_serializing_if = "Option::is_none")]
        ipport: Option<String>,
    },
}

/// Frames received from the upstream log server.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum UpstreamFrame {
    Subscribe {
        subscription_id: SubscriptionId,
        #[serde(default)]
        success: bool,
        #[serde(default)]
        error: Option<Value>,
    },
    Unsubscribe {
        subscription_id: SubscriptionId,
        #[serde(default)]
        success: bool,
    },
    LogFound {
        #[serde(default)]
        subscription_id: Option<SubscriptionId>,
        #[serde(default)]
        subscribers: Vec<SubscriptionId>,
        #[serde(default)]
        logs: Vec<Value>,
    },
}

impl UpstreamFrame {
    fn method(&self) -> &'static str {
        match self {
            UpstreamFrame::Subscribe { .. } => "subscribe",
            UpstreamFrame::Unsubscribe { .. } => "unsubscribe",
            UpstreamFrame::LogFound { .. } => "log_found",
        }
    }
}

/// Fans one upstream event stream out to many client subscriptions.
pub struct EventRelay {
    enabled: bool,
    ipport: String,
    reconnect_delay: Duration,
    state: AtomicU8,
    registry: Mutex<SubscriptionRegistry>,
    link: Mutex<Option<mpsc::UnboundedSender<String>>>,
}

impl EventRelay {
    pub fn new(websocket: &WebsocketConfig, upstream: &UpstreamConfig, ipport: String) -> Self {
        Self {
            enabled: websocket.enabled && websocket.serve_subscriptions && upstream.enabled,
            ipport,
            reconnect_delay: Duration::from_secs(upstream.reconnect_delay_secs),
            state: AtomicU8::new(STATE_DISCONNECTED),
            registry: Mutex::new(SubscriptionRegistry::new()),
            link: Mutex::new(None),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn link_state(&self) -> LinkState {
        LinkState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: LinkState) {
        let previous = LinkState::from_u8(self.state.swap(state.as_u8(), Ordering::AcqRel));
        if previous != state {
            tracing::info!(from = ?previous, to = ?state, "Upstream link state changed");
        }
        metrics::set_relay_link_state(state.as_u8());
    }

    pub fn subscription_count(&self) -> usize {
        self.lock_registry().len()
    }

    /// Ids currently owned by `connection`.
    pub fn subscriptions_of(&self, connection: ConnectionId) -> Vec<SubscriptionId> {
        self.lock_registry().ids_by_connection(connection)
    }

    fn lock_registry(&self) -> MutexGuard<'_, SubscriptionRegistry> {
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_link(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<String>>> {
        self.link.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn send_control(&self, frame: &ControlFrame) -> bool {
        let text = match serde_json::to_string(frame) {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize control frame");
                return false;
            }
        };
        match self.lock_link().as_ref() {
            Some(link) => link.send(text).is_ok(),
            None => false,
        }
    }

    fn publish_subscription_count(registry: &SubscriptionRegistry) {
        metrics::set_active_subscriptions(registry.len());
    }

    /// Register a log subscription for `client` and forward it upstream.
    ///
    /// On success the client is answered once the upstream acknowledges.
    pub fn subscribe(
        &self,
        client: &ClientHandle,
        request_id: Value,
        params: &Value,
    ) -> GatewayResult<SubscriptionId> {
        if !self.enabled {
            return Err(GatewayError::SubscriptionsDisabled);
        }
        let filter = LogFilter::from_subscribe_params(params)?;
        if self.link_state() != LinkState::Connected {
            return Err(GatewayError::UpstreamUnavailable);
        }

        let id = SubscriptionId::generate();
        let frame = ControlFrame::Subscribe {
            subscription_id: id.clone(),
            address: filter.addresses.iter().cloned().collect(),
            topics: filter.topics.clone(),
            ipport: self.ipport.clone(),
        };

        // Checked under the registry lock so a concurrent close either sees
        // this entry in `on_client_closed` or makes us refuse it here.
        let mut registry = self.lock_registry();
        if !client.is_open() {
            return Err(GatewayError::ConnectionClosed);
        }
        registry.add(id.clone(), client.clone(), filter, request_id);
        if !self.send_control(&frame) {
            registry.remove_by_id(&id);
            return Err(GatewayError::UpstreamUnavailable);
        }
        Self::publish_subscription_count(&registry);
        tracing::debug!(subscription = %id, connection = %client.id(), "Subscription forwarded upstream");
        Ok(id)
    }

    /// Ask the upstream to drop `params[0]`, which must be owned by `client`.
    ///
    /// The client is answered once the upstream acknowledges.
    pub fn unsubscribe(
        &self,
        client: &ClientHandle,
        request_id: Value,
        params: &Value,
    ) -> GatewayResult<SubscriptionId> {
        if !self.enabled {
            return Err(GatewayError::SubscriptionsDisabled);
        }
        let id = params
            .get(0)
            .and_then(Value::as_str)
            .map(SubscriptionId::from)
            .ok_or_else(|| GatewayError::InvalidParams("Missing subscription id".to_string()))?;

        let mut registry = self.lock_registry();
        let owned = registry
            .get_by_id(&id)
            .is_some_and(|sub| sub.owner.id() == client.id());
        if !owned {
            return Err(GatewayError::InvalidParams(format!(
                "Subscription {id} not found"
            )));
        }

        registry.set_pending_unsubscribe(&id, request_id);
        let frame = ControlFrame::Unsubscribe {
            subscription_id: id.clone(),
            ipport: None,
        };
        if !self.send_control(&frame) {
            registry.take_pending_unsubscribe(&id);
            return Err(GatewayError::UpstreamUnavailable);
        }
        Ok(id)
    }

    /// Drop every subscription of a closed connection and tell the upstream.
    ///
    /// Returns how many unsubscribe frames were emitted.
    pub fn on_client_closed(&self, connection: ConnectionId) -> usize {
        let mut registry = self.lock_registry();
        let ids = registry.remove_by_connection(connection);
        Self::publish_subscription_count(&registry);
        drop(registry);

        let sent = ids
            .into_iter()
            .filter(|id| {
                self.send_control(&ControlFrame::Unsubscribe {
                    subscription_id: id.clone(),
                    ipport: None,
                })
            })
            .count();
        if sent > 0 {
            tracing::debug!(connection = %connection, sent, "Released subscriptions of closed connection");
        }
        sent
    }

    /// Handle one upstream text frame. Unparseable frames are logged and dropped.
    pub fn handle_frame(&self, text: &str) {
        let frame = match serde_json::from_str::<UpstreamFrame>(text) {
            Ok(frame) => frame,
            Err(e) => {
                let err = GatewayError::UpstreamProtocolError(e.to_string());
                tracing::warn!(error = %err, "Dropping upstream frame");
                metrics::increment_upstream_frame("invalid");
                return;
            }
        };

        let span = tracing::debug_span!("upstream_frame", method = frame.method());
        let _enter = span.enter();
        metrics::increment_upstream_frame(frame.method());

        match frame {
            UpstreamFrame::Subscribe {
                subscription_id,
                success,
                error,
            } => self.on_subscribe_ack(&subscription_id, success, error),
            UpstreamFrame::Unsubscribe {
                subscription_id,
                success,
            } => self.on_unsubscribe_ack(&subscription_id, success),
            UpstreamFrame::LogFound {
                subscription_id,
                subscribers,
                logs,
            } => {
                for id in subscription_id.into_iter().chain(subscribers) {
                    self.deliver_logs(&id, &logs);
                }
            }
        }
    }

    fn on_subscribe_ack(&self, id: &SubscriptionId, success: bool, error: Option<Value>) {
        let mut registry = self.lock_registry();
        let Some(sub) = registry.get_by_id(id) else {
            tracing::debug!(subscription = %id, "Subscribe ack for unknown subscription");
            return;
        };

        if success {
            let reply = JsonRpcResponse::success(sub.request_id.clone(), Value::from(id.as_str()));
            sub.owner.send_text(reply.to_json_string());
            return;
        }

        let message = error
            .as_ref()
            .and_then(|e| e.get("message").and_then(Value::as_str).map(str::to_string))
            .or_else(|| error.as_ref().and_then(Value::as_str).map(str::to_string))
            .unwrap_or_else(|| "Subscription rejected by log server".to_string());
        tracing::info!(subscription = %id, %message, "Upstream rejected subscription");

        let reply = JsonRpcResponse::failure(
            sub.request_id.clone(),
            RpcError {
                message,
                code: GATEWAY_ERROR_CODE,
            },
        );
        sub.owner.send_text(reply.to_json_string());
        registry.remove_by_id(id);
        Self::publish_subscription_count(&registry);
    }

    fn on_unsubscribe_ack(&self, id: &SubscriptionId, success: bool) {
        let mut registry = self.lock_registry();
        let Some(sub) = registry.get_by_id(id) else {
            return;
        };
        let owner = sub.owner.clone();
        let fallback_id = sub.request_id.clone();
        let request_id = registry
            .take_pending_unsubscribe(id)
            .unwrap_or(fallback_id);

        owner.send_text(JsonRpcResponse::success(request_id, Value::Bool(success)).to_json_string());
        if success {
            registry.remove_by_id(id);
            Self::publish_subscription_count(&registry);
        }
    }

    fn deliver_logs(&self, id: &SubscriptionId, logs: &[Value]) {
        let mut registry = self.lock_registry();
        let Some(sub) = registry.get_by_id(id) else {
            // Stale, or owned by another gateway instance.
            return;
        };

        if !sub.owner.is_open() {
            tracing::debug!(subscription = %id, "Subscriber gone, unsubscribing upstream");
            self.send_control(&ControlFrame::Unsubscribe {
                subscription_id: id.clone(),
                ipport: Some(self.ipport.clone()),
            });
            registry.remove_by_id(id);
            Self::publish_subscription_count(&registry);
            return;
        }

        for log in logs {
            let mut log = log.clone();
            if let Some(object) = log.as_object_mut() {
                object.insert("removed".to_string(), Value::Bool(false));
            }
            if !sub.owner.send_json(&subscription_notification(id.as_str(), log)) {
                break;
            }
        }
    }

    /// Attach a freshly opened link.
    pub fn on_link_established(&self, outbound: mpsc::UnboundedSender<String>) {
        *self.lock_link() = Some(outbound);
        self.set_state(LinkState::Connected);
    }

    /// The link is gone: close every subscriber socket once and clear the registry.
    ///
    /// Returns how many client sockets were closed.
    pub fn on_link_lost(&self) -> usize {
        self.lock_link().take();
        self.set_state(LinkState::Disconnected);

        let drained = {
            let mut registry = self.lock_registry();
            let drained = registry.drain();
            Self::publish_subscription_count(&registry);
            drained
        };

        let mut closed = HashSet::new();
        for sub in drained {
            if closed.insert(sub.owner.id()) {
                sub.owner.close(CLOSE_UPSTREAM_LOST, CLOSE_UPSTREAM_LOST_REASON);
            }
        }
        if !closed.is_empty() {
            tracing::warn!(sockets = closed.len(), "Closed subscriber sockets after upstream loss");
        }
        closed.len()
    }

    /// Keep a link to the upstream open until shutdown, reconnecting after
    /// `reconnect_delay` whenever it drops.
    pub async fn run(
        self: Arc<Self>,
        connector: Arc<dyn UpstreamConnector>,
        mut shutdown: ShutdownToken,
    ) {
        if !self.enabled {
            tracing::info!("Subscription relay is disabled");
            return;
        }

        loop {
            if shutdown.is_shutdown_initiated() {
                break;
            }

            self.set_state(LinkState::Connecting);
            let connected = tokio::select! {
                result = connector.connect() => result,
                _ = shutdown.wait_for_shutdown() => break,
            };

            match connected {
                Ok(link) => {
                    self.on_link_established(link.outbound);
                    let mut inbound = link.inbound;
                    let stopped = loop {
                        tokio::select! {
                            frame = inbound.recv() => match frame {
                                Some(text) => self.handle_frame(&text),
                                None => break false,
                            },
                            _ = shutdown.wait_for_shutdown() => break true,
                        }
                    };
                    self.on_link_lost();
                    if stopped {
                        break;
                    }
                    tracing::warn!("Upstream log server connection closed");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Could not connect to upstream log server");
                    self.on_link_lost();
                }
            }

            metrics::increment_upstream_reconnect();
            tracing::info!(
                delay = ?self.reconnect_delay,
                "Attempting to re-establish upstream log server stream"
            );
            tokio::select! {
                _ = sleep(self.reconnect_delay) => {}
                _ = shutdown.wait_for_shutdown() => break,
            }
        }

        self.on_link_lost();
        tracing::info!("Subscription relay stopped");
    }

    /// Spawn [`EventRelay::run`] on the runtime.
    pub fn spawn(
        self: &Arc<Self>,
        connector: Arc<dyn UpstreamConnector>,
        shutdown: ShutdownToken,
    ) -> tokio::task::JoinHandle<()> {
        let relay = Arc::clone(self);
        tokio::spawn(
            relay
                .run(connector, shutdown)
                .instrument(tracing::info_span!("upstream_relay")),
        )
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::core::subscription::Outbound;

    fn relay() -> EventRelay {
        EventRelay::new(
            &WebsocketConfig::default(),
            &UpstreamConfig::default(),
            "127.0.0.1__8080".to_string(),
        )
    }

    fn connected_relay() -> (EventRelay, mpsc::UnboundedReceiver<String>) {
        let relay = relay();
        let (tx, rx) = mpsc::unbounded_channel();
        relay.on_link_established(tx);
        (relay, rx)
    }

    fn next_text(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Value {
        match rx.try_recv().expect("frame queued") {
            Outbound::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    #[test]
    fn subscribe_requires_connected_link() {
        let relay = relay();
        let (client, _rx) = ClientHandle::new();
        let result = relay.subscribe(&client, json!(1), &json!(["logs", {}]));
        assert!(matches!(result, Err(GatewayError::UpstreamUnavailable)));
        assert_eq!(relay.subscription_count(), 0);
    }

    #[test]
    fn subscribe_disabled() {
        let relay = EventRelay::new(
            &WebsocketConfig {
                enabled: true,
                serve_subscriptions: false,
            },
            &UpstreamConfig::default(),
            "ip__1".to_string(),
        );
        let (client, _rx) = ClientHandle::new();
        assert!(matches!(
            relay.subscribe(&client, json!(1), &json!(["logs"])),
            Err(GatewayError::SubscriptionsDisabled)
        ));
    }

    #[test]
    fn subscribe_sends_normalized_control_frame() {
        let (relay, mut upstream) = connected_relay();
        let (client, _rx) = ClientHandle::new();
        let id = relay
            .subscribe(
                &client,
                json!(1),
                &json!(["logs", {"address": "0xABC", "topics": [null, "0xDEF"]}]),
            )
            .unwrap();

        let frame: Value = serde_json::from_str(&upstream.try_recv().unwrap()).unwrap();
        assert_eq!(
            frame,
            json!({
                "method": "subscribe",
                "params": {
                    "subscription_id": id.as_str(),
                    "address": ["0xabc"],
                    "topics": [null, "0xdef"],
                    "ipport": "127.0.0.1__8080",
                }
            })
        );
    }

    #[test]
    fn subscribe_ack_replies_with_original_request_id() {
        let (relay, _upstream) = connected_relay();
        let (client, mut rx) = ClientHandle::new();
        let id = relay
            .subscribe(&client, json!("req-1"), &json!(["logs"]))
            .unwrap();
        assert!(rx.try_recv().is_err());

        relay.handle_frame(
            &json!({"method": "subscribe", "subscription_id": id.as_str(), "success": true})
                .to_string(),
        );
        assert_eq!(
            next_text(&mut rx),
            json!({"id": "req-1", "jsonrpc": "2.0", "result": id.as_str()})
        );
    }

    #[test]
    fn subscribe_failure_replies_error_and_forgets() {
        let (relay, _upstream) = connected_relay();
        let (client, mut rx) = ClientHandle::new();
        let id = relay.subscribe(&client, json!(3), &json!(["logs"])).unwrap();

        relay.handle_frame(
            &json!({
                "method": "subscribe",
                "subscription_id": id.as_str(),
                "success": false,
                "error": {"message": "too many subscriptions"}
            })
            .to_string(),
        );
        assert_eq!(
            next_text(&mut rx),
            json!({"id": 3, "jsonrpc": "2.0", "error": {"message": "too many subscriptions", "code": -1}})
        );
        assert_eq!(relay.subscription_count(), 0);
    }

    #[test]
    fn unsubscribe_ack_uses_unsubscribe_request_id() {
        let (relay, mut upstream) = connected_relay();
        let (client, mut rx) = ClientHandle::new();
        let id = relay.subscribe(&client, json!(1), &json!(["logs"])).unwrap();
        upstream.try_recv().unwrap();

        relay
            .unsubscribe(&client, json!(2), &json!([id.as_str()]))
            .unwrap();
        let frame: Value = serde_json::from_str(&upstream.try_recv().unwrap()).unwrap();
        assert_eq!(
            frame,
            json!({"method": "unsubscribe", "params": {"subscription_id": id.as_str()}})
        );

        relay.handle_frame(
            &json!({"method": "unsubscribe", "subscription_id": id.as_str(), "success": false})
                .to_string(),
        );
        assert_eq!(
            next_text(&mut rx),
            json!({"id": 1, "jsonrpc": "2.0", "result": false})
        );
        assert_eq!(relay.subscription_count(), 1);

        relay
            .unsubscribe(&client, json!(4), &json!([id.as_str()]))
            .unwrap();
        relay.handle_frame(
            &json!({"method": "unsubscribe", "subscription_id": id.as_str(), "success": true})
                .to_string(),
        );
        assert_eq!(
            next_text(&mut rx),
            json!({"id": 4, "jsonrpc": "2.0", "result": true})
        );
        assert_eq!(relay.subscription_count(), 0);
    }

    #[test]
    fn unsubscribe_rejects_foreign_ids() {
        let (relay, _upstream) = connected_relay();
        let (owner, _rx1) = ClientHandle::new();
        let (other, _rx2) = ClientHandle::new();
        let id = relay.subscribe(&owner, json!(1), &json!(["logs"])).unwrap();
        assert!(matches!(
            relay.unsubscribe(&other, json!(2), &json!([id.as_str()])),
            Err(GatewayError::InvalidParams(_))
        ));
        assert!(relay.unsubscribe(&other, json!(2), &json!([])).is_err());
    }

    #[test]
    fn log_found_stamps_removed_and_preserves_order() {
        let (relay, _upstream) = connected_relay();
        let (client, mut rx) = ClientHandle::new();
        let id = relay.subscribe(&client, json!(1), &json!(["logs"])).unwrap();

        relay.handle_frame(
            &json!({
                "method": "log_found",
                "subscription_id": id.as_str(),
                "logs": [{"logIndex": "0x0"}, {"logIndex": "0x1", "removed": true}]
            })
            .to_string(),
        );

        for index in ["0x0", "0x1"] {
            let notification = next_text(&mut rx);
            assert_eq!(notification["method"], "eth_subscription");
            assert_eq!(notification["params"]["subscription"], id.as_str());
            assert_eq!(notification["params"]["result"]["logIndex"], index);
            assert_eq!(notification["params"]["result"]["removed"], false);
        }
    }

    #[test]
    fn log_found_for_unknown_id_is_dropped() {
        let (relay, mut upstream) = connected_relay();
        let (client, mut rx) = ClientHandle::new();
        relay.subscribe(&client, json!(1), &json!(["logs"])).unwrap();
        upstream.try_recv().unwrap();

        relay.handle_frame(
            &json!({"method": "log_found", "subscription_id": "0xfeed", "logs": [{}]}).to_string(),
        );
        assert!(rx.try_recv().is_err());
        assert!(upstream.try_recv().is_err());
    }

    #[test]
    fn log_found_for_closed_socket_unsubscribes_upstream() {
        let (relay, mut upstream) = connected_relay();
        let (client, rx) = ClientHandle::new();
        let id = relay.subscribe(&client, json!(1), &json!(["logs"])).unwrap();
        upstream.try_recv().unwrap();
        drop(rx);

        relay.handle_frame(
            &json!({"method": "log_found", "subscribers": [id.as_str()], "logs": [{}]}).to_string(),
        );
        let frame: Value = serde_json::from_str(&upstream.try_recv().unwrap()).unwrap();
        assert_eq!(frame["method"], "unsubscribe");
        assert_eq!(frame["params"]["subscription_id"], id.as_str());
        assert_eq!(frame["params"]["ipport"], "127.0.0.1__8080");
        assert_eq!(relay.subscription_count(), 0);
    }

    #[test]
    fn garbage_frames_are_ignored() {
        let (relay, _upstream) = connected_relay();
        relay.handle_frame("not json");
        relay.handle_frame(r#"{"method":"mystery"}"#);
        assert_eq!(relay.link_state(), LinkState::Connected);
    }

    #[test]
    fn client_close_emits_one_unsubscribe_per_subscription() {
        let (relay, mut upstream) = connected_relay();
        let (client, _rx) = ClientHandle::new();
        relay.subscribe(&client, json!(1), &json!(["logs"])).unwrap();
        relay.subscribe(&client, json!(2), &json!(["logs"])).unwrap();
        upstream.try_recv().unwrap();
        upstream.try_recv().unwrap();

        assert_eq!(relay.on_client_closed(client.id()), 2);
        for _ in 0..2 {
            let frame: Value = serde_json::from_str(&upstream.try_recv().unwrap()).unwrap();
            assert_eq!(frame["method"], "unsubscribe");
        }
        assert!(upstream.try_recv().is_err());
        assert!(relay.subscriptions_of(client.id()).is_empty());
    }

    #[test]
    fn subscribe_after_close_is_refused() {
        let (relay, mut upstream) = connected_relay();
        let (client, _rx) = ClientHandle::new();
        client.mark_closed();
        assert_eq!(relay.on_client_closed(client.id()), 0);

        assert!(matches!(
            relay.subscribe(&client, json!(1), &json!(["logs"])),
            Err(GatewayError::ConnectionClosed)
        ));
        assert_eq!(relay.subscription_count(), 0);
        assert!(upstream.try_recv().is_err());
    }

    #[test]
    fn subscribe_from_dropped_session_is_refused() {
        let (relay, mut upstream) = connected_relay();
        let (client, rx) = ClientHandle::new();
        drop(rx);

        assert!(relay.subscribe(&client, json!(1), &json!(["logs"])).is_err());
        assert!(relay.subscriptions_of(client.id()).is_empty());
        assert!(upstream.try_recv().is_err());
    }

    #[test]
    fn link_loss_closes_each_subscriber_once() {
        let (relay, _upstream) = connected_relay();
        let (first, mut rx1) = ClientHandle::new();
        let (second, mut rx2) = ClientHandle::new();
        relay.subscribe(&first, json!(1), &json!(["logs"])).unwrap();
        relay.subscribe(&first, json!(2), &json!(["logs"])).unwrap();
        relay.subscribe(&second, json!(3), &json!(["logs"])).unwrap();

        assert_eq!(relay.on_link_lost(), 2);
        assert_eq!(relay.subscription_count(), 0);
        assert_eq!(relay.link_state(), LinkState::Disconnected);

        for rx in [&mut rx1, &mut rx2] {
            assert!(matches!(
                rx.try_recv().unwrap(),
                Outbound::Close { code: CLOSE_UPSTREAM_LOST, .. }
            ));
            assert!(rx.try_recv().is_err());
        }
    }
}
