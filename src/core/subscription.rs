//! Client log subscriptions and the index the relay keeps over them.
use std::{
    collections::{BTreeSet, HashMap, HashSet},
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;

use crate::core::error::{GatewayError, GatewayResult};

/// Length of a subscription id, `0x` prefix included.
pub const SUBSCRIPTION_ID_LEN: usize = 46;

/// Opaque subscription token: `0x` followed by 44 hex characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(String);

impl SubscriptionId {
    /// Derive a fresh id from 32 random bytes.
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        rand::rng().fill_bytes(&mut seed);
        let digest = Sha256::digest(hex::encode(seed).as_bytes());
        let mut id = format!("0x{}", hex::encode(digest));
        id.truncate(SUBSCRIPTION_ID_LEN);
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SubscriptionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for SubscriptionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Normalized `eth_subscribe("logs", filter)` filter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogFilter {
    /// Lowercased contract addresses; empty matches every address.
    pub addresses: BTreeSet<String>,
    /// Positional topic matchers; `None` is a wildcard for that position.
    pub topics: Vec<Option<String>>,
}

impl LogFilter {
    /// Normalize the parameters of an `eth_subscribe` call.
    ///
    /// Only the `logs` subscription kind is served.
    pub fn from_subscribe_params(params: &Value) -> GatewayResult<Self> {
        match params.get(0).and_then(Value::as_str) {
            Some("logs") => {}
            Some(other) => {
                return Err(GatewayError::InvalidParams(format!(
                    "Unsupported subscription type: {other}"
                )));
            }
            None => {
                return Err(GatewayError::InvalidParams(
                    "Missing subscription type".to_string(),
                ));
            }
        }

        match params.get(1) {
            None | Some(Value::Null) => Ok(Self::default()),
            Some(filter @ Value::Object(_)) => Self::from_filter_object(filter),
            Some(_) => Err(GatewayError::InvalidParams(
                "Log filter must be an object".to_string(),
            )),
        }
    }

    fn from_filter_object(filter: &Value) -> GatewayResult<Self> {
        let addresses = match filter.get("address") {
            None | Some(Value::Null) => BTreeSet::new(),
            Some(Value::String(address)) => BTreeSet::from([address.to_lowercase()]),
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| {
                    item.as_str().map(str::to_lowercase).ok_or_else(|| {
                        GatewayError::InvalidParams("Addresses must be strings".to_string())
                    })
                })
                .collect::<GatewayResult<BTreeSet<_>>>()?,
            Some(_) => {
                return Err(GatewayError::InvalidParams(
                    "Address must be a string or an array of strings".to_string(),
                ));
            }
        };

        let topics = match filter.get("topics") {
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| match item {
                    Value::Null => Ok(None),
                    Value::String(topic) => Ok(Some(topic.to_lowercase())),
                    _ => Err(GatewayError::InvalidParams(
                        "Topics must be strings or null".to_string(),
                    )),
                })
                .collect::<GatewayResult<Vec<_>>>()?,
            _ => Vec::new(),
        };

        Ok(Self { addresses, topics })
    }
}

/// Process-unique id of one client WebSocket connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Frame queued for a client socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Close { code: u16, reason: String },
}

/// Sending half of a client connection, shared with the relay.
///
/// The socket writer drains the paired receiver; once the socket is gone the
/// handle reports closed and further sends are dropped.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<Outbound>,
    closed: Arc<AtomicBool>,
}

impl ClientHandle {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                id: ConnectionId::next(),
                tx,
                closed: Arc::new(AtomicBool::new(false)),
            },
            rx,
        )
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && !self.tx.is_closed()
    }

    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Queue a text frame. Returns false if the connection is closed.
    pub fn send_text(&self, text: String) -> bool {
        self.is_open() && self.tx.send(Outbound::Text(text)).is_ok()
    }

    pub fn send_json(&self, value: &Value) -> bool {
        self.send_text(value.to_string())
    }

    /// Queue a close frame and mark the connection closed.
    pub fn close(&self, code: u16, reason: impl Into<String>) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        let _ = self.tx.send(Outbound::Close {
            code,
            reason: reason.into(),
        });
        true
    }
}

/// One registered subscription.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub owner: ClientHandle,
    /// JSON-RPC id of the `eth_subscribe` call that created it.
    pub request_id: Value,
    pub filter: LogFilter,
}

/// In-memory index between client connections and subscription ids.
///
/// Synchronous and I/O free; callers serialize access.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    by_id: HashMap<SubscriptionId, Subscription>,
    by_connection: HashMap<ConnectionId, HashSet<SubscriptionId>>,
    pending_unsubscribe: HashMap<SubscriptionId, Value>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscription. An existing entry with the same id is replaced.
    pub fn add(
        &mut self,
        id: SubscriptionId,
        owner: ClientHandle,
        filter: LogFilter,
        request_id: Value,
    ) {
        if self.by_id.contains_key(&id) {
            self.remove_by_id(&id);
        }
        self.by_connection
            .entry(owner.id())
            .or_default()
            .insert(id.clone());
        self.by_id.insert(
            id.clone(),
            Subscription {
                id,
                owner,
                request_id,
                filter,
            },
        );
    }

    pub fn get_by_id(&self, id: &SubscriptionId) -> Option<&Subscription> {
        self.by_id.get(id)
    }

    pub fn ids_by_connection(&self, connection: ConnectionId) -> Vec<SubscriptionId> {
        self.by_connection
            .get(&connection)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// JSON-RPC id of the request that created `id`.
    pub fn request_id(&self, id: &SubscriptionId) -> Option<&Value> {
        self.by_id.get(id).map(|sub| &sub.request_id)
    }

    pub fn remove_by_id(&mut self, id: &SubscriptionId) -> Option<Subscription> {
        let removed = self.by_id.remove(id)?;
        let connection = removed.owner.id();
        if let Some(ids) = self.by_connection.get_mut(&connection) {
            ids.remove(id);
            if ids.is_empty() {
                self.by_connection.remove(&connection);
            }
        }
        self.pending_unsubscribe.remove(id);
        Some(removed)
    }

    /// Drop every subscription owned by `connection`, returning their ids.
    pub fn remove_by_connection(&mut self, connection: ConnectionId) -> Vec<SubscriptionId> {
        let ids: Vec<SubscriptionId> = self
            .by_connection
            .remove(&connection)
            .map(|ids| ids.into_iter().collect())
            .unwrap_or_default();
        for id in &ids {
            self.by_id.remove(id);
            self.pending_unsubscribe.remove(id);
        }
        ids
    }

    /// Remember which `eth_unsubscribe` call is waiting on the upstream ack for `id`.
    pub fn set_pending_unsubscribe(&mut self, id: &SubscriptionId, request_id: Value) {
        if self.by_id.contains_key(id) {
            self.pending_unsubscribe.insert(id.clone(), request_id);
        }
    }

    pub fn take_pending_unsubscribe(&mut self, id: &SubscriptionId) -> Option<Value> {
        self.pending_unsubscribe.remove(id)
    }

    /// Empty the registry, returning everything it held.
    pub fn drain(&mut self) -> Vec<Subscription> {
        self.by_connection.clear();
        self.pending_unsubscribe.clear();
        self.by_id.drain().map(|(_, sub)| sub).collect()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn connection_count(&self) -> usize {
        self.by_connection.len()
    }
}
