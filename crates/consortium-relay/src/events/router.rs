//! In-memory event router.
//!
//! Tracks every live WebSocket connection, classified by scope, and fans
//! out events to the subset of an account's connections a recipient filter
//! selects. Delivery is best-effort: a full or closed outbound channel
//! drops the frame for that recipient and the others are unaffected.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tracing::{debug, info};

/// Capacity of each connection's outbound frame channel.
const OUTBOUND_CAPACITY: usize = 256;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Which subset of the account's events a connection receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionScope {
    /// Dashboard connection: sees everything.
    User,
    /// Agent wrapper for one session: sees only that session's traffic.
    Session { session_id: String },
    /// Per-host daemon: sees only that machine's traffic.
    Machine { machine_id: String },
}

/// Result of a forwarded request awaited by the RPC bridge.
pub type PendingResult = Result<serde_json::Value, String>;

/// A live client connection registered with the router.
pub struct ClientConnection {
    pub id: u64,
    pub account_id: String,
    pub scope: ConnectionScope,
    outbound: mpsc::Sender<String>,
    /// Pending server→client request acks, keyed by correlation id.
    pending: Mutex<HashMap<String, oneshot::Sender<PendingResult>>>,
}

impl ClientConnection {
    /// Create a connection and the receiving half of its outbound channel.
    pub fn new(
        account_id: String,
        scope: ConnectionScope,
    ) -> (Arc<Self>, mpsc::Receiver<String>) {
        let (outbound, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let conn = Arc::new(Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            account_id,
            scope,
            outbound,
            pending: Mutex::new(HashMap::new()),
        });
        (conn, rx)
    }

    /// Queue a frame for delivery. Returns `false` when the frame was
    /// dropped because the connection is gone or backed up.
    pub fn send(&self, frame: String) -> bool {
        self.outbound.try_send(frame).is_ok()
    }

    /// Register a pending request and return a receiver for its ack.
    pub async fn register_pending(&self, request_id: String) -> oneshot::Receiver<PendingResult> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id, tx);
        rx
    }

    /// Complete a pending request with the client's ack.
    pub async fn complete_pending(&self, request_id: &str, result: PendingResult) -> bool {
        if let Some(tx) = self.pending.lock().await.remove(request_id) {
            tx.send(result).is_ok()
        } else {
            false
        }
    }

    /// Drop all pending requests; their waiters observe a closed channel.
    pub async fn cancel_all_pending(&self) {
        self.pending.lock().await.clear();
    }
}

/// Event class on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventName {
    Update,
    Ephemeral,
}

impl EventName {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Update => "update",
            Self::Ephemeral => "ephemeral",
        }
    }
}

/// Selects which of an account's connections receive an emission.
#[derive(Debug, Clone)]
pub enum RecipientFilter {
    /// The session's own agent connection plus every dashboard.
    SessionInterested(String),
    /// Dashboards only.
    UserScopedOnly,
    /// The machine's own daemon connection plus every dashboard.
    MachineScoped(String),
    /// Every authenticated connection of the account.
    AllAuthenticated,
}

impl RecipientFilter {
    fn matches(&self, scope: &ConnectionScope) -> bool {
        match (self, scope) {
            (_, ConnectionScope::User) => true,
            (Self::SessionInterested(sid), ConnectionScope::Session { session_id }) => {
                sid == session_id
            }
            (Self::MachineScoped(mid), ConnectionScope::Machine { machine_id }) => {
                mid == machine_id
            }
            (Self::AllAuthenticated, _) => true,
            _ => false,
        }
    }
}

/// Parameters of one emission.
pub struct EmitParams {
    pub account_id: String,
    pub event: EventName,
    pub payload: serde_json::Value,
    pub filter: RecipientFilter,
    /// Connection that triggered the emission and must not receive its own
    /// echo.
    pub skip_connection: Option<u64>,
}

/// Per-account registry of live connections with filtered fan-out.
#[derive(Clone, Default)]
pub struct EventRouter {
    connections: Arc<RwLock<HashMap<String, Vec<Arc<ClientConnection>>>>>,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection under its account.
    pub async fn add(&self, conn: Arc<ClientConnection>) {
        let mut connections = self.connections.write().await;
        let entry = connections.entry(conn.account_id.clone()).or_default();
        entry.push(Arc::clone(&conn));
        info!(
            account_id = %conn.account_id,
            connection_id = conn.id,
            scope = ?conn.scope,
            "Connection registered"
        );
    }

    /// Remove a connection; the account entry disappears with its last one.
    pub async fn remove(&self, account_id: &str, connection_id: u64) {
        let mut connections = self.connections.write().await;
        if let Some(entry) = connections.get_mut(account_id) {
            entry.retain(|c| c.id != connection_id);
            if entry.is_empty() {
                connections.remove(account_id);
            }
        }
        info!(account_id = %account_id, connection_id, "Connection removed");
    }

    /// Fan an event out to the account's matching connections.
    ///
    /// The connection list is snapshotted under the read lock, so a
    /// concurrent remove cannot invalidate the iteration. Send failures
    /// are not retried and do not affect other recipients.
    pub async fn emit(&self, params: EmitParams) {
        let recipients: Vec<Arc<ClientConnection>> = {
            let connections = self.connections.read().await;
            match connections.get(&params.account_id) {
                Some(entry) => entry
                    .iter()
                    .filter(|c| params.skip_connection != Some(c.id))
                    .filter(|c| params.filter.matches(&c.scope))
                    .cloned()
                    .collect(),
                None => return,
            }
        };

        if recipients.is_empty() {
            return;
        }

        let frame = serde_json::json!({
            "type": params.event.as_str(),
            "payload": params.payload,
        })
        .to_string();

        for conn in recipients {
            if !conn.send(frame.clone()) {
                debug!(
                    account_id = %params.account_id,
                    connection_id = conn.id,
                    "Dropped frame for slow or closed connection"
                );
            }
        }
    }

    /// Number of live connections for an account.
    #[cfg(test)]
    pub async fn connection_count(&self, account_id: &str) -> usize {
        self.connections
            .read()
            .await
            .get(account_id)
            .map_or(0, Vec::len)
    }
}
