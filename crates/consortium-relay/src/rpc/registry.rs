//! Per-account registry of RPC method registrations.
//!
//! Maps method names to the connection that registered them. All routing
//! is per-account: a socket can only invoke methods registered by sockets
//! of the same account. Method names are namespaced by the registering
//! client, typically prefixed with a session id.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::debug;

use crate::events::ClientConnection;

/// How long the server waits for the target's ack before failing a call.
pub const RPC_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Thread-safe per-account method registry.
#[derive(Clone, Default)]
pub struct RpcRegistry {
    methods: Arc<RwLock<HashMap<String, HashMap<String, Arc<ClientConnection>>>>>,
}

impl RpcRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a method for the connection's account, overwriting any
    /// prior registration of the same name.
    pub async fn register(&self, method: &str, conn: Arc<ClientConnection>) {
        let mut methods = self.methods.write().await;
        methods
            .entry(conn.account_id.clone())
            .or_default()
            .insert(method.to_string(), conn);
        debug!(method = %method, "RPC method registered");
    }

    /// Unregister a method if the current registration belongs to the
    /// given connection. Returns whether a registration was removed.
    pub async fn unregister(&self, account_id: &str, method: &str, connection_id: u64) -> bool {
        let mut methods = self.methods.write().await;
        let Some(entry) = methods.get_mut(account_id) else {
            return false;
        };

        let owned = entry.get(method).is_some_and(|c| c.id == connection_id);
        if owned {
            entry.remove(method);
            if entry.is_empty() {
                methods.remove(account_id);
            }
            debug!(method = %method, "RPC method unregistered");
        }
        owned
    }

    /// Look up the connection registered for a method.
    pub async fn lookup(&self, account_id: &str, method: &str) -> Option<Arc<ClientConnection>> {
        self.methods
            .read()
            .await
            .get(account_id)?
            .get(method)
            .cloned()
    }

    /// Drop every registration held by a disconnecting socket.
    pub async fn remove_connection(&self, account_id: &str, connection_id: u64) {
        let mut methods = self.methods.write().await;
        if let Some(entry) = methods.get_mut(account_id) {
            entry.retain(|_, c| c.id != connection_id);
            if entry.is_empty() {
                methods.remove(account_id);
            }
        }
    }

    #[cfg(test)]
    pub async fn method_count(&self, account_id: &str) -> usize {
        self.methods
            .read()
            .await
            .get(account_id)
            .map_or(0, HashMap::len)
    }
}
