//! Data models for Consortium relay storage.
//!
//! Row structs map snake_case columns; JSON serialization uses the
//! camelCase field names the client protocol expects.

use serde::{Deserialize, Serialize};

/// An authenticated identity, keyed by its Ed25519 public key.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub id: String,
    pub public_key: String,
    /// Monotonic per-account event counter.
    pub seq: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A container for one agent conversation.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub account_id: String,
    /// Client-chosen idempotency key, unique per account.
    pub tag: String,
    /// Monotonic per-session message counter.
    pub seq: i64,
    pub metadata: String,
    pub metadata_version: i64,
    pub agent_state: Option<String>,
    pub agent_state_version: i64,
    pub data_encryption_key: Option<String>,
    pub active: bool,
    pub last_active_at: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

/// An immutable append-only entry in a session.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct SessionMessage {
    pub id: String,
    pub session_id: String,
    pub seq: i64,
    /// Wrapped ciphertext of shape `{"t":"encrypted","c":"<base64>"}`.
    pub content: String,
    pub local_id: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A registered agent host, keyed by `(account_id, id)`.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Machine {
    pub id: String,
    pub account_id: String,
    pub metadata: String,
    pub metadata_version: i64,
    pub daemon_state: Option<String>,
    pub daemon_state_version: i64,
    pub data_encryption_key: Option<String>,
    pub active: bool,
    pub last_active_at: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A pending or approved pairing between an ephemeral key and an account.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct PairingRequest {
    pub id: String,
    pub public_key: String,
    pub response: Option<String>,
    pub response_account_id: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl PairingRequest {
    /// A request is terminal once a response has been written.
    pub fn is_authorized(&self) -> bool {
        self.response.is_some() && self.response_account_id.is_some()
    }
}

/// Outcome of a version-checked conditional write.
#[derive(Debug, Clone)]
pub enum VersionedWrite<T> {
    /// The write was applied; carries the updated row.
    Applied(T),
    /// The expected version lost; carries the current version and value.
    Conflict { version: i64, value: Option<String> },
}
