//! Event payload shapes for the relay protocol.
//!
//! Updates are durable, account-sequenced events; ephemerals are unsequenced
//! presence signals. Both carry opaque ciphertext fields the relay never
//! reads.

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Serialize;

use crate::storage::{Machine, Session, SessionMessage};

/// Length of the random client-side idempotency key on update envelopes.
const UPDATE_KEY_LEN: usize = 12;

/// Generate the random key stamped on each update envelope.
pub fn update_key() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(UPDATE_KEY_LEN)
        .map(char::from)
        .collect()
}

/// A durable update event as delivered to clients.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateEnvelope {
    /// Random per-emission key for client-side deduplication.
    pub id: String,
    /// Account sequence number allocated for this update.
    pub seq: i64,
    pub body: UpdateBody,
    pub created_at: i64,
}

impl UpdateEnvelope {
    pub fn new(seq: i64, body: UpdateBody, created_at: i64) -> Self {
        Self {
            id: update_key(),
            seq,
            body,
            created_at,
        }
    }
}

/// A versioned ciphertext value carried by update events and mismatch acks.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionedValue {
    pub value: Option<String>,
    pub version: i64,
}

/// Kind-specific bodies of update events.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "t", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum UpdateBody {
    NewSession {
        #[serde(flatten)]
        session: Session,
    },
    UpdateSession {
        id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        metadata: Option<VersionedValue>,
        #[serde(skip_serializing_if = "Option::is_none")]
        agent_state: Option<VersionedValue>,
    },
    DeleteSession {
        id: String,
    },
    NewMessage {
        sid: String,
        message: SessionMessage,
    },
    NewMachine {
        #[serde(flatten)]
        machine: Machine,
    },
    UpdateMachine {
        machine_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        metadata: Option<VersionedValue>,
        #[serde(skip_serializing_if = "Option::is_none")]
        daemon_state: Option<VersionedValue>,
    },
}

/// Transient presence signals. No sequence number; delivery is advisory.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum Ephemeral {
    Activity {
        id: String,
        active: bool,
        active_at: i64,
        thinking: bool,
    },
    MachineActivity {
        id: String,
        active: bool,
        active_at: i64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_keys_are_twelve_alphanumeric_chars() {
        let key = update_key();
        assert_eq!(key.len(), 12);
        assert!(key.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(update_key(), update_key());
    }

    #[test]
    fn envelope_serializes_with_kind_tag() {
        let envelope = UpdateEnvelope::new(
            7,
            UpdateBody::DeleteSession {
                id: "s1".to_string(),
            },
            1000,
        );

        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["seq"], 7);
        assert_eq!(json["createdAt"], 1000);
        assert_eq!(json["body"]["t"], "delete-session");
        assert_eq!(json["body"]["id"], "s1");
        assert_eq!(json["id"].as_str().unwrap().len(), 12);
    }

    #[test]
    fn update_session_body_omits_absent_fields() {
        let body = UpdateBody::UpdateSession {
            id: "s1".to_string(),
            metadata: Some(VersionedValue {
                value: Some("cipher".to_string()),
                version: 3,
            }),
            agent_state: None,
        };

        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["t"], "update-session");
        assert_eq!(json["metadata"]["version"], 3);
        assert!(json.get("agentState").is_none());
    }

    #[test]
    fn ephemerals_carry_their_type_inline() {
        let activity = Ephemeral::Activity {
            id: "s1".to_string(),
            active: true,
            active_at: 42,
            thinking: false,
        };

        let json = serde_json::to_value(&activity).unwrap();
        assert_eq!(json["type"], "activity");
        assert_eq!(json["activeAt"], 42);
        assert_eq!(json["thinking"], false);

        let machine = Ephemeral::MachineActivity {
            id: "m1".to_string(),
            active: false,
            active_at: 42,
        };
        let json = serde_json::to_value(&machine).unwrap();
        assert_eq!(json["type"], "machine-activity");
    }
}
