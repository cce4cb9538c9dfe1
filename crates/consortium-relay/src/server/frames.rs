//! WebSocket wire frames.
//!
//! Frames are JSON text messages tagged by `type`. Client frames that
//! expect a reply carry a client-chosen correlation `id`; the server
//! answers each exactly once with an `ack` frame echoing that id. The
//! server's own request (`rpc-request`) is answered by the target with an
//! `rpc-response` frame the same way.

use serde::{Deserialize, Serialize};

/// Frames sent by clients.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientFrame {
    /// Append an encrypted message to a session.
    Message {
        sid: String,
        message: String,
        #[serde(default)]
        local_id: Option<String>,
    },
    /// Session heartbeat.
    SessionAlive {
        sid: String,
        time: i64,
        #[serde(default)]
        thinking: Option<bool>,
    },
    /// Session went idle.
    SessionEnd { sid: String, time: i64 },
    /// Machine heartbeat.
    MachineAlive { machine_id: String, time: i64 },
    /// Version-checked session metadata write.
    UpdateMetadata {
        id: String,
        sid: String,
        metadata: String,
        expected_version: i64,
    },
    /// Version-checked session agent-state write.
    UpdateState {
        id: String,
        sid: String,
        #[serde(default)]
        agent_state: Option<String>,
        expected_version: i64,
    },
    /// Version-checked machine metadata write.
    MachineUpdateMetadata {
        id: String,
        machine_id: String,
        metadata: String,
        expected_version: i64,
    },
    /// Version-checked machine daemon-state write.
    MachineUpdateState {
        id: String,
        machine_id: String,
        #[serde(default)]
        daemon_state: Option<String>,
        expected_version: i64,
    },
    /// Register an RPC method on this socket.
    RpcRegister { method: String },
    /// Remove this socket's registration of a method.
    RpcUnregister { method: String },
    /// Invoke a method registered by another socket of the same account.
    RpcCall {
        id: String,
        method: String,
        params: serde_json::Value,
    },
    /// The target's reply to an `rpc-request`.
    RpcResponse {
        id: String,
        ok: bool,
        #[serde(default)]
        result: Option<serde_json::Value>,
        #[serde(default)]
        error: Option<String>,
    },
    /// Request-reply no-op used to flush in-flight writes.
    Ping { id: String },
}

/// Frames sent by the server (updates and ephemerals are built by the
/// event router and share the same outer `{type, payload}` shape).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerFrame {
    /// Reply to a client request frame, echoing its correlation id.
    Ack {
        id: String,
        payload: serde_json::Value,
    },
    /// Forwarded RPC invocation; the target answers with `rpc-response`.
    RpcRequest {
        id: String,
        method: String,
        params: serde_json::Value,
    },
    RpcRegistered { method: String },
    RpcUnregistered { method: String },
    RpcError { message: String },
    Error { message: String },
}

impl ServerFrame {
    /// Serialize for the outbound channel.
    pub fn to_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"type":"error","message":"Internal error"}"#.to_string()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_frames_parse_from_kebab_case_tags() {
        let frame: ClientFrame = serde_json::from_str(
            r#"{"type":"message","sid":"S1","message":"b64","localId":"L1"}"#,
        )
        .unwrap();
        assert!(matches!(
            frame,
            ClientFrame::Message { ref sid, ref local_id, .. }
                if sid == "S1" && local_id.as_deref() == Some("L1")
        ));

        let frame: ClientFrame = serde_json::from_str(
            r#"{"type":"update-metadata","id":"c1","sid":"S1","metadata":"m","expectedVersion":2}"#,
        )
        .unwrap();
        assert!(matches!(
            frame,
            ClientFrame::UpdateMetadata { expected_version: 2, .. }
        ));
    }

    #[test]
    fn optional_fields_default() {
        let frame: ClientFrame =
            serde_json::from_str(r#"{"type":"session-alive","sid":"S1","time":5}"#).unwrap();
        assert!(matches!(
            frame,
            ClientFrame::SessionAlive { thinking: None, .. }
        ));

        let frame: ClientFrame =
            serde_json::from_str(r#"{"type":"rpc-response","id":"r1","ok":true}"#).unwrap();
        assert!(matches!(
            frame,
            ClientFrame::RpcResponse { result: None, error: None, .. }
        ));
    }

    #[test]
    fn unknown_frame_type_fails_to_parse() {
        assert!(serde_json::from_str::<ClientFrame>(r#"{"type":"nonsense"}"#).is_err());
    }

    #[test]
    fn server_frames_serialize_with_kebab_case_tags() {
        let text = ServerFrame::RpcRequest {
            id: "r1".to_string(),
            method: "S1:bash".to_string(),
            params: serde_json::json!("cipher"),
        }
        .to_text();

        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "rpc-request");
        assert_eq!(value["method"], "S1:bash");

        let text = ServerFrame::Error {
            message: "nope".to_string(),
        }
        .to_text();
        assert!(text.contains(r#""type":"error""#));
    }
}
