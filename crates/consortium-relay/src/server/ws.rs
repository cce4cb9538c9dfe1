//! WebSocket endpoint for the real-time protocol.
//!
//! One reader and one writer task per socket: frames on a connection are
//! processed in arrival order, connections run in parallel. Every handler
//! contains its own failures; a bad frame never tears the connection down.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::time::timeout;
use tracing::{debug, error, info};

use crate::events::{
    ClientConnection, ConnectionScope, EmitParams, Ephemeral, EventName, RecipientFilter,
    UpdateBody, UpdateEnvelope, VersionedValue,
};
use crate::rpc::RPC_CALL_TIMEOUT;
use crate::storage::{unix_timestamp_ms, DatabaseError, VersionedWrite};

use super::extract::bearer_token;
use super::frames::{ClientFrame, ServerFrame};
use super::AppState;

/// Heartbeats older than this are ignored outright.
const HEARTBEAT_MAX_AGE_MS: i64 = 10 * 60 * 1000;

/// Handshake parameters, read from the query string (browsers cannot set
/// headers on WebSocket connects); `Authorization: Bearer` wins if present.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeParams {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub client_type: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub machine_id: Option<String>,
}

/// Axum handler for `GET /v1/updates`.
pub async fn updates_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<HandshakeParams>,
) -> Response {
    let token = bearer_token(&headers)
        .map(str::to_string)
        .or_else(|| params.token.clone());

    ws.on_upgrade(move |socket| handle_socket(socket, state, params, token))
}

async fn handle_socket(
    mut socket: WebSocket,
    state: AppState,
    params: HandshakeParams,
    token: Option<String>,
) {
    let (account_id, scope) = match authorize(&state, &params, token.as_deref()).await {
        Ok(identity) => identity,
        Err(message) => {
            let _ = socket
                .send(Message::Text(ServerFrame::Error { message }.to_text()))
                .await;
            return;
        }
    };

    let (conn, mut outbound_rx) = ClientConnection::new(account_id.clone(), scope.clone());
    state.router.add(Arc::clone(&conn)).await;

    if let ConnectionScope::Machine { machine_id } = &scope {
        broadcast_machine_activity(&state, &account_id, machine_id, true).await;
    }

    let (mut sink, mut stream) = socket.split();

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            if sink.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = stream.next().await {
        match message {
            Message::Text(text) => handle_frame(&state, &conn, &text).await,
            Message::Close(_) => break,
            _ => {}
        }
    }

    writer.abort();
    conn.cancel_all_pending().await;
    state.router.remove(&account_id, conn.id).await;
    state.rpc.remove_connection(&account_id, conn.id).await;

    if let ConnectionScope::Machine { machine_id } = &scope {
        broadcast_machine_activity(&state, &account_id, machine_id, false).await;
    }

    info!(account_id = %account_id, connection_id = conn.id, "Socket closed");
}

/// Validate the handshake: token first, then scope-specific ownership.
async fn authorize(
    state: &AppState,
    params: &HandshakeParams,
    token: Option<&str>,
) -> Result<(String, ConnectionScope), String> {
    let token = token.ok_or_else(|| "Missing auth token".to_string())?;
    let identity = state
        .tokens
        .verify(token)
        .await
        .ok_or_else(|| "Invalid auth token".to_string())?;
    let account_id = identity.account_id;

    match params.client_type.as_deref().unwrap_or("user-scoped") {
        "user-scoped" => Ok((account_id, ConnectionScope::User)),
        "session-scoped" => {
            let session_id = params
                .session_id
                .clone()
                .ok_or_else(|| "sessionId required for session-scoped connections".to_string())?;
            let owned = state
                .db
                .get_session(&session_id)
                .await
                .map_err(|_| "Internal error".to_string())?
                .is_some_and(|s| s.account_id == account_id);
            if !owned {
                return Err("Session not found".to_string());
            }
            Ok((account_id, ConnectionScope::Session { session_id }))
        }
        "machine-scoped" => {
            let machine_id = params
                .machine_id
                .clone()
                .ok_or_else(|| "machineId required for machine-scoped connections".to_string())?;
            let known = state
                .db
                .get_machine(&account_id, &machine_id)
                .await
                .map_err(|_| "Internal error".to_string())?
                .is_some();
            if !known {
                return Err("Machine not found".to_string());
            }
            Ok((account_id, ConnectionScope::Machine { machine_id }))
        }
        other => Err(format!("Unknown client type: {other}")),
    }
}

/// Persist and broadcast a machine's presence flip.
async fn broadcast_machine_activity(
    state: &AppState,
    account_id: &str,
    machine_id: &str,
    active: bool,
) {
    let now = unix_timestamp_ms();
    if let Err(e) = state
        .db
        .set_machine_activity(account_id, machine_id, active, now)
        .await
    {
        error!(error = %e, machine_id = %machine_id, "Machine activity write failed");
    }

    emit_ephemeral(
        state,
        account_id,
        Ephemeral::MachineActivity {
            id: machine_id.to_string(),
            active,
            active_at: now,
        },
    )
    .await;
}

async fn emit_ephemeral(state: &AppState, account_id: &str, ephemeral: Ephemeral) {
    state
        .router
        .emit(EmitParams {
            account_id: account_id.to_string(),
            event: EventName::Ephemeral,
            payload: serde_json::to_value(&ephemeral).unwrap_or_default(),
            filter: RecipientFilter::UserScopedOnly,
            skip_connection: None,
        })
        .await;
}

async fn emit_update(
    state: &AppState,
    account_id: &str,
    seq: i64,
    body: UpdateBody,
    filter: RecipientFilter,
    skip_connection: Option<u64>,
) {
    let envelope = UpdateEnvelope::new(seq, body, unix_timestamp_ms());
    state
        .router
        .emit(EmitParams {
            account_id: account_id.to_string(),
            event: EventName::Update,
            payload: serde_json::to_value(&envelope).unwrap_or_default(),
            filter,
            skip_connection,
        })
        .await;
}

/// Reply to a request frame. Each request is acked exactly once.
fn ack(conn: &ClientConnection, id: &str, payload: serde_json::Value) {
    conn.send(
        ServerFrame::Ack {
            id: id.to_string(),
            payload,
        }
        .to_text(),
    );
}

/// Validate a heartbeat time: future times clamp to now, stale times are
/// dropped entirely.
fn clamp_heartbeat(time: i64) -> Option<i64> {
    let now = unix_timestamp_ms();
    if time > now {
        Some(now)
    } else if time < now - HEARTBEAT_MAX_AGE_MS {
        None
    } else {
        Some(time)
    }
}

async fn handle_frame(state: &AppState, conn: &Arc<ClientConnection>, text: &str) {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(text) else {
        debug!(connection_id = conn.id, "Dropped unparseable frame");
        return;
    };

    let frame: ClientFrame = match serde_json::from_value(value.clone()) {
        Ok(frame) => frame,
        Err(_) => {
            malformed_frame(conn, &value);
            return;
        }
    };

    match frame {
        ClientFrame::Message {
            sid,
            message,
            local_id,
        } => {
            if let Err(e) = handle_message(state, conn, &sid, &message, local_id.as_deref()).await
            {
                error!(error = %e, sid = %sid, "Message handling failed");
            }
        }

        ClientFrame::SessionAlive { sid, time, thinking } => {
            if let Err(e) =
                handle_session_activity(state, conn, &sid, time, true, thinking.unwrap_or(false))
                    .await
            {
                error!(error = %e, sid = %sid, "Session heartbeat failed");
            }
        }

        ClientFrame::SessionEnd { sid, time } => {
            if let Err(e) = handle_session_activity(state, conn, &sid, time, false, false).await {
                error!(error = %e, sid = %sid, "Session end failed");
            }
        }

        ClientFrame::MachineAlive { machine_id, time } => {
            if let Err(e) = handle_machine_alive(state, conn, &machine_id, time).await {
                error!(error = %e, machine_id = %machine_id, "Machine heartbeat failed");
            }
        }

        ClientFrame::UpdateMetadata {
            id,
            sid,
            metadata,
            expected_version,
        } => {
            let payload =
                update_session_metadata(state, conn, &sid, &metadata, expected_version).await;
            ack(conn, &id, payload);
        }

        ClientFrame::UpdateState {
            id,
            sid,
            agent_state,
            expected_version,
        } => {
            let payload =
                update_session_state(state, conn, &sid, agent_state.as_deref(), expected_version)
                    .await;
            ack(conn, &id, payload);
        }

        ClientFrame::MachineUpdateMetadata {
            id,
            machine_id,
            metadata,
            expected_version,
        } => {
            let payload =
                update_machine_metadata(state, conn, &machine_id, &metadata, expected_version)
                    .await;
            ack(conn, &id, payload);
        }

        ClientFrame::MachineUpdateState {
            id,
            machine_id,
            daemon_state,
            expected_version,
        } => {
            let payload = update_machine_state(
                state,
                conn,
                &machine_id,
                daemon_state.as_deref(),
                expected_version,
            )
            .await;
            ack(conn, &id, payload);
        }

        ClientFrame::RpcRegister { method } => {
            state.rpc.register(&method, Arc::clone(conn)).await;
            conn.send(ServerFrame::RpcRegistered { method }.to_text());
        }

        ClientFrame::RpcUnregister { method } => {
            state.rpc.unregister(&conn.account_id, &method, conn.id).await;
            conn.send(ServerFrame::RpcUnregistered { method }.to_text());
        }

        ClientFrame::RpcCall { id, method, params } => {
            rpc_call(state, conn, id, method, params).await;
        }

        ClientFrame::RpcResponse {
            id,
            ok,
            result,
            error,
        } => {
            let outcome = if ok {
                Ok(result.unwrap_or(serde_json::Value::Null))
            } else {
                Err(error.unwrap_or_else(|| "RPC call failed".to_string()))
            };
            conn.complete_pending(&id, outcome).await;
        }

        ClientFrame::Ping { id } => {
            ack(conn, &id, serde_json::json!({}));
        }
    }
}

/// A frame we could not type-check. Malformed RPC traffic gets an
/// `rpc-error` event regardless of any correlation id; other
/// callback-style frames still get their single error ack so client
/// callbacks never hang.
fn malformed_frame(conn: &ClientConnection, value: &serde_json::Value) {
    if value
        .get("type")
        .and_then(serde_json::Value::as_str)
        .is_some_and(|t| t.starts_with("rpc-"))
    {
        conn.send(
            ServerFrame::RpcError {
                message: "Malformed RPC frame".to_string(),
            }
            .to_text(),
        );
    } else if let Some(id) = value.get("id").and_then(serde_json::Value::as_str) {
        ack(conn, id, serde_json::json!({"result": "error"}));
    } else {
        debug!(connection_id = conn.id, "Dropped malformed frame");
    }
}

async fn handle_message(
    state: &AppState,
    conn: &Arc<ClientConnection>,
    sid: &str,
    message: &str,
    local_id: Option<&str>,
) -> Result<(), DatabaseError> {
    let owned = state
        .db
        .get_session(sid)
        .await?
        .is_some_and(|s| s.account_id == conn.account_id);
    if !owned {
        return Ok(());
    }

    let content = serde_json::json!({"t": "encrypted", "c": message}).to_string();

    // None means a duplicate localId re-send: drop silently.
    let Some((stored, seq)) = state
        .db
        .insert_message(&conn.account_id, sid, &content, local_id)
        .await?
    else {
        return Ok(());
    };

    emit_update(
        state,
        &conn.account_id,
        seq,
        UpdateBody::NewMessage {
            sid: sid.to_string(),
            message: stored,
        },
        RecipientFilter::SessionInterested(sid.to_string()),
        Some(conn.id),
    )
    .await;

    Ok(())
}

async fn handle_session_activity(
    state: &AppState,
    conn: &Arc<ClientConnection>,
    sid: &str,
    time: i64,
    active: bool,
    thinking: bool,
) -> Result<(), DatabaseError> {
    let Some(time) = clamp_heartbeat(time) else {
        return Ok(());
    };

    let owned = state
        .db
        .get_session(sid)
        .await?
        .is_some_and(|s| s.account_id == conn.account_id);
    if !owned {
        return Ok(());
    }

    state.db.set_session_activity(sid, active, time).await?;

    emit_ephemeral(
        state,
        &conn.account_id,
        Ephemeral::Activity {
            id: sid.to_string(),
            active,
            active_at: time,
            thinking,
        },
    )
    .await;

    Ok(())
}

async fn handle_machine_alive(
    state: &AppState,
    conn: &Arc<ClientConnection>,
    machine_id: &str,
    time: i64,
) -> Result<(), DatabaseError> {
    let Some(time) = clamp_heartbeat(time) else {
        return Ok(());
    };

    if state
        .db
        .get_machine(&conn.account_id, machine_id)
        .await?
        .is_none()
    {
        return Ok(());
    }

    state
        .db
        .set_machine_activity(&conn.account_id, machine_id, true, time)
        .await?;

    emit_ephemeral(
        state,
        &conn.account_id,
        Ephemeral::MachineActivity {
            id: machine_id.to_string(),
            active: true,
            active_at: time,
        },
    )
    .await;

    Ok(())
}

async fn update_session_metadata(
    state: &AppState,
    conn: &Arc<ClientConnection>,
    sid: &str,
    metadata: &str,
    expected_version: i64,
) -> serde_json::Value {
    match state
        .db
        .update_session_metadata(&conn.account_id, sid, metadata, expected_version)
        .await
    {
        Ok(Some(VersionedWrite::Applied((session, seq)))) => {
            let version = session.metadata_version;
            emit_update(
                state,
                &conn.account_id,
                seq,
                UpdateBody::UpdateSession {
                    id: sid.to_string(),
                    metadata: Some(VersionedValue {
                        value: Some(session.metadata.clone()),
                        version,
                    }),
                    agent_state: None,
                },
                RecipientFilter::SessionInterested(sid.to_string()),
                None,
            )
            .await;

            serde_json::json!({
                "result": "success",
                "version": version,
                "metadata": session.metadata,
            })
        }
        Ok(Some(VersionedWrite::Conflict { version, value })) => serde_json::json!({
            "result": "version-mismatch",
            "version": version,
            "metadata": value,
        }),
        Ok(None) => serde_json::json!({"result": "error"}),
        Err(e) => {
            error!(error = %e, sid = %sid, "Metadata update failed");
            serde_json::json!({"result": "error"})
        }
    }
}

async fn update_session_state(
    state: &AppState,
    conn: &Arc<ClientConnection>,
    sid: &str,
    agent_state: Option<&str>,
    expected_version: i64,
) -> serde_json::Value {
    match state
        .db
        .update_session_agent_state(&conn.account_id, sid, agent_state, expected_version)
        .await
    {
        Ok(Some(VersionedWrite::Applied((session, seq)))) => {
            let version = session.agent_state_version;
            emit_update(
                state,
                &conn.account_id,
                seq,
                UpdateBody::UpdateSession {
                    id: sid.to_string(),
                    metadata: None,
                    agent_state: Some(VersionedValue {
                        value: session.agent_state.clone(),
                        version,
                    }),
                },
                RecipientFilter::SessionInterested(sid.to_string()),
                None,
            )
            .await;

            serde_json::json!({
                "result": "success",
                "version": version,
                "agentState": session.agent_state,
            })
        }
        Ok(Some(VersionedWrite::Conflict { version, value })) => serde_json::json!({
            "result": "version-mismatch",
            "version": version,
            "agentState": value,
        }),
        Ok(None) => serde_json::json!({"result": "error"}),
        Err(e) => {
            error!(error = %e, sid = %sid, "Agent state update failed");
            serde_json::json!({"result": "error"})
        }
    }
}

async fn update_machine_metadata(
    state: &AppState,
    conn: &Arc<ClientConnection>,
    machine_id: &str,
    metadata: &str,
    expected_version: i64,
) -> serde_json::Value {
    match state
        .db
        .update_machine_metadata(&conn.account_id, machine_id, metadata, expected_version)
        .await
    {
        Ok(Some(VersionedWrite::Applied((machine, seq)))) => {
            let version = machine.metadata_version;
            emit_update(
                state,
                &conn.account_id,
                seq,
                UpdateBody::UpdateMachine {
                    machine_id: machine_id.to_string(),
                    metadata: Some(VersionedValue {
                        value: Some(machine.metadata.clone()),
                        version,
                    }),
                    daemon_state: None,
                },
                RecipientFilter::MachineScoped(machine_id.to_string()),
                None,
            )
            .await;

            serde_json::json!({
                "result": "success",
                "version": version,
                "metadata": machine.metadata,
            })
        }
        Ok(Some(VersionedWrite::Conflict { version, value })) => serde_json::json!({
            "result": "version-mismatch",
            "version": version,
            "metadata": value,
        }),
        Ok(None) => serde_json::json!({"result": "error"}),
        Err(e) => {
            error!(error = %e, machine_id = %machine_id, "Machine metadata update failed");
            serde_json::json!({"result": "error"})
        }
    }
}

async fn update_machine_state(
    state: &AppState,
    conn: &Arc<ClientConnection>,
    machine_id: &str,
    daemon_state: Option<&str>,
    expected_version: i64,
) -> serde_json::Value {
    match state
        .db
        .update_machine_daemon_state(&conn.account_id, machine_id, daemon_state, expected_version)
        .await
    {
        Ok(Some(VersionedWrite::Applied((machine, seq)))) => {
            let version = machine.daemon_state_version;
            emit_update(
                state,
                &conn.account_id,
                seq,
                UpdateBody::UpdateMachine {
                    machine_id: machine_id.to_string(),
                    metadata: None,
                    daemon_state: Some(VersionedValue {
                        value: machine.daemon_state.clone(),
                        version,
                    }),
                },
                RecipientFilter::MachineScoped(machine_id.to_string()),
                None,
            )
            .await;

            serde_json::json!({
                "result": "success",
                "version": version,
                "daemonState": machine.daemon_state,
            })
        }
        Ok(Some(VersionedWrite::Conflict { version, value })) => serde_json::json!({
            "result": "version-mismatch",
            "version": version,
            "daemonState": value,
        }),
        Ok(None) => serde_json::json!({"result": "error"}),
        Err(e) => {
            error!(error = %e, machine_id = %machine_id, "Daemon state update failed");
            serde_json::json!({"result": "error"})
        }
    }
}

/// Forward an RPC call to the registered socket and ack the caller once
/// the target answers, errors, or the 30-second timeout fires.
async fn rpc_call(
    state: &AppState,
    conn: &Arc<ClientConnection>,
    call_id: String,
    method: String,
    params: serde_json::Value,
) {
    let Some(target) = state.rpc.lookup(&conn.account_id, &method).await else {
        ack(
            conn,
            &call_id,
            serde_json::json!({"ok": false, "error": "RPC method not available"}),
        );
        return;
    };

    if target.id == conn.id {
        ack(
            conn,
            &call_id,
            serde_json::json!({"ok": false, "error": "Cannot call RPC on the same socket"}),
        );
        return;
    }

    let request_id = uuid::Uuid::new_v4().to_string();
    let ack_rx = target.register_pending(request_id.clone()).await;

    let sent = target.send(
        ServerFrame::RpcRequest {
            id: request_id.clone(),
            method,
            params,
        }
        .to_text(),
    );
    if !sent {
        target
            .complete_pending(&request_id, Err("RPC method not available".to_string()))
            .await;
        ack(
            conn,
            &call_id,
            serde_json::json!({"ok": false, "error": "RPC method not available"}),
        );
        return;
    }

    // Await the ack off the reader loop so a slow target cannot stall the
    // caller's other frames.
    let caller = Arc::clone(conn);
    tokio::spawn(async move {
        let payload = match timeout(RPC_CALL_TIMEOUT, ack_rx).await {
            Ok(Ok(Ok(result))) => serde_json::json!({"ok": true, "result": result}),
            Ok(Ok(Err(message))) => serde_json::json!({"ok": false, "error": message}),
            Ok(Err(_)) => serde_json::json!({"ok": false, "error": "RPC call failed"}),
            Err(_) => {
                // Drop the stale pending entry so late acks are ignored.
                target
                    .complete_pending(&request_id, Err("RPC call failed".to_string()))
                    .await;
                serde_json::json!({"ok": false, "error": "RPC call failed"})
            }
        };
        ack(&caller, &call_id, payload);
    });
}
