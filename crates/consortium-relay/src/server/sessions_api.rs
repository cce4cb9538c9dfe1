//! Session CRUD endpoints.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::events::{EmitParams, EventName, RecipientFilter, UpdateBody, UpdateEnvelope};
use crate::storage::{unix_timestamp_ms, Session};

use super::extract::authenticate;
use super::AppState;

/// A session as returned over HTTP: all stored fields plus `activeAt`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiSession {
    #[serde(flatten)]
    session: Session,
    active_at: i64,
}

impl From<Session> for ApiSession {
    fn from(session: Session) -> Self {
        let active_at = session.last_active_at;
        Self { session, active_at }
    }
}

/// `GET /v1/sessions`
pub async fn list_sessions(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let account_id = authenticate(&state, &headers).await?;

    let sessions = state.db.list_sessions(&account_id).await.map_err(|e| {
        error!(error = %e, "Session listing failed");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    let sessions: Vec<ApiSession> = sessions.into_iter().map(ApiSession::from).collect();
    Ok(Json(serde_json::json!({ "sessions": sessions })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub tag: String,
    pub metadata: String,
    #[serde(default)]
    pub agent_state: Option<String>,
    #[serde(default)]
    pub data_encryption_key: Option<String>,
}

/// `POST /v1/sessions`
///
/// Idempotent on `(account, tag)`: re-posting an existing tag returns the
/// stored session unchanged and emits nothing.
pub async fn create_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreateSessionRequest>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let account_id = authenticate(&state, &headers).await?;

    let (session, created_seq) = state
        .db
        .create_session(
            &account_id,
            &request.tag,
            &request.metadata,
            request.agent_state.as_deref(),
            request.data_encryption_key.as_deref(),
        )
        .await
        .map_err(|e| {
            error!(error = %e, "Session creation failed");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    if let Some(seq) = created_seq {
        info!(account_id = %account_id, session_id = %session.id, "Session created");

        let envelope = UpdateEnvelope::new(
            seq,
            UpdateBody::NewSession {
                session: session.clone(),
            },
            unix_timestamp_ms(),
        );
        state
            .router
            .emit(EmitParams {
                account_id: account_id.clone(),
                event: EventName::Update,
                payload: serde_json::to_value(&envelope).unwrap_or_default(),
                filter: RecipientFilter::UserScopedOnly,
                skip_connection: None,
            })
            .await;
    }

    Ok(Json(
        serde_json::json!({ "session": ApiSession::from(session) }),
    ))
}

/// `GET /v1/sessions/:id/messages`
pub async fn list_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let account_id = authenticate(&state, &headers).await?;

    let session = state.db.get_session(&session_id).await.map_err(|e| {
        error!(error = %e, "Session lookup failed");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    // Foreign sessions look identical to missing ones.
    match session {
        Some(session) if session.account_id == account_id => {}
        _ => return Err(StatusCode::NOT_FOUND),
    }

    let messages = state.db.list_messages(&session_id).await.map_err(|e| {
        error!(error = %e, "Message listing failed");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    Ok(Json(serde_json::json!({ "messages": messages })))
}

/// `DELETE /v1/sessions/:id`
///
/// Removes the session and its messages in one transaction, then emits a
/// `delete-session` update to the account's dashboards.
pub async fn delete_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let account_id = authenticate(&state, &headers).await?;

    let deleted = state
        .db
        .delete_session(&account_id, &session_id)
        .await
        .map_err(|e| {
            error!(error = %e, "Session deletion failed");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    if !deleted {
        return Err(StatusCode::NOT_FOUND);
    }

    info!(account_id = %account_id, session_id = %session_id, "Session deleted");

    match state.db.allocate_account_seq(&account_id).await {
        Ok(seq) => {
            let envelope = UpdateEnvelope::new(
                seq,
                UpdateBody::DeleteSession {
                    id: session_id.clone(),
                },
                unix_timestamp_ms(),
            );
            state
                .router
                .emit(EmitParams {
                    account_id: account_id.clone(),
                    event: EventName::Update,
                    payload: serde_json::to_value(&envelope).unwrap_or_default(),
                    filter: RecipientFilter::UserScopedOnly,
                    skip_connection: None,
                })
                .await;
        }
        Err(e) => error!(error = %e, "Seq allocation failed after delete"),
    }

    Ok(Json(serde_json::json!({ "success": true })))
}
