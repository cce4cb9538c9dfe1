//! Authentication and pairing endpoints.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Deserialize;
use tracing::{error, info, warn};

use crate::auth::verify_challenge;

use super::extract::authenticate;
use super::AppState;

/// Ephemeral pairing keys must be raw 32-byte public keys.
const PAIRING_KEY_LEN: usize = 32;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthRequest {
    pub public_key: String,
    pub challenge: String,
    pub signature: String,
}

/// `POST /v1/auth`: challenge-signature login.
///
/// Verifies the Ed25519 signature and finds or creates the account keyed
/// by the hex-encoded public key.
pub async fn auth(
    State(state): State<AppState>,
    Json(request): Json<AuthRequest>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let public_key = BASE64
        .decode(&request.public_key)
        .map_err(|_| StatusCode::BAD_REQUEST)?;
    let challenge = BASE64
        .decode(&request.challenge)
        .map_err(|_| StatusCode::BAD_REQUEST)?;
    let signature = BASE64
        .decode(&request.signature)
        .map_err(|_| StatusCode::BAD_REQUEST)?;

    if verify_challenge(&public_key, &challenge, &signature).is_err() {
        warn!("Rejected login with invalid challenge signature");
        return Err(StatusCode::UNAUTHORIZED);
    }

    let account = state
        .db
        .upsert_account(&hex::encode(&public_key))
        .await
        .map_err(|e| {
            error!(error = %e, "Account upsert failed");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    let token = state
        .tokens
        .create(&account.id, None)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    info!(account_id = %account.id, "Account authenticated");

    Ok(Json(serde_json::json!({
        "success": true,
        "token": token,
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingPollRequest {
    pub public_key: String,
}

/// `POST /v1/auth/account/request`: unauthenticated pairing poll.
///
/// Upserts the pairing request for the ephemeral key and reports whether
/// an authenticated client has approved it yet. On approval the reply
/// carries a fresh token for the approving account plus the wrapped
/// response blob; the relay cannot read either.
pub async fn pairing_request(
    State(state): State<AppState>,
    Json(request): Json<PairingPollRequest>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let public_key = BASE64
        .decode(&request.public_key)
        .map_err(|_| StatusCode::BAD_REQUEST)?;
    if public_key.len() != PAIRING_KEY_LEN {
        return Err(StatusCode::BAD_REQUEST);
    }

    let pairing = state
        .db
        .upsert_pairing_request(&hex::encode(&public_key))
        .await
        .map_err(|e| {
            error!(error = %e, "Pairing request upsert failed");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    if let (Some(response), Some(account_id)) =
        (&pairing.response, &pairing.response_account_id)
    {
        let token = state
            .tokens
            .create(account_id, None)
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

        return Ok(Json(serde_json::json!({
            "state": "authorized",
            "token": token,
            "response": response,
        })));
    }

    Ok(Json(serde_json::json!({ "state": "requested" })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingResponseRequest {
    pub public_key: String,
    pub response: String,
}

/// `POST /v1/auth/account/response`: approve a pairing request.
///
/// Writes the wrapped response exactly once; later calls are silent
/// no-ops.
pub async fn pairing_response(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<PairingResponseRequest>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let account_id = authenticate(&state, &headers).await?;

    let public_key = BASE64
        .decode(&request.public_key)
        .map_err(|_| StatusCode::BAD_REQUEST)?;

    state
        .db
        .respond_to_pairing_request(&hex::encode(&public_key), &request.response, &account_id)
        .await
        .map_err(|e| {
            error!(error = %e, "Pairing response write failed");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    info!(account_id = %account_id, "Pairing request answered");

    Ok(Json(serde_json::json!({ "success": true })))
}
