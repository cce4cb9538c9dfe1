//! Bearer-token authentication for HTTP handlers.

use axum::http::{header, HeaderMap, StatusCode};

use super::AppState;

/// Resolve the `Authorization: Bearer` header to an account id, or 401.
pub async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<String, StatusCode> {
    let token = bearer_token(headers).ok_or(StatusCode::UNAUTHORIZED)?;

    state
        .tokens
        .verify(token)
        .await
        .map(|identity| identity.account_id)
        .ok_or(StatusCode::UNAUTHORIZED)
}

/// Extract the raw token from an `Authorization: Bearer <token>` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}
