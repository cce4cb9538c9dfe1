//! HTTP and WebSocket protocol layer for the Consortium relay.

pub mod auth_api;
pub mod extract;
pub mod frames;
pub mod machines_api;
pub mod sessions_api;
pub mod ws;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::auth::TokenService;
use crate::events::EventRouter;
use crate::rpc::RpcRegistry;
use crate::storage::RelayDatabase;

/// Maximum accepted request body, in bytes.
const BODY_LIMIT: usize = 10 * 1024 * 1024;

/// Shared application state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub db: RelayDatabase,
    pub tokens: Arc<TokenService>,
    pub router: EventRouter,
    pub rpc: RpcRegistry,
}

impl AppState {
    pub fn new(db: RelayDatabase, tokens: TokenService) -> Self {
        Self {
            db,
            tokens: Arc::new(tokens),
            router: EventRouter::new(),
            rpc: RpcRegistry::new(),
        }
    }
}

/// Build the relay's full HTTP/WebSocket router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/auth", post(auth_api::auth))
        .route("/v1/auth/account/request", post(auth_api::pairing_request))
        .route(
            "/v1/auth/account/response",
            post(auth_api::pairing_response),
        )
        .route(
            "/v1/sessions",
            get(sessions_api::list_sessions).post(sessions_api::create_session),
        )
        .route(
            "/v1/sessions/:id/messages",
            get(sessions_api::list_messages),
        )
        .route("/v1/sessions/:id", delete(sessions_api::delete_session))
        .route(
            "/v1/machines",
            get(machines_api::list_machines).post(machines_api::create_machine),
        )
        .route("/v1/machines/:id", get(machines_api::get_machine))
        .route("/v1/updates", get(ws::updates_handler))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(
                    CorsLayer::new()
                        .allow_methods(Any)
                        .allow_headers(Any)
                        .allow_origin(Any),
                )
                .layer(DefaultBodyLimit::max(BODY_LIMIT)),
        )
}

/// `GET /health`
async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
