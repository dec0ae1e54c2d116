//! HTTP facade.
//!
//! Thin plumbing over the registry's operations: every endpoint maps
//! 1-to-1 to a session operation. Authentication is a single shared API
//! key; `/health`, `/swagger*` and the chatwoot ingestion path are open.

mod auth;
mod handlers;

pub use auth::RequestId;

use crate::session::SessionRegistry;
use axum::routing::{delete, get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

/// Shared state for all handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub api_key: Option<String>,
}

/// Build the full router.
pub fn router(registry: Arc<SessionRegistry>, api_key: Option<String>) -> Router {
    let state = AppState { registry, api_key };

    Router::new()
        .route("/health", get(handlers::health))
        .route("/sessions/create", post(handlers::create_session))
        .route("/sessions/list", get(handlers::list_sessions))
        .route("/sessions/{name}/info", get(handlers::session_info))
        .route("/sessions/{name}/delete", delete(handlers::delete_session))
        .route("/sessions/{name}/connect", post(handlers::connect_session))
        .route("/sessions/{name}/disconnect", post(handlers::disconnect_session))
        .route("/sessions/{name}/logout", post(handlers::logout_session))
        .route("/sessions/{name}/qr", get(handlers::session_qr))
        .route("/sessions/{name}/proxy/set", post(handlers::set_proxy))
        .route("/sessions/{name}/proxy/find", get(handlers::find_proxy))
        .route(
            "/sessions/{name}/messages/send/text",
            post(handlers::send_text),
        )
        .route(
            "/sessions/{name}/messages/send/media",
            post(handlers::send_media),
        )
        .route(
            "/sessions/{name}/messages/send/location",
            post(handlers::send_location),
        )
        .route(
            "/sessions/{name}/messages/send/contact",
            post(handlers::send_contact),
        )
        .route(
            "/chatwoot/webhook/{name}",
            post(handlers::chatwoot_webhook),
        )
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            auth::require_api_key,
        ))
        .layer(axum::middleware::from_fn(auth::request_id))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
