//! Router assembly.
//!
//! SYSTEM CONTEXT
//! ==============
//! This module binds the chat websocket endpoint and the read-only history
//! views under a single Axum router.

pub mod history;
pub mod ws;

use axum::extract::State;
use axum::http::StatusCode;
use axum::{Json, Router};
use axum::routing::get;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Build the full application router.
pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/ws", get(ws::handle_ws))
        .route("/api/sessions", get(history::list_sessions))
        .route("/api/messages", get(history::recent_messages))
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn healthz(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    let body = serde_json::json!({
        "ok": true,
        "sessions": state.registry.len().await,
        "subscribers": state.broadcast.subscriber_count(),
    });
    (StatusCode::OK, Json(body))
}
