//! Read-only REST views over relay state.
//!
//! DESIGN
//! ======
//! `/api/sessions` lists the session registry with live message counts.
//! `/api/messages` returns recent chat history, newest first. Neither
//! endpoint mutates anything; all writes go through the websocket relay.

use axum::Json;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use serde::Deserialize;
use tracing::error;

use crate::message::{ChatMessageHist, ErrorCode};
use crate::services::persistence::StoreError;
use crate::services::registry::SessionSummary;
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<i64>,
}

pub(crate) fn store_error_to_status(err: &StoreError) -> StatusCode {
    if err.retryable() { StatusCode::SERVICE_UNAVAILABLE } else { StatusCode::INTERNAL_SERVER_ERROR }
}

/// `GET /api/sessions`
pub async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionSummary>> {
    Json(state.registry.snapshot().await)
}

/// `GET /api/messages?limit=n`
pub async fn recent_messages(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<ChatMessageHist>>, StatusCode> {
    let limit = state.config.history_limit(query.limit);
    match state.store.recent(limit).await {
        Ok(rows) => Ok(Json(rows)),
        Err(e) => {
            error!(error = %e, code = e.error_code(), limit, "history: recent query failed");
            Err(store_error_to_status(&e))
        }
    }
}

#[cfg(test)]
#[path = "history_test.rs"]
mod tests;
