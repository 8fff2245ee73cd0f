//! WebSocket handler — one socket, one session relay.
//!
//! DESIGN
//! ======
//! On upgrade the session uid is registered, then the socket is split:
//! - Reader half: decode client text frames → session relay inbound channel
//! - Writer half: shared broadcast feed → client
//!
//! The reader never persists or broadcasts by itself; the relay owns both.
//! Decode and transport failures are forwarded to the relay as stream errors
//! so every terminal path goes through the same cleanup.
//!
//! LIFECYCLE
//! =========
//! 1. Upgrade → register uid (409 if taken) → subscribe to broadcast
//! 2. Publish `USER_JOINED` notice
//! 3. Client frames → relay (count, persist, broadcast)
//! 4. Close/error → relay terminal transition → writer sends Close and stops
//! 5. Relay fails on its own (history write) → socket is closed the same way

use std::sync::Arc;

use axum::Json;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::oneshot;
use tokio::time::{Duration, timeout};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::message::{ChatMessage, ChatMessageType, ChatUser, ErrorCode, now_ms};
use crate::services::relay::{RelayError, SessionRelay};
use crate::state::AppState;

const WRITER_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

// =============================================================================
// WIRE TYPES
// =============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct ConnectQuery {
    pub uid: Option<String>,
}

/// Client-authored message. The sender is never taken from the client.
#[derive(Debug, Deserialize)]
struct ClientMessage {
    id: Option<String>,
    #[serde(rename = "type", default)]
    message_type: ChatMessageType,
    text: String,
    timestamp: Option<i64>,
}

/// Decode one inbound text frame and stamp it with the session's sender.
pub(crate) fn decode_client_message(text: &str, uid: &str) -> Result<ChatMessage, RelayError> {
    let raw: ClientMessage = serde_json::from_str(text)?;
    Ok(ChatMessage {
        id: raw
            .id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string()),
        message_type: raw.message_type,
        text: raw.text,
        timestamp: raw.timestamp.unwrap_or_else(now_ms),
        sender: ChatUser::new(uid),
    })
}

fn resolve_uid(requested: Option<String>) -> String {
    requested
        .map(|uid| uid.trim().to_owned())
        .filter(|uid| !uid.is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

// =============================================================================
// UPGRADE
// =============================================================================

pub async fn handle_ws(
    State(state): State<AppState>,
    Query(params): Query<ConnectQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let uid = resolve_uid(params.uid);
    let user = Arc::new(ChatUser::new(uid.clone()));

    if let Err(e) = state.registry.register(user.clone()).await {
        warn!(%uid, error = %e, "ws: session rejected");
        let body = serde_json::json!({ "code": e.error_code(), "message": e.to_string() });
        return (StatusCode::CONFLICT, Json(body)).into_response();
    }

    let registry = state.registry.clone();
    ws.on_failed_upgrade(move |e| {
        warn!(%uid, error = %e, "ws: upgrade failed; releasing session");
        tokio::spawn(async move {
            registry.remove(&uid).await;
        });
    })
    .on_upgrade(move |socket| run_ws(socket, state, user))
}

// =============================================================================
// CONNECTION
// =============================================================================

async fn run_ws(socket: WebSocket, state: AppState, user: Arc<ChatUser>) {
    let relay = SessionRelay::for_session(&state, user);
    let uid = relay.user().uid.clone();
    let (mut sink, mut stream) = socket.split();

    // Subscribe before anything is published so the client sees its own join.
    let mut feed = state.broadcast.subscribe();
    let (close_tx, mut close_rx) = oneshot::channel::<()>();
    let writer_uid = uid.clone();
    let mut writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut close_rx => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
                recv = feed.recv() => match recv {
                    Ok(msg) => {
                        let Ok(json) = serde_json::to_string(&msg) else {
                            continue;
                        };
                        if sink.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(uid = %writer_uid, skipped, "ws: subscriber lagged; messages skipped");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
    });

    info!(%uid, "ws: client connected");
    state
        .broadcast
        .publish(ChatMessage::arrival(&uid, &state.config.join_template));

    let (inbound, mut relay_task) = relay.spawn();

    // The relay can end on its own (failed history write), so watch it
    // alongside the socket.
    let finished = loop {
        tokio::select! {
            outcome = &mut relay_task => break Some(outcome),
            frame = stream.next() => {
                let item = match frame {
                    Some(Ok(Message::Text(text))) => decode_client_message(text.as_str(), &uid),
                    Some(Ok(Message::Close(_))) | None => break None,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => Err(RelayError::Transport(e.to_string())),
                };
                let terminal = item.is_err();
                // Send fails once the relay has reached a terminal state.
                if inbound.send(item).await.is_err() || terminal {
                    break None;
                }
            }
        }
    };
    drop(inbound);

    let outcome = match finished {
        Some(outcome) => {
            debug!(%uid, "ws: relay ended first; closing socket");
            outcome
        }
        None => relay_task.await,
    };
    match outcome {
        Ok(outcome) => info!(
            uid = %outcome.uid,
            state = ?outcome.state,
            messages = outcome.messages,
            departure_sent = outcome.departure_sent,
            deregistered = outcome.deregistered,
            "ws: client disconnected"
        ),
        Err(e) => error!(%uid, error = %e, "ws: relay task aborted"),
    }

    let _ = close_tx.send(());
    if timeout(WRITER_CLOSE_TIMEOUT, &mut writer).await.is_err() {
        warn!(%uid, "ws: writer did not close in time; aborting");
        writer.abort();
    }
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;
