//! Message — the chat DTOs exchanged between sessions.
//!
//! ARCHITECTURE
//! ============
//! Every payload that crosses the relay is a `ChatMessage`. Clients send
//! user messages over WebSocket, the session relay persists and broadcasts
//! them, and the relay itself synthesizes `USER_LEFT` notices when a session
//! ends. The persisted form is the flat `ChatMessageHist` row.
//!
//! DESIGN
//! ======
//! - Messages are immutable once constructed; nothing mutates a message
//!   after it enters the relay.
//! - `ChatUser` carries the only mutable state: an atomic message counter.
//!   Cloning a user yields a snapshot, so a sender embedded in a message is
//!   never aliased with the live session user.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Placeholder substituted with the session uid in notice templates.
pub const UID_PLACEHOLDER: &str = "{uid}";

// =============================================================================
// ERROR CODES
// =============================================================================

/// Grepable error code and retryable flag for structured error reporting.
pub trait ErrorCode: std::fmt::Display {
    fn error_code(&self) -> &'static str;

    fn retryable(&self) -> bool {
        false
    }
}

// =============================================================================
// TYPES
// =============================================================================

/// Kind of chat message. Wire names match the enum constant names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChatMessageType {
    #[default]
    UserMessage,
    UserJoined,
    UserLeft,
}

impl ChatMessageType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UserMessage => "USER_MESSAGE",
            Self::UserJoined => "USER_JOINED",
            Self::UserLeft => "USER_LEFT",
        }
    }
}

impl std::fmt::Display for ChatMessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A connected session's identity plus its running message count.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatUser {
    pub uid: String,
    #[serde(default)]
    message_count: AtomicU64,
}

impl ChatUser {
    /// A fresh user reference with a zero counter.
    pub fn new(uid: impl Into<String>) -> Self {
        Self { uid: uid.into(), message_count: AtomicU64::new(0) }
    }

    #[must_use]
    pub fn message_count(&self) -> u64 {
        self.message_count.load(Ordering::Acquire)
    }

    /// Bump the counter and return the new total.
    pub(crate) fn increment_message_count(&self) -> u64 {
        self.message_count.fetch_add(1, Ordering::AcqRel) + 1
    }
}

impl Clone for ChatUser {
    fn clone(&self) -> Self {
        Self { uid: self.uid.clone(), message_count: AtomicU64::new(self.message_count()) }
    }
}

impl PartialEq for ChatUser {
    fn eq(&self, other: &Self) -> bool {
        self.uid == other.uid && self.message_count() == other.message_count()
    }
}

/// The universal chat payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    #[serde(rename = "type")]
    pub message_type: ChatMessageType,
    pub text: String,
    /// Milliseconds since Unix epoch.
    pub timestamp: i64,
    pub sender: ChatUser,
}

// =============================================================================
// CONSTRUCTORS
// =============================================================================

/// Current time as milliseconds since Unix epoch.
#[must_use]
pub fn now_ms() -> i64 {
    let Ok(dur) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return 0;
    };
    i64::try_from(dur.as_millis()).unwrap_or(0)
}

/// Render a notice template for the given uid.
#[must_use]
pub fn render_notice(template: &str, uid: &str) -> String {
    template.replace(UID_PLACEHOLDER, uid)
}

impl ChatMessage {
    /// Build a message stamped with a fresh id and the current time.
    pub fn new(message_type: ChatMessageType, text: impl Into<String>, sender: ChatUser) -> Self {
        Self { id: Uuid::new_v4().to_string(), message_type, text: text.into(), timestamp: now_ms(), sender }
    }

    /// Synthetic `USER_LEFT` notice. The sender is a lightweight reference
    /// built from the uid alone, not the live session user.
    #[must_use]
    pub fn departure(uid: &str, template: &str) -> Self {
        Self::new(ChatMessageType::UserLeft, render_notice(template, uid), ChatUser::new(uid))
    }

    /// Synthetic `USER_JOINED` notice.
    #[must_use]
    pub fn arrival(uid: &str, template: &str) -> Self {
        Self::new(ChatMessageType::UserJoined, render_notice(template, uid), ChatUser::new(uid))
    }
}

// =============================================================================
// HISTORY RECORD
// =============================================================================

/// Persisted form of a chat message. Mirrors the `chat_message_hist` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ChatMessageHist {
    pub id: String,
    pub message_type: String,
    pub text: String,
    pub timestamp: i64,
    pub sender_uid: String,
}

impl From<&ChatMessage> for ChatMessageHist {
    fn from(msg: &ChatMessage) -> Self {
        Self {
            id: msg.id.clone(),
            message_type: msg.message_type.as_str().to_owned(),
            text: msg.text.clone(),
            timestamp: msg.timestamp,
            sender_uid: msg.sender.uid.clone(),
        }
    }
}

#[cfg(test)]
#[path = "message_test.rs"]
mod tests;
