//! Session registry — directory of active chat sessions.
//!
//! ARCHITECTURE
//! ============
//! One entry per connected session, keyed by uid. The websocket layer
//! registers a session before its relay starts; the relay removes its own
//! entry on termination. The registry is an explicit cloneable handle passed
//! to whoever needs it, so tests can build isolated instances.
//!
//! TRADE-OFFS
//! ==========
//! Entries hold the same `Arc<ChatUser>` the relay increments. Readers see
//! live counts without taking any relay-side lock.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;

use crate::message::{ChatUser, ErrorCode, now_ms};

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("session already connected: {0}")]
    AlreadyConnected(String),
}

impl ErrorCode for RegistryError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::AlreadyConnected(_) => "E_SESSION_CONFLICT",
        }
    }
}

/// Registry-side view of one session.
#[derive(Debug, Clone)]
pub struct SessionEntry {
    pub user: Arc<ChatUser>,
    /// Milliseconds since Unix epoch.
    pub connected_at: i64,
}

/// Serializable point-in-time summary of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub uid: String,
    pub message_count: u64,
    pub connected_at: i64,
}

// =============================================================================
// REGISTRY
// =============================================================================

#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, SessionEntry>>>,
}

impl SessionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session. Rejects a uid that is already present.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyConnected` if the uid is registered.
    pub async fn register(&self, user: Arc<ChatUser>) -> Result<(), RegistryError> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&user.uid) {
            return Err(RegistryError::AlreadyConnected(user.uid.clone()));
        }
        sessions.insert(user.uid.clone(), SessionEntry { user, connected_at: now_ms() });
        Ok(())
    }

    /// Remove a session by uid. Removing an absent uid is not an error;
    /// the return value says whether anything was removed.
    pub async fn remove(&self, uid: &str) -> bool {
        self.sessions.write().await.remove(uid).is_some()
    }

    #[cfg(test)]
    pub async fn contains(&self, uid: &str) -> bool {
        self.sessions.read().await.contains_key(uid)
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Summaries of all sessions, oldest connection first.
    pub async fn snapshot(&self) -> Vec<SessionSummary> {
        let sessions = self.sessions.read().await;
        let mut list: Vec<SessionSummary> = sessions
            .values()
            .map(|entry| SessionSummary {
                uid: entry.user.uid.clone(),
                message_count: entry.user.message_count(),
                connected_at: entry.connected_at,
            })
            .collect();
        list.sort_by(|a, b| a.connected_at.cmp(&b.connected_at).then_with(|| a.uid.cmp(&b.uid)));
        list
    }
}

#[cfg(test)]
#[path = "registry_test.rs"]
mod tests;
