//! Persistence service — durable chat history.
//!
//! DESIGN
//! ======
//! The relay writes one `ChatMessageHist` row per accepted message and waits
//! for the write before broadcasting, so history order matches broadcast
//! order for a session. The store is a trait so start-up can pick Postgres
//! or an in-memory fallback, and tests can inject failures.
//!
//! ERROR HANDLING
//! ==============
//! Writes are not retried here. A failed save surfaces to the relay, which
//! ends the session; partial history is preferable to silently diverging
//! from what peers saw.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::PgPool;
use tokio::sync::RwLock;

use crate::message::{ChatMessageHist, ErrorCode};

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl ErrorCode for StoreError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Database(_) => "E_DATABASE",
        }
    }

    fn retryable(&self) -> bool {
        matches!(
            self,
            Self::Database(sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed)
        )
    }
}

/// Durable sink for chat history.
#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Persist one history row.
    async fn save(&self, record: &ChatMessageHist) -> Result<(), StoreError>;

    /// Most recent rows, newest first.
    async fn recent(&self, limit: i64) -> Result<Vec<ChatMessageHist>, StoreError>;
}

// =============================================================================
// POSTGRES
// =============================================================================

pub struct PgChatStore {
    pool: PgPool,
}

impl PgChatStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ChatStore for PgChatStore {
    async fn save(&self, record: &ChatMessageHist) -> Result<(), StoreError> {
        sqlx::query(
            r"INSERT INTO chat_message_hist (id, message_type, text, timestamp, sender_uid)
              VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(&record.id)
        .bind(&record.message_type)
        .bind(&record.text)
        .bind(record.timestamp)
        .bind(&record.sender_uid)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recent(&self, limit: i64) -> Result<Vec<ChatMessageHist>, StoreError> {
        let rows = sqlx::query_as::<_, ChatMessageHist>(
            r"SELECT id, message_type, text, timestamp, sender_uid
              FROM chat_message_hist
              ORDER BY timestamp DESC, seq DESC
              LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

// =============================================================================
// IN-MEMORY
// =============================================================================

/// Process-local history, used when no database is configured.
#[derive(Clone, Default)]
pub struct MemoryChatStore {
    rows: Arc<RwLock<Vec<ChatMessageHist>>>,
}

impl MemoryChatStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All rows in insertion order.
    #[cfg(test)]
    pub async fn all(&self) -> Vec<ChatMessageHist> {
        self.rows.read().await.clone()
    }
}

#[async_trait]
impl ChatStore for MemoryChatStore {
    async fn save(&self, record: &ChatMessageHist) -> Result<(), StoreError> {
        self.rows.write().await.push(record.clone());
        Ok(())
    }

    async fn recent(&self, limit: i64) -> Result<Vec<ChatMessageHist>, StoreError> {
        let take = usize::try_from(limit).unwrap_or(0);
        let rows = self.rows.read().await;
        Ok(rows.iter().rev().take(take).cloned().collect())
    }
}

#[cfg(test)]
#[path = "persistence_test.rs"]
mod tests;
