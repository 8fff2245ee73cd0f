//! Broadcast service — shared fan-out of chat messages to every session.
//!
//! DESIGN
//! ======
//! A single `tokio::sync::broadcast` channel carries every published
//! message. Each websocket subscribes once at connect time and forwards what
//! it receives to its client, so every session sees the same global order.
//! Slow subscribers lag (and skip) rather than stall publishers.

use tokio::sync::broadcast;
use tracing::debug;

use crate::message::ChatMessage;

/// Cloneable handle to the shared broadcast channel.
#[derive(Clone)]
pub struct ChatBroadcast {
    tx: broadcast::Sender<ChatMessage>,
}

impl ChatBroadcast {
    /// Create a channel buffering up to `capacity` messages per subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish a message to all current subscribers. Returns how many
    /// subscribers it reached; zero when nobody is listening.
    pub fn publish(&self, msg: ChatMessage) -> usize {
        let id = msg.id.clone();
        if let Ok(count) = self.tx.send(msg) {
            count
        } else {
            debug!(%id, "broadcast: no subscribers");
            0
        }
    }

    /// Subscribe to messages published from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ChatMessage> {
        self.tx.subscribe()
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
