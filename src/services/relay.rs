//! Session relay — per-session bridge from inbound messages to history and peers.
//!
//! DESIGN
//! ======
//! One `SessionRelay` exists per connected session. It runs as a single
//! tokio task draining a bounded inbound channel, so at most one callback is
//! ever in flight and no internal locking is needed. For each message it:
//! 1. increments the session's message counter
//! 2. remembers the message as last-seen
//! 3. awaits the history write
//! 4. publishes the message to the shared broadcast channel
//!
//! LIFECYCLE
//! =========
//! `Pending → Active → Completed | Failed`. `on_start` grants the inbound
//! demand that sizes the channel; channel close is normal completion, an
//! `Err` item or a failed history write is failure. Terminal states are
//! final: later signals are ignored.
//!
//! TRADE-OFFS
//! ==========
//! Persistence is awaited before broadcast, so a slow database throttles the
//! session through the bounded channel instead of letting history fall
//! behind what peers have already seen. Cleanup on termination is governed
//! by `CleanupPolicy`. `Legacy` is the default and cleans up only after a
//! completed session that sent something; `Always` cleans up on every
//! terminal path.

use std::str::FromStr;
use std::sync::Arc;

use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::message::{ChatMessage, ChatMessageHist, ChatUser, ErrorCode};
use crate::services::broadcast::ChatBroadcast;
use crate::services::persistence::{ChatStore, StoreError};
use crate::services::registry::SessionRegistry;
use crate::state::AppState;

const DEFAULT_INBOUND_DEMAND: usize = 10_000;

/// Clamp a requested demand into what a bounded mpsc channel accepts.
#[must_use]
pub fn clamp_demand(demand: usize) -> usize {
    demand.clamp(1, Semaphore::MAX_PERMITS)
}

/// One item on a session's inbound channel.
pub type Inbound = Result<ChatMessage, RelayError>;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("history write failed: {0}")]
    Store(#[from] StoreError),
    #[error("invalid inbound message: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("transport error: {0}")]
    Transport(String),
}

impl ErrorCode for RelayError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Store(e) => e.error_code(),
            Self::Decode(_) => "E_DECODE",
            Self::Transport(_) => "E_TRANSPORT",
        }
    }

    fn retryable(&self) -> bool {
        match self {
            Self::Store(e) => e.retryable(),
            Self::Decode(_) => false,
            Self::Transport(_) => true,
        }
    }
}

/// What a relay does to the registry and to peers when its stream ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CleanupPolicy {
    /// Deregister on every terminal transition; announce departure on both
    /// terminal paths when the session sent at least one message.
    Always,
    /// Announce and deregister only on completion after at least one
    /// message. Failures only log, and silent sessions stay registered.
    #[default]
    Legacy,
}

impl FromStr for CleanupPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "always" => Ok(Self::Always),
            "legacy" => Ok(Self::Legacy),
            other => Err(format!("unknown cleanup policy: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    /// Constructed, no demand granted yet.
    Pending,
    Active,
    Completed,
    Failed,
}

impl RelayState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Summary returned when a relay task finishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayOutcome {
    pub uid: String,
    pub state: RelayState,
    pub messages: u64,
    pub departure_sent: bool,
    pub deregistered: bool,
}

// =============================================================================
// RELAY
// =============================================================================

pub struct SessionRelay {
    user: Arc<ChatUser>,
    broadcast: ChatBroadcast,
    store: Arc<dyn ChatStore>,
    registry: SessionRegistry,
    last_received: Option<ChatMessage>,
    state: RelayState,
    policy: CleanupPolicy,
    demand: usize,
    departure_template: String,
    departure_sent: bool,
    deregistered: bool,
}

impl SessionRelay {
    pub fn new(
        user: Arc<ChatUser>,
        broadcast: ChatBroadcast,
        store: Arc<dyn ChatStore>,
        registry: SessionRegistry,
    ) -> Self {
        Self {
            user,
            broadcast,
            store,
            registry,
            last_received: None,
            state: RelayState::Pending,
            policy: CleanupPolicy::default(),
            demand: DEFAULT_INBOUND_DEMAND,
            departure_template: crate::config::DEFAULT_DEPARTURE_TEMPLATE.to_owned(),
            departure_sent: false,
            deregistered: false,
        }
    }

    /// Build a relay wired to the shared application handles and settings.
    #[must_use]
    pub fn for_session(state: &AppState, user: Arc<ChatUser>) -> Self {
        Self::new(user, state.broadcast.clone(), state.store.clone(), state.registry.clone())
            .with_policy(state.config.cleanup_policy)
            .with_demand(state.config.inbound_demand)
            .with_departure_template(state.config.departure_template.clone())
    }

    #[must_use]
    pub fn with_policy(mut self, policy: CleanupPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub fn with_demand(mut self, demand: usize) -> Self {
        self.demand = clamp_demand(demand);
        self
    }

    #[must_use]
    pub fn with_departure_template(mut self, template: impl Into<String>) -> Self {
        self.departure_template = template.into();
        self
    }

    /// The session user this relay counts for.
    #[must_use]
    pub fn user(&self) -> &Arc<ChatUser> {
        &self.user
    }

    #[must_use]
    pub fn state(&self) -> RelayState {
        self.state
    }

    #[must_use]
    pub fn last_received(&self) -> Option<&ChatMessage> {
        self.last_received.as_ref()
    }

    #[must_use]
    pub fn outcome(&self) -> RelayOutcome {
        RelayOutcome {
            uid: self.user.uid.clone(),
            state: self.state,
            messages: self.user.message_count(),
            departure_sent: self.departure_sent,
            deregistered: self.deregistered,
        }
    }

    // =========================================================================
    // STREAM CALLBACKS
    // =========================================================================

    /// Activate the relay and return how many inbound items it accepts
    /// ahead of processing.
    pub fn on_start(&mut self) -> usize {
        if self.state == RelayState::Pending {
            self.state = RelayState::Active;
            info!(uid = %self.user.uid, demand = self.demand, "relay: started");
        } else {
            warn!(uid = %self.user.uid, state = ?self.state, "relay: start ignored");
        }
        self.demand
    }

    /// Count, persist, and broadcast one inbound message.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Store` if the history write fails. The message is
    /// counted but not broadcast.
    pub async fn on_message(&mut self, msg: ChatMessage) -> Result<(), RelayError> {
        if self.state != RelayState::Active {
            warn!(uid = %self.user.uid, id = %msg.id, state = ?self.state, "relay: message outside active state; dropped");
            return Ok(());
        }

        let count = self.user.increment_message_count();
        self.last_received = Some(msg.clone());

        self.store.save(&ChatMessageHist::from(&msg)).await?;

        let id = msg.id.clone();
        let reached = self.broadcast.publish(msg);
        debug!(uid = %self.user.uid, %id, count, reached, "relay: message relayed");
        Ok(())
    }

    /// Terminal failure. Logs the error; further cleanup depends on policy.
    pub async fn on_error(&mut self, err: &RelayError) {
        if self.state.is_terminal() {
            return;
        }
        self.state = RelayState::Failed;
        error!(
            uid = %self.user.uid,
            error = %err,
            code = err.error_code(),
            retryable = err.retryable(),
            detail = ?err,
            "relay: session stream failed"
        );

        if self.policy == CleanupPolicy::Always {
            self.release().await;
        }
    }

    /// Terminal completion. Announces departure and deregisters according to policy.
    pub async fn on_complete(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        self.state = RelayState::Completed;
        info!(uid = %self.user.uid, messages = self.user.message_count(), "relay: session stream completed");

        match self.policy {
            CleanupPolicy::Always => self.release().await,
            CleanupPolicy::Legacy => {
                if self.last_received.is_some() {
                    self.announce_departure();
                    self.deregister().await;
                }
            }
        }
    }

    // =========================================================================
    // DRIVER
    // =========================================================================

    /// Drain `inbound` until a terminal transition.
    pub async fn run(mut self, mut inbound: mpsc::Receiver<Inbound>) -> RelayOutcome {
        if self.state == RelayState::Pending {
            self.on_start();
        }

        while !self.state().is_terminal() {
            match inbound.recv().await {
                Some(Ok(msg)) => {
                    if let Err(e) = self.on_message(msg).await {
                        self.on_error(&e).await;
                    }
                }
                Some(Err(e)) => self.on_error(&e).await,
                None => self.on_complete().await,
            }
        }

        self.outcome()
    }

    /// Start the relay on its own task. Returns the inbound sender, bounded
    /// by the demand granted in `on_start`, and the task handle.
    pub fn spawn(mut self) -> (mpsc::Sender<Inbound>, JoinHandle<RelayOutcome>) {
        let demand = self.on_start();
        let (tx, rx) = mpsc::channel(demand);
        let handle = tokio::spawn(self.run(rx));
        (tx, handle)
    }

    // =========================================================================
    // CLEANUP
    // =========================================================================

    async fn release(&mut self) {
        if self.last_received().is_some() {
            self.announce_departure();
        }
        self.deregister().await;
    }

    fn announce_departure(&mut self) {
        let notice = ChatMessage::departure(&self.user.uid, &self.departure_template);
        let reached = self.broadcast.publish(notice);
        self.departure_sent = true;
        info!(uid = %self.user.uid, reached, "relay: departure announced");
    }

    async fn deregister(&mut self) {
        let removed = self.registry.remove(&self.user.uid).await;
        self.deregistered = true;
        debug!(uid = %self.user.uid, removed, "relay: session deregistered");
    }
}

#[cfg(test)]
#[path = "relay_test.rs"]
mod tests;
