//! Shared application state.
//!
//! DESIGN
//! ======
//! `AppState` is injected into Axum handlers via the `State` extractor.
//! It holds the history store, the session registry, the shared broadcast
//! channel, and the loaded configuration. Each websocket builds its session
//! relay from these handles.

use std::sync::Arc;

use crate::config::RelayConfig;
use crate::services::broadcast::ChatBroadcast;
use crate::services::persistence::ChatStore;
use crate::services::registry::SessionRegistry;

/// Shared application state, injected into Axum handlers via State extractor.
/// Clone is required by Axum; all inner fields are Arc-wrapped or Clone.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ChatStore>,
    pub registry: SessionRegistry,
    pub broadcast: ChatBroadcast,
    pub config: Arc<RelayConfig>,
}

impl AppState {
    #[must_use]
    pub fn new(store: Arc<dyn ChatStore>, config: RelayConfig) -> Self {
        Self {
            store,
            registry: SessionRegistry::new(),
            broadcast: ChatBroadcast::new(config.broadcast_capacity),
            config: Arc::new(config),
        }
    }
}

// =============================================================================
// TEST HELPERS
// =============================================================================
