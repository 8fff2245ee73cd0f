//! Runtime configuration loaded from environment variables.
//!
//! DESIGN
//! ======
//! Every knob has a compiled-in default. Missing or unparseable values fall
//! back to the default instead of failing start-up; only `DATABASE_URL` is
//! optional in a way that changes behavior (no URL means in-memory history).

use crate::services::relay::{CleanupPolicy, clamp_demand};

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 5;
const DEFAULT_INBOUND_DEMAND: usize = 10_000;
const DEFAULT_BROADCAST_CAPACITY: usize = 1024;
const DEFAULT_HISTORY_LIMIT: i64 = 50;
const DEFAULT_HISTORY_MAX_LIMIT: i64 = 500;

pub const DEFAULT_DEPARTURE_TEMPLATE: &str = "{uid} 님이 퇴장했습니다.";
pub const DEFAULT_JOIN_TEMPLATE: &str = "{uid} 님이 입장했습니다.";

/// Parse an environment variable, falling back to `default` when missing or invalid.
pub(crate) fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_owned())
}

/// Service-wide settings.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// HTTP listen port.
    pub port: u16,
    /// Postgres URL. `None` selects the in-memory history store.
    pub database_url: Option<String>,
    /// Pool size for the Postgres store.
    pub db_max_connections: u32,
    /// Inbound items a session may queue ahead of the relay.
    pub inbound_demand: usize,
    /// Per-subscriber buffer of the shared broadcast channel.
    pub broadcast_capacity: usize,
    /// What happens to the registry entry and departure notice on termination.
    pub cleanup_policy: CleanupPolicy,
    /// `USER_LEFT` text; `{uid}` is replaced with the session uid.
    pub departure_template: String,
    /// `USER_JOINED` text; `{uid}` is replaced with the session uid.
    pub join_template: String,
    /// Rows returned by the history endpoint when no limit is given.
    pub history_default_limit: i64,
    /// Upper bound on the history endpoint limit.
    pub history_max_limit: i64,
}

impl RelayConfig {
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            port: env_parse("PORT", DEFAULT_PORT),
            database_url: std::env::var("DATABASE_URL").ok().filter(|v| !v.is_empty()),
            db_max_connections: env_parse("DB_MAX_CONNECTIONS", DEFAULT_DB_MAX_CONNECTIONS),
            inbound_demand: clamp_demand(env_parse("RELAY_INBOUND_DEMAND", DEFAULT_INBOUND_DEMAND)),
            broadcast_capacity: env_parse("RELAY_BROADCAST_CAPACITY", DEFAULT_BROADCAST_CAPACITY).max(1),
            cleanup_policy: env_parse("RELAY_CLEANUP_POLICY", CleanupPolicy::default()),
            departure_template: env_string("RELAY_DEPARTURE_TEMPLATE", DEFAULT_DEPARTURE_TEMPLATE),
            join_template: env_string("RELAY_JOIN_TEMPLATE", DEFAULT_JOIN_TEMPLATE),
            history_default_limit: env_parse("RELAY_HISTORY_DEFAULT_LIMIT", DEFAULT_HISTORY_LIMIT),
            history_max_limit: env_parse("RELAY_HISTORY_MAX_LIMIT", DEFAULT_HISTORY_MAX_LIMIT).max(1),
        }
    }

    /// Clamp a requested history limit into `1..=history_max_limit`.
    #[must_use]
    pub fn history_limit(&self, requested: Option<i64>) -> i64 {
        requested
            .unwrap_or(self.history_default_limit)
            .clamp(1, self.history_max_limit)
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            database_url: None,
            db_max_connections: DEFAULT_DB_MAX_CONNECTIONS,
            inbound_demand: DEFAULT_INBOUND_DEMAND,
            broadcast_capacity: DEFAULT_BROADCAST_CAPACITY,
            cleanup_policy: CleanupPolicy::default(),
            departure_template: DEFAULT_DEPARTURE_TEMPLATE.to_owned(),
            join_template: DEFAULT_JOIN_TEMPLATE.to_owned(),
            history_default_limit: DEFAULT_HISTORY_LIMIT,
            history_max_limit: DEFAULT_HISTORY_MAX_LIMIT,
        }
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
