mod config;
mod db;
mod message;
mod routes;
mod services;
mod state;

use std::sync::Arc;

use services::persistence::{ChatStore, MemoryChatStore, PgChatStore};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt::init();

    let config = config::RelayConfig::from_env();
    let port = config.port;

    // History store (non-fatal: in-memory history if DATABASE_URL is missing).
    let store: Arc<dyn ChatStore> = match config.database_url.as_deref() {
        Some(url) => {
            let pool = db::init_pool(url, config.db_max_connections)
                .await
                .expect("database init failed");
            tracing::info!(max_connections = config.db_max_connections, "postgres chat history initialized");
            Arc::new(PgChatStore::new(pool))
        }
        None => {
            tracing::warn!("DATABASE_URL not set; chat history kept in memory only");
            Arc::new(MemoryChatStore::new())
        }
    };

    tracing::info!(
        inbound_demand = config.inbound_demand,
        broadcast_capacity = config.broadcast_capacity,
        cleanup_policy = ?config.cleanup_policy,
        "relay configured"
    );

    let state = state::AppState::new(store, config);
    let app = routes::app(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}"))
        .await
        .expect("failed to bind");

    tracing::info!(%port, "chat-relay listening");
    axum::serve(listener, app).await.expect("server failed");
}
