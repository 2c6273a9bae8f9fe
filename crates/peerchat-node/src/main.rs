//! # peerchat-node
//!
//! A single peer of the chat network. It provides:
//! - a **file-backed store** of conversations and messages (one directory per
//!   conversation under the working directory)
//! - the **relay endpoint** `POST /api/v0/message` through which peers deliver
//!   messages, and the client that delivers ours
//! - a **WebSocket session** (`GET /socket`) for the local UI, pushed every
//!   store mutation as it happens

mod api;
mod config;
mod error;
mod events;
mod relay;
mod socket;
#[cfg(test)]
mod testing;

use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use peerchat_store::Store;

use crate::api::AppState;
use crate::config::NodeConfig;
use crate::events::EventBus;
use crate::relay::RelayClient;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                EnvFilter::new("info,peerchat_node=debug,peerchat_store=debug")
            }),
        )
        .init();

    info!("Starting peerchat node v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = NodeConfig::from_env();
    info!(?config, "Loaded configuration");
    if config.auth_key.is_none() {
        warn!("USER_AUTH_KEY not set, UI sessions will be refused");
    }
    if config.user_peer_url.is_none() {
        warn!("USER_PEER_URL not set, peers will answer to our remote IP");
    }

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------
    let store = Arc::new(Store::open(config.data_dir()).await?);
    info!(
        path = %store.root().display(),
        conversations = store.list_conversations().await.len(),
        "Store opened"
    );

    let relay = RelayClient::new(config.relay_timeout, config.user_peer_url.clone())?;
    let http_addr = config.http_addr;

    let app_state = AppState {
        store,
        bus: EventBus::default(),
        relay,
        config: Arc::new(config),
    };

    // -----------------------------------------------------------------------
    // 4. Serve until interrupted
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(app_state, http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server exited with error");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    info!("peerchat node stopped");
    Ok(())
}
