//! Fixtures shared by the node's unit tests.

use std::net::SocketAddr;
use std::sync::Arc;

use tempfile::TempDir;

use peerchat_store::Store;

use crate::api::{build_router, AppState};
use crate::config::NodeConfig;
use crate::events::EventBus;
use crate::relay::RelayClient;

async fn state_in(dir: &TempDir, config: NodeConfig) -> AppState {
    let config = NodeConfig {
        working_directory: dir.path().to_path_buf(),
        ..config
    };
    let store = Store::open(config.data_dir()).await.unwrap();
    let relay = RelayClient::new(config.relay_timeout, config.user_peer_url.clone()).unwrap();

    AppState {
        store: Arc::new(store),
        bus: EventBus::default(),
        relay,
        config: Arc::new(config),
    }
}

/// A node state backed by a fresh temporary directory.
pub async fn test_state() -> (AppState, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let state = state_in(&dir, NodeConfig::default()).await;
    (state, dir)
}

/// A node listening on an ephemeral loopback port.
pub async fn spawn_node(own_address: Option<String>) -> (AppState, SocketAddr, TempDir) {
    spawn_node_with(NodeConfig {
        user_peer_url: own_address,
        ..NodeConfig::default()
    })
    .await
}

/// Like [`spawn_node`], with every other setting taken from `config`.
pub async fn spawn_node_with(config: NodeConfig) -> (AppState, SocketAddr, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let state = state_in(&dir, config).await;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = build_router(state.clone());
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    (state, addr, dir)
}
