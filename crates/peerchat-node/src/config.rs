//! Node configuration loaded from environment variables.
//!
//! All settings have defaults so a node can start with zero configuration for
//! local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use peerchat_shared::constants::{DEFAULT_HTTP_PORT, DEFAULT_USER_NAME, RELAY_TIMEOUT_SECS};

/// Node configuration.
#[derive(Clone)]
pub struct NodeConfig {
    /// Socket address of the HTTP API.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:27182`
    pub http_addr: SocketAddr,

    /// Directory holding all node state; conversations live in `<dir>/data`.
    /// Env: `WORKING_DIRECTORY`
    /// Default: `.peerChat`
    pub working_directory: PathBuf,

    /// Display name served at `/api/v0/user/name`.
    /// Env: `USER_NAME`
    pub user_name: String,

    /// Base address under which peers can reach this node. Sent along with
    /// every relayed message so the receiver can answer.
    /// Env: `USER_PEER_URL`
    pub user_peer_url: Option<String>,

    /// Key that local sessions must present in the auth cookie. Sessions are
    /// refused while unset.
    /// Env: `USER_AUTH_KEY`
    pub auth_key: Option<String>,

    /// Hard timeout of one outbound relay call.
    /// Env: `RELAY_TIMEOUT_SECS`
    pub relay_timeout: Duration,

    /// Origin of a separately served frontend allowed by CORS.
    /// Env: `CORS_FRONTEND_URL`
    pub cors_frontend_url: Option<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            working_directory: PathBuf::from(".peerChat"),
            user_name: DEFAULT_USER_NAME.to_string(),
            user_peer_url: None,
            auth_key: None,
            relay_timeout: Duration::from_secs(RELAY_TIMEOUT_SECS),
            cors_frontend_url: None,
        }
    }
}

// The auth key stays out of logs.
impl std::fmt::Debug for NodeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeConfig")
            .field("http_addr", &self.http_addr)
            .field("working_directory", &self.working_directory)
            .field("user_name", &self.user_name)
            .field("user_peer_url", &self.user_peer_url)
            .field("auth_key", &self.auth_key.as_ref().map(|_| "<set>"))
            .field("relay_timeout", &self.relay_timeout)
            .field("cors_frontend_url", &self.cors_frontend_url)
            .finish()
    }
}

impl NodeConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(addr) = lookup("HTTP_ADDR") {
            if let Ok(parsed) = addr.parse::<SocketAddr>() {
                config.http_addr = parsed;
            } else {
                tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default");
            }
        }

        if let Some(dir) = lookup("WORKING_DIRECTORY") {
            config.working_directory = PathBuf::from(dir);
        }

        if let Some(name) = lookup("USER_NAME") {
            if !name.trim().is_empty() {
                config.user_name = name;
            }
        }

        config.user_peer_url = lookup("USER_PEER_URL").filter(|url| !url.trim().is_empty());
        config.auth_key = lookup("USER_AUTH_KEY").filter(|key| !key.is_empty());

        if let Some(val) = lookup("RELAY_TIMEOUT_SECS") {
            match val.parse::<u64>() {
                Ok(secs) if secs > 0 => config.relay_timeout = Duration::from_secs(secs),
                _ => tracing::warn!(value = %val, "Invalid RELAY_TIMEOUT_SECS, using default"),
            }
        }

        config.cors_frontend_url = lookup("CORS_FRONTEND_URL").filter(|url| !url.is_empty());

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter.

        config
    }

    /// Root of the conversation store.
    pub fn data_dir(&self) -> PathBuf {
        self.working_directory.join("data")
    }
}
