use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{ConnectInfo, DefaultBodyLimit, State},
    http::{header, HeaderMap, HeaderValue, Method},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use peerchat_shared::constants::{API_NAME, API_V0_PREFIX, AUTH_COOKIE, RELAY_MESSAGE_PATH};
use peerchat_store::Store;

use crate::config::NodeConfig;
use crate::error::ServerError;
use crate::events::EventBus;
use crate::relay::{self, RelayClient};
use crate::socket;

/// Largest relay body accepted from a peer.
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Services shared by every handler, built once in `main`.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub bus: EventBus,
    pub relay: RelayClient,
    pub config: Arc<NodeConfig>,
}

pub fn build_router(state: AppState) -> Router {
    let router = Router::new()
        .route("/ping", get(ping))
        .route("/who", get(who))
        .route("/api/v0/user/name", get(user_name))
        .route(RELAY_MESSAGE_PATH, post(relay_message))
        .route("/socket", get(socket::session))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES));

    let router = match state.config.cors_frontend_url.as_deref().map(cors_layer) {
        Some(Some(cors)) => router.layer(cors),
        _ => router,
    };

    router.layer(TraceLayer::new_for_http()).with_state(state)
}

fn cors_layer(origin: &str) -> Option<CorsLayer> {
    let Ok(origin) = origin.parse::<HeaderValue>() else {
        warn!(origin, "Invalid CORS_FRONTEND_URL, CORS disabled");
        return None;
    };
    Some(
        CorsLayer::new()
            .allow_origin(origin)
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers([header::CONTENT_TYPE])
            .allow_credentials(true),
    )
}

#[derive(Serialize)]
struct WhoResponse {
    name: &'static str,
    api: ApiVersions,
}

#[derive(Serialize)]
struct ApiVersions {
    #[serde(rename = "0")]
    v0: &'static str,
}

async fn ping() -> &'static str {
    "pong"
}

async fn who() -> Json<WhoResponse> {
    Json(WhoResponse {
        name: API_NAME,
        api: ApiVersions { v0: API_V0_PREFIX },
    })
}

async fn user_name(State(state): State<AppState>) -> String {
    state.config.user_name.clone()
}

/// Inbound relay from a peer. Answers with the conversation id.
async fn relay_message(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    body: Bytes,
) -> Result<String, ServerError> {
    let result = relay::receive(&state, &body, Some(addr.ip())).await;
    if let Err(e) = &result {
        info!(origin = %addr, error = %e, "Rejected relayed message");
    }
    result
}

/// Check the session cookie against the configured key.
pub fn verify_session_cookie(headers: &HeaderMap, config: &NodeConfig) -> Result<(), ServerError> {
    let Some(ref expected) = config.auth_key else {
        return Err(ServerError::Forbidden(
            "Sessions are disabled (no USER_AUTH_KEY configured)".into(),
        ));
    };

    let presented = headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == AUTH_COOKIE)
        .map(|(_, value)| value)
        .ok_or_else(|| ServerError::Unauthorized("Missing credentials".into()))?;

    // Constant-time comparison to prevent timing attacks on the session key.
    use subtle::ConstantTimeEq;
    let presented = presented.as_bytes();
    let expected = expected.as_bytes();
    if presented.len() != expected.len() || presented.ct_eq(expected).unwrap_u8() != 1 {
        return Err(ServerError::Unauthorized("Bad credentials".into()));
    }

    Ok(())
}

pub async fn serve(state: AppState, addr: SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::extract::connect_info::MockConnectInfo;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use peerchat_shared::types::{Conversation, MessageStatus};

    use super::*;
    use crate::testing::test_state;

    fn app(state: &AppState) -> Router {
        build_router(state.clone()).layer(MockConnectInfo(SocketAddr::from(([192, 168, 0, 42], 50000))))
    }

    async fn post_relay(state: &AppState, body: &'static str) -> (StatusCode, String) {
        let response = app(state)
            .oneshot(
                Request::post(RELAY_MESSAGE_PATH)
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_ping_and_who() {
        let (state, _dir) = test_state().await;

        let response = app(&state)
            .oneshot(Request::get("/ping").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"pong");

        let response = app(&state)
            .oneshot(Request::get("/who").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["name"], "peerChatAPI");
        assert_eq!(value["api"]["0"], "/api/v0");
    }

    #[tokio::test]
    async fn test_relay_to_unknown_conversation() {
        let (state, _dir) = test_state().await;

        let (status, body) = post_relay(&state, r#"{"cid":"c1","msg":{"body":"hi"}}"#).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "c1");

        let c = state.store.load_conversation("c1").await.unwrap();
        assert_eq!(c.length, 1);
        assert_eq!(c.peer, "192.168.0.42");
        let m = state.store.load_message("c1", "0").await.unwrap();
        assert_eq!(m.body.as_deref(), Some("hi"));
        assert_eq!(m.status, MessageStatus::Ok);
    }

    #[tokio::test]
    async fn test_relay_to_known_conversation_overwrites_peer() {
        let (state, _dir) = test_state().await;
        state
            .store
            .create_conversation(Conversation::with_id("c2", "http://old:27182", "Bob"))
            .await
            .unwrap();
        post_relay(&state, r#"{"cid":"c2","msg":{"body":"one"}}"#).await;

        let (status, body) = post_relay(
            &state,
            r#"{"cid":"c2","msg":{"body":"two"},"peer":"http://new:27182"}"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "c2");

        let c = state.store.load_conversation("c2").await.unwrap();
        assert_eq!(c.peer, "http://new:27182");
        assert_eq!(c.name, "Bob");
        assert_eq!(c.length, 2);
        assert_eq!(
            state.store.load_message("c2", "1").await.unwrap().body.as_deref(),
            Some("two")
        );
    }

    #[tokio::test]
    async fn test_relay_without_json_is_rejected() {
        let (state, _dir) = test_state().await;

        let (status, _) = post_relay(&state, "").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, body) = post_relay(&state, "{cid: nope").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(!body.is_empty());

        assert!(state.store.list_conversations().await.is_empty());
    }

    #[tokio::test]
    async fn test_user_name() {
        let (state, _dir) = test_state().await;
        let response = app(&state)
            .oneshot(Request::get("/api/v0/user/name").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], state.config.user_name.as_bytes());
    }

    fn cookie_headers(cookie: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_str(cookie).unwrap());
        headers
    }

    #[test]
    fn test_verify_session_cookie() {
        let config = NodeConfig {
            auth_key: Some("k3y".into()),
            ..NodeConfig::default()
        };

        assert!(verify_session_cookie(&cookie_headers("theme=dark; peerChatAuth=k3y"), &config).is_ok());
        assert!(matches!(
            verify_session_cookie(&cookie_headers("peerChatAuth=wrong"), &config),
            Err(ServerError::Unauthorized(_))
        ));
        assert!(matches!(
            verify_session_cookie(&HeaderMap::new(), &config),
            Err(ServerError::Unauthorized(_))
        ));
        assert!(matches!(
            verify_session_cookie(&cookie_headers("peerChatAuth=k3y"), &NodeConfig::default()),
            Err(ServerError::Forbidden(_))
        ));
    }
}
