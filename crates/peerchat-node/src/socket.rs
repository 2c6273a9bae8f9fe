//! Real-time sessions for the local UI over a WebSocket at `GET /socket`.
//!
//! Each session answers request frames and is pushed every bus event. Commands
//! run on their own tasks so a slow `send-message` never holds back events or
//! other requests of the same session.

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        State,
    },
    http::HeaderMap,
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use peerchat_shared::constants::DEFAULT_CONVERSATION_NAME;
use peerchat_shared::protocol::{Command, ServerFrame, SessionRequest};
use peerchat_shared::types::{Conversation, Message};

use crate::api::{verify_session_cookie, AppState};
use crate::error::ServerError;
use crate::events::Subscription;
use crate::relay;

/// Replies queued per session before command tasks wait.
const REPLY_BUFFER: usize = 64;

pub async fn session(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response, ServerError> {
    verify_session_cookie(&headers, &state.config)?;
    // Subscribed before the handshake completes, so the client sees every
    // event emitted after it is connected.
    let events = state.bus.subscribe();
    Ok(ws.on_upgrade(move |socket| handle_session(socket, state, events)))
}

async fn handle_session(socket: WebSocket, state: AppState, mut events: Subscription) {
    let (mut sink, mut stream) = socket.split();
    let (reply_tx, mut reply_rx) = mpsc::channel::<ServerFrame>(REPLY_BUFFER);

    info!(sessions = state.bus.subscriber_count(), "Session connected");

    loop {
        let outgoing = tokio::select! {
            incoming = stream.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => {
                    let state = state.clone();
                    let reply_tx = reply_tx.clone();
                    tokio::spawn(async move {
                        let frame = handle_frame(&state, &text).await;
                        let _ = reply_tx.send(frame).await;
                    });
                    continue;
                }
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    debug!(error = %e, "Session read failed");
                    break;
                }
            },
            event = events.recv() => match event {
                Some(event) => ServerFrame::Event {
                    event: event.name,
                    data: event.payload,
                },
                None => break,
            },
            Some(reply) = reply_rx.recv() => reply,
        };

        let text = match outgoing.to_json() {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "Failed to encode session frame");
                continue;
            }
        };
        if sink.send(WsMessage::Text(text)).await.is_err() {
            break;
        }
    }

    info!("Session disconnected");
}

/// Answer one text frame of a session.
pub async fn handle_frame(state: &AppState, text: &str) -> ServerFrame {
    let request: SessionRequest = match serde_json::from_str(text) {
        Ok(request) => request,
        // Without an id there is nobody to answer to.
        Err(e) => return ServerFrame::err(0, format!("Invalid frame: {e}")),
    };

    let command = match request.command() {
        Ok(command) => command,
        Err(e) => return ServerFrame::err(request.id, e.to_string()),
    };

    match dispatch(state, command).await {
        Ok(result) => ServerFrame::ok(request.id, result),
        Err(e) => {
            debug!(id = request.id, command = %request.command, error = %e, "Command failed");
            ServerFrame::err(request.id, e.to_string())
        }
    }
}

/// Run a session command against the store and announce what it changed.
pub async fn dispatch(state: &AppState, command: Command) -> Result<Value, ServerError> {
    let store = &state.store;

    match command {
        Command::Ping => Ok(json!("pong")),

        Command::ListConversations => Ok(json!(store.list_conversations().await)),

        Command::GetConversation { cid } => {
            let conversation = store
                .load_conversation(&cid)
                .await
                .ok_or_else(|| ServerError::NotFound(format!("conversation {cid}")))?;
            Ok(serde_json::to_value(conversation.snapshot())?)
        }

        Command::GetMessage { cid, mid } => {
            let message = store
                .load_message(&cid, &mid)
                .await
                .ok_or_else(|| ServerError::NotFound(format!("message {cid}/{mid}")))?;
            Ok(serde_json::to_value(message)?)
        }

        Command::PostMessage { cid, msg } => {
            let message = Message { is_mine: true, ..msg };
            let mid = store
                .post_message(&cid, message)
                .await
                .ok_or_else(|| ServerError::NotFound(format!("conversation {cid}")))?;

            if let Some(conversation) = store.load_conversation(&cid).await {
                state.bus.conversation_updated(&conversation);
            }
            if let Some(stored) = store.load_message(&cid, &mid).await {
                state.bus.message_updated(&cid, &stored);
            }
            Ok(json!(mid))
        }

        Command::CreateConversation { peer, name } => {
            let name = if name.trim().is_empty() {
                DEFAULT_CONVERSATION_NAME.to_string()
            } else {
                name
            };
            let conversation = store.create_conversation(Conversation::new(peer, name)).await?;
            state.bus.conversation_created(&conversation.id);
            Ok(json!(conversation.id))
        }

        Command::SendMessage { cid, mid } => match relay::send_message(state, &cid, &mid).await {
            Ok(_) => Ok(json!(true)),
            Err(ServerError::Relay(_)) => Ok(json!(false)),
            Err(e) => Err(e),
        },

        Command::ChangeConversationDetails { cid, name, peer } => {
            let conversation = store
                .update_conversation(&cid, |c| {
                    c.name = name;
                    c.peer = peer;
                })
                .await
                .ok_or_else(|| ServerError::NotFound(format!("conversation {cid}")))?;
            state.bus.conversation_updated(&conversation);
            Ok(serde_json::to_value(conversation.snapshot())?)
        }

        Command::MarkConversationRead { cid } => {
            let conversation = store
                .update_conversation(&cid, |c| c.unread_messages = false)
                .await
                .ok_or_else(|| ServerError::NotFound(format!("conversation {cid}")))?;
            state.bus.conversation_updated(&conversation);
            Ok(json!(true))
        }
    }
}
