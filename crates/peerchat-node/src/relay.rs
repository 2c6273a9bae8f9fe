//! Node-to-node message relay.
//!
//! Outbound: a locally composed message moves `draft/queued -> sending ->
//! ok | error` around a single `POST <peer>/api/v0/message`. The
//! conversation's lock is held only while the status is read and written,
//! never during the HTTP call, so a slow peer does not block anything else.
//!
//! Inbound: a peer's POST lands in [`receive`], which creates the
//! conversation on first contact (with the id the peer chose) and appends the
//! message as delivered.

use std::net::IpAddr;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use peerchat_shared::constants::{DEFAULT_CONVERSATION_NAME, RELAY_MESSAGE_PATH};
use peerchat_shared::protocol::RelayRequest;
use peerchat_shared::types::{Conversation, Message, MessageStatus};

use crate::api::AppState;
use crate::error::ServerError;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("peer unreachable: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("peer answered {status}: {body}")]
    Rejected { status: u16, body: String },
}

// ---------------------------------------------------------------------------
// Outbound client
// ---------------------------------------------------------------------------

/// HTTP client used to deliver messages to peers.
#[derive(Debug, Clone)]
pub struct RelayClient {
    http: reqwest::Client,
    own_address: Option<String>,
}

impl RelayClient {
    /// `own_address` is advertised to peers as the `peer` field.
    pub fn new(timeout: Duration, own_address: Option<String>) -> Result<Self, RelayError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http, own_address })
    }

    /// POST one message to `peer`. Any non-success answer is an error.
    pub async fn deliver(&self, peer: &str, cid: &str, message: &Message) -> Result<(), RelayError> {
        let url = format!("{}{}", peer_base_url(peer), RELAY_MESSAGE_PATH);
        let body = RelayRequest {
            cid: cid.to_string(),
            msg: message.clone(),
            peer: self.own_address.clone(),
        };

        debug!(url = %url, cid, "Relaying message");
        let response = self.http.post(&url).json(&body).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RelayError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

/// Peers may be stored as a bare host (the remote IP of an inbound call);
/// those are reached over plain HTTP.
fn peer_base_url(peer: &str) -> String {
    let peer = peer.trim().trim_end_matches('/');
    if peer.contains("://") {
        peer.to_string()
    } else {
        format!("http://{peer}")
    }
}

/// Send message `mid` of conversation `cid` to the conversation's peer.
///
/// Only `draft` or `queued` messages are sent. Every status change is
/// persisted and announced to connected sessions. No retry: a failed send
/// leaves the message in `error` and the caller may trigger it again.
pub async fn send_message(state: &AppState, cid: &str, mid: &str) -> Result<Message, ServerError> {
    let sending = state
        .store
        .update_message(cid, mid, |m| {
            if !m.status.is_sendable() {
                return false;
            }
            m.status = MessageStatus::Sending;
            true
        })
        .await
        .ok_or_else(|| {
            ServerError::BadRequest(format!("Message {cid}/{mid} does not exist or is not sendable"))
        })?;

    let Some(conversation) = state.store.load_conversation(cid).await else {
        return Err(ServerError::NotFound(format!("conversation {cid}")));
    };
    state.bus.conversation_updated(&conversation);
    state.bus.message_updated(cid, &sending);

    let outcome = state.relay.deliver(&conversation.peer, cid, &sending).await;
    let status = match &outcome {
        Ok(()) => MessageStatus::Ok,
        Err(e) => {
            warn!(cid, mid, peer = %conversation.peer, error = %e, "Unable to send message");
            MessageStatus::Error
        }
    };

    let settled = state
        .store
        .update_message(cid, mid, |m| {
            m.status = status;
            true
        })
        .await;

    if let Some(conversation) = state.store.load_conversation(cid).await {
        state.bus.conversation_updated(&conversation);
    }
    if let Some(message) = &settled {
        state.bus.message_updated(cid, message);
    }

    outcome?;
    info!(cid, mid, "Message delivered");
    settled.ok_or_else(|| ServerError::NotFound(format!("message {cid}/{mid}")))
}

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

/// Handle the body of an inbound `POST /api/v0/message`.
///
/// Returns the conversation id. `origin` is the caller's address, used as the
/// peer of a new conversation when the payload does not name one.
pub async fn receive(state: &AppState, body: &[u8], origin: Option<IpAddr>) -> Result<String, ServerError> {
    if body.is_empty() {
        return Err(ServerError::BadRequest("Missing JSON.".to_string()));
    }
    let request: RelayRequest = serde_json::from_slice(body)
        .map_err(|e| ServerError::BadRequest(format!("Invalid JSON: {e}")))?;
    let cid = request.cid.clone();

    let peer = request
        .peer
        .clone()
        .or_else(|| origin.map(|ip| ip.to_string()))
        .unwrap_or_default();
    let (_, created) = state
        .store
        .ensure_conversation(&cid, || {
            Conversation::with_id(cid.clone(), peer, DEFAULT_CONVERSATION_NAME)
        })
        .await
        .map_err(|e| ServerError::BadRequest(format!("Error processing request: {e}")))?;

    if created {
        info!(cid = %cid, "Peer opened a new conversation");
    }

    match accept(state, &request).await {
        Ok(()) => Ok(cid),
        Err(e) => {
            if created {
                // Best effort: do not leave an empty conversation behind.
                if let Err(rollback) = state.store.delete_conversation(&cid).await {
                    warn!(cid = %cid, error = %rollback, "Rollback of new conversation failed");
                }
            }
            Err(e)
        }
    }
}

async fn accept(state: &AppState, request: &RelayRequest) -> Result<(), ServerError> {
    let cid = request.cid.as_str();
    let failed = |what: &str| ServerError::BadRequest(format!("Error processing request: {what}"));

    state
        .store
        .update_conversation(cid, |c| {
            if let Some(peer) = &request.peer {
                c.peer = peer.clone();
            }
            c.unread_messages = true;
        })
        .await
        .ok_or_else(|| failed("unable to update conversation"))?;

    let message = Message {
        id: None,
        is_mine: false,
        status: MessageStatus::Ok,
        ..request.msg.clone()
    };
    let mid = state
        .store
        .post_message(cid, message)
        .await
        .ok_or_else(|| failed("unable to store message"))?;

    let stored = state
        .store
        .load_message(cid, &mid)
        .await
        .ok_or_else(|| failed("stored message vanished"))?;
    let conversation = state
        .store
        .load_conversation(cid)
        .await
        .ok_or_else(|| failed("conversation vanished"))?;

    state.bus.conversation_updated(&conversation);
    state.bus.message_updated(cid, &stored);

    debug!(cid, mid = %mid, "Accepted relayed message");
    Ok(())
}

#[cfg(test)]
mod tests {
    use peerchat_shared::constants::{EVENT_UPDATE_CONVERSATION, EVENT_UPDATE_MESSAGE};

    use super::*;
    use crate::testing::{spawn_node, test_state};

    #[test]
    fn test_peer_base_url() {
        assert_eq!(peer_base_url("10.0.0.7"), "http://10.0.0.7");
        assert_eq!(peer_base_url("http://host:27182/"), "http://host:27182");
        assert_eq!(peer_base_url("https://chat.example"), "https://chat.example");
    }

    #[tokio::test]
    async fn test_receive_creates_unknown_conversation() {
        let (state, _dir) = test_state().await;
        let mut events = state.bus.subscribe();

        let cid = receive(
            &state,
            br#"{"cid":"c1","msg":{"body":"hi","id":"99","isMine":true,"status":"draft"}}"#,
            Some([10, 0, 0, 9].into()),
        )
        .await
        .unwrap();
        assert_eq!(cid, "c1");

        let c = state.store.load_conversation("c1").await.unwrap();
        assert_eq!(c.length, 1);
        assert_eq!(c.peer, "10.0.0.9");
        assert_eq!(c.name, DEFAULT_CONVERSATION_NAME);
        assert!(c.unread_messages);

        let m = state.store.load_message("c1", "0").await.unwrap();
        assert_eq!(m.body.as_deref(), Some("hi"));
        assert_eq!(m.status, MessageStatus::Ok);
        assert!(!m.is_mine);
        assert!(state.store.load_message("c1", "99").await.is_none());

        let first = events.recv().await.unwrap();
        assert_eq!(first.name, EVENT_UPDATE_CONVERSATION);
        assert_eq!(first.payload["length"], 1);
        let second = events.recv().await.unwrap();
        assert_eq!(second.name, EVENT_UPDATE_MESSAGE);
        assert_eq!(second.payload["cid"], "c1");
        assert_eq!(second.payload["message"]["id"], "0");
    }

    #[tokio::test]
    async fn test_receive_rejects_garbage_without_side_effects() {
        let (state, _dir) = test_state().await;

        let bodies: [&[u8]; 4] = [b"", b"not json", br#"{"msg":{"body":"x"}}"#, br#"{"cid":"c1"}"#];
        for body in bodies {
            let err = receive(&state, body, None).await.unwrap_err();
            assert!(matches!(err, ServerError::BadRequest(_)));
        }
        let err = receive(&state, br#"{"cid":"../etc","msg":{}}"#, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::BadRequest(_)));

        assert!(state.store.list_conversations().await.is_empty());
    }

    #[tokio::test]
    async fn test_receive_leaves_corrupt_conversation_alone() {
        let (state, _dir) = test_state().await;
        let dir = state.store.root().join("c1");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("index.json"), "{broken").unwrap();
        std::fs::write(dir.join("0.json"), r#"{"body":"old"}"#).unwrap();

        let err = receive(&state, br#"{"cid":"c1","msg":{"body":"new"}}"#, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::BadRequest(_)));

        assert_eq!(std::fs::read_to_string(dir.join("index.json")).unwrap(), "{broken");
        assert!(dir.join("0.json").exists());
    }

    #[tokio::test]
    async fn test_send_to_unreachable_peer_marks_error() {
        let (state, _dir) = test_state().await;
        let c = state
            .store
            .create_conversation(Conversation::new("http://127.0.0.1:1", "nobody home"))
            .await
            .unwrap();
        let mid = state.store.post_message(&c.id, Message::draft("hello?")).await.unwrap();
        let mut updates = state.bus.subscribe_to(&[EVENT_UPDATE_MESSAGE]);

        let result = send_message(&state, &c.id, &mid).await;
        assert!(matches!(result, Err(ServerError::Relay(_))));

        let m = state.store.load_message(&c.id, &mid).await.unwrap();
        assert_eq!(m.status, MessageStatus::Error);
        assert_eq!(state.store.load_conversation(&c.id).await.unwrap().length, 1);

        let sending = updates.recv().await.unwrap();
        assert_eq!(sending.payload["message"]["status"], "sending");
        let failed = updates.recv().await.unwrap();
        assert_eq!(failed.payload["message"]["status"], "error");
    }

    #[tokio::test]
    async fn test_send_refuses_non_draft() {
        let (state, _dir) = test_state().await;
        let c = state
            .store
            .create_conversation(Conversation::new("http://127.0.0.1:1", "x"))
            .await
            .unwrap();
        let mid = state
            .store
            .post_message(&c.id, Message::draft("done").with_status(MessageStatus::Ok))
            .await
            .unwrap();

        assert!(matches!(
            send_message(&state, &c.id, &mid).await,
            Err(ServerError::BadRequest(_))
        ));
        assert!(matches!(
            send_message(&state, &c.id, "404").await,
            Err(ServerError::BadRequest(_))
        ));
        assert_eq!(
            state.store.load_message(&c.id, &mid).await.unwrap().status,
            MessageStatus::Ok
        );
    }

    #[tokio::test]
    async fn test_two_nodes_exchange_a_message() {
        let (bob, bob_addr, _bob_dir) = spawn_node(None).await;
        let (alice, _alice_addr, _alice_dir) =
            spawn_node(Some("http://alice.example:27182".to_string())).await;

        let c = alice
            .store
            .create_conversation(Conversation::new(format!("http://{bob_addr}"), "to bob"))
            .await
            .unwrap();
        let mid = alice
            .store
            .post_message(&c.id, Message::draft("hi bob"))
            .await
            .unwrap();

        let sent = send_message(&alice, &c.id, &mid).await.unwrap();
        assert_eq!(sent.status, MessageStatus::Ok);
        assert_eq!(
            alice.store.load_message(&c.id, &mid).await.unwrap().status,
            MessageStatus::Ok
        );

        let at_bob = bob.store.load_conversation(&c.id).await.unwrap();
        assert_eq!(at_bob.peer, "http://alice.example:27182");
        assert_eq!(at_bob.length, 1);
        let m = bob.store.load_message(&c.id, "0").await.unwrap();
        assert_eq!(m.body.as_deref(), Some("hi bob"));
        assert_eq!(m.status, MessageStatus::Ok);
        assert!(!m.is_mine);
    }
}
