//! Conversation and message values shared by the store, the relay protocol
//! and the real-time session layer.
//!
//! These are plain data: every state transition goes through the store.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::DEFAULT_CONVERSATION_NAME;

// ---------------------------------------------------------------------------
// MessageStatus
// ---------------------------------------------------------------------------

/// Delivery state of a message.
///
/// Outbound messages move `draft/queued -> sending -> ok | error`; inbound
/// messages are stored as `ok`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    #[default]
    Draft,
    Queued,
    Sending,
    Ok,
    Deleted,
    Error,
}

impl MessageStatus {
    /// Whether a send may be started from this state.
    pub fn is_sendable(self) -> bool {
        matches!(self, MessageStatus::Draft | MessageStatus::Queued)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MessageStatus::Draft => "draft",
            MessageStatus::Queued => "queued",
            MessageStatus::Sending => "sending",
            MessageStatus::Ok => "ok",
            MessageStatus::Deleted => "deleted",
            MessageStatus::Error => "error",
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A single chat message.
///
/// `id` is `None` until the store assigns one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub status: MessageStatus,
    /// `true` when this node composed the message.
    #[serde(default)]
    pub is_mine: bool,
    #[serde(default = "Utc::now")]
    pub last_modified: DateTime<Utc>,
}

impl Message {
    /// A new, locally composed draft without an id.
    pub fn draft(body: impl Into<String>) -> Self {
        Self {
            id: None,
            body: Some(body.into()),
            status: MessageStatus::Draft,
            is_mine: true,
            last_modified: Utc::now(),
        }
    }

    pub fn with_status(mut self, status: MessageStatus) -> Self {
        self.status = status;
        self
    }
}

// ---------------------------------------------------------------------------
// Conversation
// ---------------------------------------------------------------------------

/// A thread of messages with exactly one peer.
///
/// Only the metadata is serialized into `index.json`; `messages` is a lazily
/// filled cache and `path` is set once by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub peer: String,
    #[serde(default = "default_conversation_name")]
    pub name: String,
    /// Number of messages ever appended. Never decremented.
    #[serde(default)]
    pub length: u64,
    #[serde(default = "Utc::now")]
    pub last_modified: DateTime<Utc>,
    #[serde(default)]
    pub unread_messages: bool,
    #[serde(skip)]
    pub messages: HashMap<String, Message>,
    #[serde(skip)]
    pub path: Option<PathBuf>,
}

fn default_conversation_name() -> String {
    DEFAULT_CONVERSATION_NAME.to_string()
}

impl Conversation {
    /// Start a new conversation with a freshly generated id.
    pub fn new(peer: impl Into<String>, name: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), peer, name)
    }

    /// Conversation whose id is dictated by someone else (the remote peer).
    pub fn with_id(id: impl Into<String>, peer: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            peer: peer.into(),
            name: name.into(),
            length: 0,
            last_modified: Utc::now(),
            unread_messages: false,
            messages: HashMap::new(),
            path: None,
        }
    }

    /// Copy of the metadata without the cached messages.
    pub fn snapshot(&self) -> Self {
        Self {
            messages: HashMap::new(),
            ..self.clone()
        }
    }
}
