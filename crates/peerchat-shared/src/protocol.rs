use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;
use crate::types::Message;

// ---------------------------------------------------------------------------
// Relay (node <-> node)
// ---------------------------------------------------------------------------

/// Body of `POST /api/v0/message`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayRequest {
    /// Conversation id, identical on both nodes.
    pub cid: String,
    pub msg: Message,
    /// Base address under which the sending node can be reached.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer: Option<String>,
}

// ---------------------------------------------------------------------------
// Real-time sessions (UI <-> node)
// ---------------------------------------------------------------------------

/// Payload of the `update-message` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageUpdate {
    pub cid: String,
    pub message: Message,
}

/// Frame sent by a session: `{"id": 1, "command": "get-message", "args": {..}}`.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionRequest {
    pub id: u64,
    pub command: String,
    #[serde(default)]
    pub args: Value,
}

/// Every command a session can issue.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "command", content = "args", rename_all = "kebab-case")]
pub enum Command {
    Ping,
    ListConversations,
    GetConversation { cid: String },
    GetMessage { cid: String, mid: String },
    PostMessage { cid: String, msg: Message },
    CreateConversation { peer: String, name: String },
    SendMessage { cid: String, mid: String },
    ChangeConversationDetails { cid: String, name: String, peer: String },
    MarkConversationRead { cid: String },
}

pub const COMMAND_NAMES: &[&str] = &[
    "ping",
    "list-conversations",
    "get-conversation",
    "get-message",
    "post-message",
    "create-conversation",
    "send-message",
    "change-conversation-details",
    "mark-conversation-read",
];

impl SessionRequest {
    /// Decode the typed command carried by this frame.
    pub fn command(&self) -> Result<Command, ProtocolError> {
        if !COMMAND_NAMES.contains(&self.command.as_str()) {
            return Err(ProtocolError::UnknownCommand(self.command.clone()));
        }

        let mut tagged = serde_json::Map::new();
        tagged.insert("command".into(), Value::String(self.command.clone()));
        // `{}` and `[]` mean "no arguments" for commands that take none.
        let empty = match &self.args {
            Value::Null => true,
            Value::Object(map) => map.is_empty(),
            Value::Array(items) => items.is_empty(),
            _ => false,
        };
        if !empty {
            tagged.insert("args".into(), self.args.clone());
        }

        serde_json::from_value(Value::Object(tagged)).map_err(|source| {
            ProtocolError::InvalidArguments {
                command: self.command.clone(),
                source,
            }
        })
    }
}

/// Frame pushed by the node to a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerFrame {
    Response {
        id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Event {
        event: String,
        data: Value,
    },
}

impl ServerFrame {
    pub fn ok(id: u64, result: Value) -> Self {
        ServerFrame::Response {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: u64, error: impl Into<String>) -> Self {
        ServerFrame::Response {
            id,
            result: None,
            error: Some(error.into()),
        }
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}
