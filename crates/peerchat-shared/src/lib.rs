//! # peerchat-shared
//!
//! Values and wire formats shared by every peerChat crate: the conversation
//! and message data model, the node-to-node relay payload, the real-time
//! session frames, and the event/command names both sides agree on.

pub mod constants;
pub mod error;
pub mod protocol;
pub mod types;

pub use error::ProtocolError;
pub use types::{Conversation, Message, MessageStatus};
