//! # peerchat-store
//!
//! Durable, process-local storage of conversations and messages.
//!
//! Every conversation lives in its own directory under the working
//! directory: an `index.json` with the metadata plus one JSON file per
//! message. The [`Store`] caches whatever it has read for the lifetime of the
//! process and serializes all read-modify-write sequences on a conversation
//! through a per-conversation lock, so operations on different conversations
//! never wait for each other.

pub mod locks;
pub mod store;

mod error;

pub use error::{Result, StoreError};
pub use locks::{ConversationGuard, LockRegistry};
pub use peerchat_shared::types::{Conversation, Message, MessageStatus};
pub use store::Store;
