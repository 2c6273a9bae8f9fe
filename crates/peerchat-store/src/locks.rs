//! Per-conversation lock registry.
//!
//! Locks are created on first reference and live for the lifetime of the
//! process. Creation goes through `DashMap::entry`, which is an atomic
//! get-or-insert: two tasks racing on a brand-new id always end up sharing
//! the same lock.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Proof that the caller holds the lock of one conversation.
pub type ConversationGuard = OwnedMutexGuard<()>;

#[derive(Debug, Default)]
pub struct LockRegistry {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The lock of `cid`, created if this is the first reference.
    pub fn lock_for(&self, cid: &str) -> Arc<Mutex<()>> {
        if let Some(lock) = self.locks.get(cid) {
            return Arc::clone(lock.value());
        }
        Arc::clone(self.locks.entry(cid.to_string()).or_default().value())
    }

    /// Wait for exclusive access to `cid`.
    pub async fn acquire(&self, cid: &str) -> ConversationGuard {
        self.lock_for(cid).lock_owned().await
    }
}
