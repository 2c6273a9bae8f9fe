//! Disk-backed conversation store.
//!
//! Layout under the working directory:
//!
//! ```text
//! <root>/<conversation-id>/index.json      conversation metadata
//! <root>/<conversation-id>/<message-id>.json
//! ```
//!
//! The [`Store`] keeps every conversation it has touched in an in-memory
//! cache (no eviction) and serializes all load-mutate-persist sequences of a
//! conversation through that conversation's lock. Missing data is reported
//! as `None`; hard failures are logged and reported the same way so that one
//! broken conversation never takes down the rest of the node.

use std::path::{Component, Path, PathBuf};

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use tokio::fs;
use tracing::{debug, error, info, warn};

use peerchat_shared::constants::INDEX_FILE;
use peerchat_shared::types::{Conversation, Message};

use crate::error::{Result, StoreError};
use crate::locks::{ConversationGuard, LockRegistry};

#[derive(Debug)]
pub struct Store {
    root: PathBuf,
    cache: DashMap<String, Conversation>,
    locks: LockRegistry,
}

impl Store {
    /// Open the store rooted at `root`, creating the directory if missing.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;

        info!(path = %root.display(), "Conversation store initialized");

        Ok(Self {
            root,
            cache: DashMap::new(),
            locks: LockRegistry::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn locks(&self) -> &LockRegistry {
        &self.locks
    }

    // -----------------------------------------------------------------------
    // Conversations
    // -----------------------------------------------------------------------

    /// Cached conversation, or the one persisted under `<cid>/index.json`.
    pub async fn load_conversation(&self, cid: &str) -> Option<Conversation> {
        let guard = self.locks.acquire(cid).await;
        match self.read_conversation(cid, &guard).await {
            Ok(found) => found,
            Err(e) => {
                error!(cid, error = %e, "Failed to load conversation");
                None
            }
        }
    }

    /// Create `conversation` on disk and in the cache.
    ///
    /// A second call for the same id overwrites the first (last write wins).
    pub async fn create_conversation(&self, conversation: Conversation) -> Result<Conversation> {
        let guard = self.locks.acquire(&conversation.id).await;
        self.create_locked(conversation, &guard).await
    }

    /// Load `cid`, or create it from `make` if it does not exist yet.
    ///
    /// Returns the conversation and whether this call created it. Both steps
    /// happen under one lock acquisition, so concurrent callers for a new id
    /// create it exactly once.
    pub async fn ensure_conversation<F>(&self, cid: &str, make: F) -> Result<(Conversation, bool)>
    where
        F: FnOnce() -> Conversation,
    {
        let guard = self.locks.acquire(cid).await;
        if let Some(existing) = self.read_conversation(cid, &guard).await? {
            return Ok((existing, false));
        }

        let mut fresh = make();
        if fresh.id != cid {
            return Err(StoreError::Corrupt(format!(
                "new conversation id {:?} does not match {:?}",
                fresh.id, cid
            )));
        }
        fresh.path = None;
        let created = self.create_locked(fresh, &guard).await?;
        Ok((created, true))
    }

    /// Apply `mutate` to the conversation metadata and persist the index.
    pub async fn update_conversation<F>(&self, cid: &str, mutate: F) -> Option<Conversation>
    where
        F: FnOnce(&mut Conversation),
    {
        let guard = self.locks.acquire(cid).await;
        let result = async {
            let Some(mut conversation) = self.read_conversation(cid, &guard).await? else {
                return Ok(None);
            };
            let id = conversation.id.clone();
            let path = conversation.path.clone();
            mutate(&mut conversation);
            // Neither the id nor the on-disk location may change.
            conversation.id = id;
            conversation.path = path;
            conversation.last_modified = Utc::now();

            self.write_index(&conversation).await?;
            self.cache.insert(cid.to_string(), conversation.clone());
            Ok::<_, StoreError>(Some(conversation))
        }
        .await;

        match result {
            Ok(updated) => updated,
            Err(e) => {
                error!(cid, error = %e, "Failed to update conversation");
                None
            }
        }
    }

    /// Remove the conversation directory and its cache entry.
    pub async fn delete_conversation(&self, cid: &str) -> Result<()> {
        let _guard = self.locks.acquire(cid).await;
        let dir = self.conversation_dir(cid)?;

        self.cache.remove(cid);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        info!(cid, "Deleted conversation");
        Ok(())
    }

    /// Ids of all conversations currently on disk.
    ///
    /// Scans the working directory without consulting the cache or taking any
    /// lock, so a concurrent create or delete may or may not be reflected.
    pub async fn list_conversations(&self) -> Vec<String> {
        match self.scan_conversations().await {
            Ok(ids) => ids,
            Err(e) => {
                error!(error = %e, "Failed to list conversations");
                Vec::new()
            }
        }
    }

    // -----------------------------------------------------------------------
    // Messages
    // -----------------------------------------------------------------------

    /// Message `mid` of conversation `cid`.
    pub async fn load_message(&self, cid: &str, mid: &str) -> Option<Message> {
        let guard = self.locks.acquire(cid).await;
        let result = async {
            let Some(conversation) = self.read_conversation(cid, &guard).await? else {
                return Ok(None);
            };
            self.read_message(&conversation, mid, &guard).await
        }
        .await;

        match result {
            Ok(found) => found,
            Err(e) => {
                error!(cid, mid, error = %e, "Failed to load message");
                None
            }
        }
    }

    /// Append (or replace) a message and return its id.
    ///
    /// A message without id gets the decimal string of the conversation's
    /// current length, or the next one after it that is still free. Returns `None` if the conversation does not exist or
    /// the write fails.
    pub async fn post_message(&self, cid: &str, message: Message) -> Option<String> {
        let guard = self.locks.acquire(cid).await;
        let result = async {
            let Some(conversation) = self.read_conversation(cid, &guard).await? else {
                return Err(StoreError::NotFound(cid.to_string()));
            };
            self.post_locked(conversation, message, &guard).await
        }
        .await;

        match result {
            Ok(mid) => Some(mid),
            Err(StoreError::NotFound(_)) => {
                warn!(cid, "Cannot post to unknown conversation");
                None
            }
            Err(e) => {
                error!(cid, error = %e, "Failed to post message");
                None
            }
        }
    }

    /// Load a message and let `mutate` change it in place.
    ///
    /// `mutate` returns `false` to leave the message untouched, in which case
    /// nothing is written and `None` is returned. Load, check and write happen
    /// under one lock acquisition.
    pub async fn update_message<F>(&self, cid: &str, mid: &str, mutate: F) -> Option<Message>
    where
        F: FnOnce(&mut Message) -> bool,
    {
        let guard = self.locks.acquire(cid).await;
        let result = async {
            let Some(conversation) = self.read_conversation(cid, &guard).await? else {
                return Ok(None);
            };
            let Some(mut message) = self.read_message(&conversation, mid, &guard).await? else {
                return Ok(None);
            };
            if !mutate(&mut message) {
                return Ok(None);
            }
            message.id = Some(mid.to_string());

            self.post_locked(conversation, message, &guard).await?;
            self.read_message_cached(cid, mid)
                .map(Some)
                .ok_or_else(|| StoreError::Corrupt(format!("message {cid}/{mid} vanished")))
        }
        .await;

        match result {
            Ok(updated) => updated,
            Err(e) => {
                error!(cid, mid, error = %e, "Failed to update message");
                None
            }
        }
    }

    // -----------------------------------------------------------------------
    // Lock-holding helpers
    // -----------------------------------------------------------------------

    async fn read_conversation(
        &self,
        cid: &str,
        _guard: &ConversationGuard,
    ) -> Result<Option<Conversation>> {
        let cached = self.cache.get(cid).map(|entry| entry.value().clone());
        if cached.is_some() {
            return Ok(cached);
        }

        let dir = self.conversation_dir(cid)?;
        let Some(text) = read_optional(&dir.join(INDEX_FILE)).await? else {
            debug!(cid, "Conversation not found on disk");
            return Ok(None);
        };

        let mut conversation: Conversation = serde_json::from_str(&text)?;
        if conversation.id != cid {
            return Err(StoreError::Corrupt(format!(
                "index of {cid:?} claims id {:?}",
                conversation.id
            )));
        }
        conversation.path = Some(dir);

        self.cache.insert(cid.to_string(), conversation.clone());
        debug!(cid, length = conversation.length, "Loaded conversation from disk");
        Ok(Some(conversation))
    }

    async fn create_locked(
        &self,
        mut conversation: Conversation,
        _guard: &ConversationGuard,
    ) -> Result<Conversation> {
        let dir = self.conversation_dir(&conversation.id)?;
        // The location is fixed the first time it is set.
        let dir = conversation.path.get_or_insert(dir).clone();

        fs::create_dir_all(&dir).await?;
        self.write_index(&conversation).await?;
        self.cache
            .insert(conversation.id.clone(), conversation.clone());

        info!(cid = %conversation.id, peer = %conversation.peer, "Created conversation");
        Ok(conversation)
    }

    async fn read_message(
        &self,
        conversation: &Conversation,
        mid: &str,
        _guard: &ConversationGuard,
    ) -> Result<Option<Message>> {
        if let Some(message) = conversation.messages.get(mid) {
            return Ok(Some(message.clone()));
        }

        let path = self.message_path(conversation, mid)?;
        let Some(text) = read_optional(&path).await? else {
            debug!(cid = %conversation.id, mid, "Message not found on disk");
            return Ok(None);
        };

        let mut message: Message = serde_json::from_str(&text)?;
        message.id.get_or_insert_with(|| mid.to_string());

        if let Some(mut cached) = self.cache.get_mut(&conversation.id) {
            cached.messages.insert(mid.to_string(), message.clone());
        }
        Ok(Some(message))
    }

    fn read_message_cached(&self, cid: &str, mid: &str) -> Option<Message> {
        self.cache
            .get(cid)
            .and_then(|entry| entry.value().messages.get(mid).cloned())
    }

    async fn post_locked(
        &self,
        mut conversation: Conversation,
        mut message: Message,
        _guard: &ConversationGuard,
    ) -> Result<String> {
        let mid = match message.id.take() {
            Some(mid) => mid,
            None => self.next_free_id(&conversation).await?,
        };
        validate_id(&mid)?;

        if !self.message_exists(&conversation, &mid).await? {
            conversation.length += 1;
        }

        let now = Utc::now();
        message.id = Some(mid.clone());
        message.last_modified = now;
        conversation.last_modified = now;

        write_json(&self.message_path(&conversation, &mid)?, &message).await?;
        self.write_index(&conversation).await?;

        conversation.messages.insert(mid.clone(), message);
        self.cache.insert(conversation.id.clone(), conversation);

        Ok(mid)
    }

    async fn message_exists(&self, conversation: &Conversation, mid: &str) -> Result<bool> {
        if conversation.messages.contains_key(mid) {
            return Ok(true);
        }
        Ok(fs::try_exists(self.message_path(conversation, mid)?).await?)
    }

    /// First decimal id from `length` upwards that no message occupies yet.
    /// Explicitly posted ids may run ahead of the sequence.
    async fn next_free_id(&self, conversation: &Conversation) -> Result<String> {
        let mut candidate = conversation.length;
        loop {
            let mid = candidate.to_string();
            if !self.message_exists(conversation, &mid).await? {
                return Ok(mid);
            }
            candidate += 1;
        }
    }

    async fn write_index(&self, conversation: &Conversation) -> Result<()> {
        let dir = self.dir_of(conversation)?;
        write_json(&dir.join(INDEX_FILE), conversation).await
    }

    async fn scan_conversations(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        let mut entries = fs::read_dir(&self.root).await?;

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            if !fs::try_exists(entry.path().join(INDEX_FILE)).await? {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                ids.push(name.to_string());
            }
        }

        ids.sort();
        Ok(ids)
    }

    // -----------------------------------------------------------------------
    // Paths
    // -----------------------------------------------------------------------

    fn conversation_dir(&self, cid: &str) -> Result<PathBuf> {
        validate_id(cid)?;
        Ok(self.root.join(cid))
    }

    fn dir_of(&self, conversation: &Conversation) -> Result<PathBuf> {
        match &conversation.path {
            Some(path) => Ok(path.clone()),
            None => self.conversation_dir(&conversation.id),
        }
    }

    fn message_path(&self, conversation: &Conversation, mid: &str) -> Result<PathBuf> {
        validate_id(mid)?;
        Ok(self.dir_of(conversation)?.join(format!("{mid}.json")))
    }
}

/// Reject ids that would escape or alias the working directory.
fn validate_id(id: &str) -> Result<()> {
    let mut components = Path::new(id).components();
    let single_normal = matches!(components.next(), Some(Component::Normal(_)))
        && components.next().is_none();

    if id.is_empty()
        || !single_normal
        || id.contains('/')
        || id.contains('\\')
        || id.starts_with('.')
        || id == INDEX_FILE.trim_end_matches(".json")
    {
        return Err(StoreError::InvalidId(id.to_string()));
    }
    Ok(())
}

async fn read_optional(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path).await {
        Ok(text) => Ok(Some(text)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Write `value` next to `path` and rename it into place, so readers never
/// observe a half-written file.
async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, &bytes).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}
