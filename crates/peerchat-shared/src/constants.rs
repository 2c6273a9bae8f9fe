/// Name announced by `GET /who`
pub const API_NAME: &str = "peerChatAPI";

/// Path prefix of the v0 API
pub const API_V0_PREFIX: &str = "/api/v0";

/// Relay endpoint, relative to a peer's base address
pub const RELAY_MESSAGE_PATH: &str = "/api/v0/message";

/// Name given to conversations that a peer opened with us
pub const DEFAULT_CONVERSATION_NAME: &str = "New Conversation";

/// Display name used when none is configured
pub const DEFAULT_USER_NAME: &str = "Anonymous";

/// Cookie carrying the local session key
pub const AUTH_COOKIE: &str = "peerChatAuth";

/// Default HTTP port of a node
pub const DEFAULT_HTTP_PORT: u16 = 27182;

/// Outbound relay timeout in seconds
pub const RELAY_TIMEOUT_SECS: u64 = 2;

/// Conversation metadata file inside a conversation directory
pub const INDEX_FILE: &str = "index.json";

// Real-time events pushed to sessions
pub const EVENT_UPDATE_CONVERSATION: &str = "update-conversation";
pub const EVENT_UPDATE_MESSAGE: &str = "update-message";
pub const EVENT_NEW_CONVERSATION: &str = "new-conversation";
