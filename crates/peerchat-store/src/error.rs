use thiserror::Error;

/// Errors produced by the store layer.
///
/// Missing conversations and messages are not errors at the public
/// boundary; they surface as `None`.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Generic I/O error while reading or writing the working directory.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Persisted JSON could not be encoded or decoded.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// An id that cannot be used as a file or directory name.
    #[error("Invalid id: {0:?}")]
    InvalidId(String),

    /// The conversation an operation refers to does not exist.
    #[error("Conversation not found: {0}")]
    NotFound(String),

    /// Persisted data contradicts its location on disk.
    #[error("Corrupt data: {0}")]
    Corrupt(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;
