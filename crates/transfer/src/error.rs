//! Error types for the transfer engine.

use crate::client::RemoteError;

/// Errors produced by the transfer engine.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("source object not found: {0}")]
    SourceNotFound(String),

    #[error("source object changed since checkpoint: {0}")]
    IdentityMismatch(String),

    #[error("restartable checkpoint is corrupted: {0}")]
    CorruptedCheckpoint(String),

    #[error("source object type is unknown: {0}")]
    UnknownObjectType(String),

    #[error("remote error: {0}")]
    Remote(String),

    /// A write-side call on the destination failed.
    #[error("destination {path}: {message}")]
    Destination { path: String, message: String },

    #[error("short read at offset {offset}: expected {expected} bytes, got {actual}")]
    ShortRead {
        offset: u64,
        expected: usize,
        actual: usize,
    },

    #[error("cancelled")]
    Cancelled,

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("unsupported location: {0}")]
    UnsupportedLocation(String),

    #[error("failed to enumerate {path}: {message}")]
    Enumeration { path: String, message: String },

    #[error("failed to create destination root {path}: {message}")]
    DestinationRoot { path: String, message: String },
}

impl TransferError {
    /// Whether a caller may retry the failed unit of work.
    ///
    /// Unretired offsets stay in the checkpoint, so a retry replays them.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransferError::Io(_)
                | TransferError::Remote(_)
                | TransferError::Destination { .. }
                | TransferError::ShortRead { .. }
        )
    }
}

/// Source-side conversion. Destination calls map through
/// [`TransferError::Destination`] instead.
impl From<RemoteError> for TransferError {
    fn from(e: RemoteError) -> Self {
        match e {
            RemoteError::NotFound(path) => TransferError::SourceNotFound(path),
            RemoteError::PreconditionFailed(msg) => TransferError::IdentityMismatch(msg),
            other => TransferError::Remote(other.to_string()),
        }
    }
}
