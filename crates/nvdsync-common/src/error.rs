//! Error types for nvdsync
//!
//! The taxonomy follows the sync engine's boundaries: [`TransportError`] for
//! remote feed access, [`DecodeError`] for malformed feed payloads and
//! [`WriteError`] for document store failures. [`SyncError`] is what the engine
//! itself returns.

use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Failure while checking or fetching a remote feed
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Request to {url} failed: {message}")]
    Request { url: String, message: String },

    #[error("Unexpected HTTP status {status} from {url}")]
    Status { url: String, status: u16 },

    #[error("No Last-Modified header returned by {url}")]
    MissingLastModified { url: String },

    #[error("Cannot parse Last-Modified value '{value}' from {url}")]
    InvalidLastModified { url: String, value: String },

    #[error("Unsupported feed URL: {0}")]
    UnsupportedUrl(String),

    #[error("IO error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Failure while turning raw feed bytes into records
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Malformed XML: {0}")]
    Xml(String),

    #[error("Unexpected root element <{0}>")]
    UnexpectedRoot(String),

    #[error("Entry #{position} has no identifier")]
    MissingId { position: usize },

    #[error("Feed ended before the document was complete")]
    Truncated,

    #[error("Failed to decompress feed: {0}")]
    Decompress(#[from] std::io::Error),
}

/// Failure reported by a document store
#[derive(Error, Debug)]
pub enum WriteError {
    /// Benign at startup: the collection is already there.
    #[error("Collection already exists: {0}")]
    CollectionExists(String),

    #[error("Store request failed: {0}")]
    Transport(String),

    #[error("Store rejected the request (status {status}): {reason}")]
    Rejected { status: u16, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl WriteError {
    /// Whether this error only says the collection already exists
    pub fn is_collection_exists(&self) -> bool {
        matches!(self, WriteError::CollectionExists(_))
    }
}

/// Main error type for the sync engine
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Write error: {0}")]
    Write(#[from] WriteError),

    #[error("Bulk pipeline is closed")]
    PipelineClosed,

    #[error("Engine is already running")]
    AlreadyRunning,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_converts_into_sync_error() {
        let err: SyncError = TransportError::MissingLastModified {
            url: "http://feeds.example/nvd.xml".to_string(),
        }
        .into();

        assert!(matches!(err, SyncError::Transport(_)));
        assert_eq!(
            err.to_string(),
            "Transport error: No Last-Modified header returned by http://feeds.example/nvd.xml"
        );
    }

    #[test]
    fn test_collection_exists_is_benign() {
        assert!(WriteError::CollectionExists("nvd".to_string()).is_collection_exists());
        assert!(!WriteError::Transport("connection refused".to_string()).is_collection_exists());
    }
}
