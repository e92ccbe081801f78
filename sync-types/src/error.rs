//! Error types for statesync.

use thiserror::Error;

/// Errors that can occur in statesync table operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The store connection is down or was refused
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// Pop on a consumer or subscriber table with nothing buffered
    #[error("queue empty")]
    QueueEmpty,

    /// Malformed key, field or table name
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The multiplexer wait failed
    #[error("select failed: {0}")]
    Select(String),

    /// Store-side failure other than unavailability (e.g. wrong value type)
    #[error("storage error: {0}")]
    Storage(String),

    /// Operation string was neither `SET` nor `DEL`
    #[error("invalid key operation: {0:?}")]
    InvalidOperation(String),

    /// MessagePack serialization failed
    #[error("serialization failed: {0}")]
    Serialization(#[source] rmp_serde::encode::Error),

    /// MessagePack deserialization failed
    #[error("deserialization failed: {0}")]
    Deserialization(#[source] rmp_serde::decode::Error),

    /// JSON encoding or decoding of a notification failed
    #[error("notification encoding failed: {0}")]
    Json(#[from] serde_json::Error),
}

impl SyncError {
    /// True for the expected "nothing to pop" condition.
    pub fn is_queue_empty(&self) -> bool {
        matches!(self, SyncError::QueueEmpty)
    }
}

/// Result type alias for statesync operations.
pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = SyncError::InvalidOperation("PUT".into());
        assert_eq!(err.to_string(), "invalid key operation: \"PUT\"");
        assert_eq!(SyncError::QueueEmpty.to_string(), "queue empty");
    }

    #[test]
    fn queue_empty_is_distinguishable() {
        assert!(SyncError::QueueEmpty.is_queue_empty());
        assert!(!SyncError::StoreUnavailable("x".into()).is_queue_empty());
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<SyncError>();
    }
}
