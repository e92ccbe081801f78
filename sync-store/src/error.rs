//! Error types for sync-store.

use sync_types::SyncError;

/// Main error type for store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// No running store behind the endpoint, or the connection was closed.
    #[error("store unavailable at {endpoint}")]
    Unavailable {
        /// The endpoint that could not be reached.
        endpoint: String,
    },

    /// Another server already serves this endpoint.
    #[error("endpoint already in use: {endpoint}")]
    AddressInUse {
        /// The contested endpoint.
        endpoint: String,
    },

    /// Logical database index out of range.
    #[error("invalid database {db_id} (server has {databases})")]
    InvalidDatabase {
        /// Requested database index.
        db_id: u32,
        /// Number of databases the server was started with.
        databases: u32,
    },

    /// Operation against a key holding the wrong kind of value.
    #[error("WRONGTYPE operation against key {key} holding the wrong kind of value")]
    WrongType {
        /// The offending key.
        key: String,
    },

    /// Counter field does not hold an integer.
    #[error("hash value is not an integer: {key} {field}")]
    NotAnInteger {
        /// Hash key.
        key: String,
        /// Hash field.
        field: String,
    },
}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable { .. } => SyncError::StoreUnavailable(err.to_string()),
            StoreError::InvalidDatabase { .. } => SyncError::InvalidArgument(err.to_string()),
            other => SyncError::Storage(other.to_string()),
        }
    }
}

/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
