//! Change record - the wire format wrapper for queued change events.

use serde::{Deserialize, Serialize};

use crate::{KeyOpFieldsValues, SyncError};

/// Current change record format version.
pub const RECORD_VERSION: u8 = 1;

/// The record a producer appends to a table's event queue.
///
/// Wraps a [`KeyOpFieldsValues`] with the producer-assigned sequence number
/// and the table it belongs to. Encoded as MessagePack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Record format version (currently 1)
    pub version: u8,
    /// Per-table sequence number assigned when the record was written
    pub sequence: u64,
    /// Name of the table the event targets
    pub table: String,
    /// The change event itself
    pub event: KeyOpFieldsValues,
}

impl ChangeRecord {
    /// Create a record for sending.
    pub fn new(table: impl Into<String>, sequence: u64, event: KeyOpFieldsValues) -> Self {
        Self {
            version: RECORD_VERSION,
            sequence,
            table: table.into(),
            event,
        }
    }

    /// Serialize to MessagePack bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, SyncError> {
        rmp_serde::to_vec(self).map_err(SyncError::Serialization)
    }

    /// Deserialize from MessagePack bytes.
    ///
    /// Records written by a newer format version are rejected.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SyncError> {
        let record: Self = rmp_serde::from_slice(bytes).map_err(SyncError::Deserialization)?;
        if record.version > RECORD_VERSION {
            return Err(SyncError::InvalidArgument(format!(
                "unsupported change record version {}",
                record.version
            )));
        }
        Ok(record)
    }
}
