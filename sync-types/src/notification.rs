//! Notification messages published on plain pub/sub channels.
//!
//! A notification carries an operation, a data string and a list of
//! field/value pairs. On the wire it is a flat JSON array of strings:
//! `[op, data, field1, value1, field2, value2, ...]`.

use serde::{Deserialize, Serialize};

use crate::{FieldValue, SyncError};

/// A single notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationMessage {
    /// Operation name chosen by the producer (free form)
    pub op: String,
    /// Operation payload
    pub data: String,
    /// Additional attributes, in order
    pub values: Vec<FieldValue>,
}

impl NotificationMessage {
    /// Create a new notification.
    pub fn new(op: impl Into<String>, data: impl Into<String>, values: Vec<FieldValue>) -> Self {
        Self {
            op: op.into(),
            data: data.into(),
            values,
        }
    }

    /// Encode as a flat JSON array.
    pub fn to_json(&self) -> Result<String, SyncError> {
        let mut flat = Vec::with_capacity(2 + self.values.len() * 2);
        flat.push(self.op.as_str());
        flat.push(self.data.as_str());
        for fv in &self.values {
            flat.push(fv.field.as_str());
            flat.push(fv.value.as_str());
        }
        Ok(serde_json::to_string(&flat)?)
    }

    /// Decode from a flat JSON array.
    pub fn from_json(s: &str) -> Result<Self, SyncError> {
        let flat: Vec<String> = serde_json::from_str(s)?;
        if flat.len() < 2 || flat.len() % 2 != 0 {
            return Err(SyncError::InvalidArgument(format!(
                "notification has {} elements, expected an even count of at least 2",
                flat.len()
            )));
        }
        let mut items = flat.into_iter();
        let op = items.next().unwrap_or_default();
        let data = items.next().unwrap_or_default();
        let mut values = Vec::new();
        while let (Some(field), Some(value)) = (items.next(), items.next()) {
            values.push(FieldValue { field, value });
        }
        Ok(Self { op, data, values })
    }
}
