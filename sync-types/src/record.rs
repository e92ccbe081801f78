//! Field/value pairs, key operations and change events.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::SyncError;

/// A single field of a row.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FieldValue {
    /// Field name
    pub field: String,
    /// Field value
    pub value: String,
}

impl FieldValue {
    /// Create a new field/value pair.
    pub fn new(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
        }
    }
}

impl<F: Into<String>, V: Into<String>> From<(F, V)> for FieldValue {
    fn from((field, value): (F, V)) -> Self {
        Self::new(field, value)
    }
}

/// Collect any iterator of pairs into an ordered field list.
///
/// Duplicate field names are kept in arrival order.
pub fn field_values<I, F, V>(fvs: I) -> Vec<FieldValue>
where
    I: IntoIterator<Item = (F, V)>,
    F: Into<String>,
    V: Into<String>,
{
    fvs.into_iter().map(FieldValue::from).collect()
}

/// The operation carried by a change event.
///
/// On the wire this is the string `"SET"` or `"DEL"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum KeyOperation {
    /// Upsert of the listed fields
    Set,
    /// Removal of the whole row
    Del,
}

impl KeyOperation {
    /// Wire form of the operation.
    pub fn as_str(self) -> &'static str {
        match self {
            KeyOperation::Set => "SET",
            KeyOperation::Del => "DEL",
        }
    }
}

impl fmt::Display for KeyOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyOperation {
    type Err = SyncError;

    /// Parse `"SET"` or `"DEL"` (case insensitive).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("SET") {
            Ok(KeyOperation::Set)
        } else if s.eq_ignore_ascii_case("DEL") {
            Ok(KeyOperation::Del)
        } else {
            Err(SyncError::InvalidOperation(s.to_string()))
        }
    }
}

/// A change event: `(key, operation, fields)`.
///
/// Immutable once published; delivered verbatim to consumers.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct KeyOpFieldsValues {
    /// Row key (without table prefix)
    pub key: String,
    /// SET or DEL
    pub operation: KeyOperation,
    /// Fields in publish order (empty for DEL)
    pub fields: Vec<FieldValue>,
}

impl KeyOpFieldsValues {
    /// A SET event for `key`.
    pub fn set(key: impl Into<String>, fields: Vec<FieldValue>) -> Self {
        Self {
            key: key.into(),
            operation: KeyOperation::Set,
            fields,
        }
    }

    /// A DEL event for `key`.
    pub fn del(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            operation: KeyOperation::Del,
            fields: Vec::new(),
        }
    }

    /// Look up the last value written for `field` in this event.
    pub fn value_of(&self, field: &str) -> Option<&str> {
        self.fields
            .iter()
            .rev()
            .find(|fv| fv.field == field)
            .map(|fv| fv.value.as_str())
    }
}
