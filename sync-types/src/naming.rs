//! Store key naming conventions.
//!
//! Application rows live at `<table><separator><key>`. Bookkeeping used by
//! producer/consumer tables lives in shadow keys prefixed with `_` so it never
//! collides with application rows.

use crate::SyncError;

/// Default separator between table name and row key.
pub const DEFAULT_SEPARATOR: &str = ":";

/// Separator used by configuration-style databases.
pub const CONFIG_SEPARATOR: &str = "|";

/// Payload published on a producer channel after each write.
pub const PRODUCER_SIGNAL: &str = "G";

/// Table name plus separator, with the derived store key names.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableName {
    name: String,
    separator: String,
}

impl TableName {
    /// Validate and build a table name.
    ///
    /// The name must be non-empty and must not contain the separator.
    pub fn new(name: impl Into<String>, separator: impl Into<String>) -> Result<Self, SyncError> {
        let name = name.into();
        let separator = separator.into();
        if name.is_empty() {
            return Err(SyncError::InvalidArgument("table name is empty".into()));
        }
        if separator.is_empty() {
            return Err(SyncError::InvalidArgument("table separator is empty".into()));
        }
        if name.contains(separator.as_str()) {
            return Err(SyncError::InvalidArgument(format!(
                "table name {name:?} contains separator {separator:?}"
            )));
        }
        Ok(Self { name, separator })
    }

    /// The bare table name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The separator between table name and row key.
    pub fn separator(&self) -> &str {
        &self.separator
    }

    /// Store key of a row: `<table><sep><key>`.
    pub fn row_key(&self, key: &str) -> String {
        format!("{}{}{}", self.name, self.separator, key)
    }

    /// Prefix shared by every row key of this table.
    pub fn row_prefix(&self) -> String {
        format!("{}{}", self.name, self.separator)
    }

    /// Strip the table prefix from a store key, if it belongs to this table.
    pub fn strip_row_key<'a>(&self, store_key: &'a str) -> Option<&'a str> {
        store_key
            .strip_prefix(self.name.as_str())?
            .strip_prefix(self.separator.as_str())
    }

    /// Channel a producer signals on: `<table>_CHANNEL@<db>`.
    pub fn channel(&self, db_id: u32) -> String {
        format!("{}_CHANNEL@{}", self.name, db_id)
    }

    /// Shadow list holding queued change records.
    pub fn event_queue(&self) -> String {
        format!("_{}_EVENTS", self.name)
    }

    /// Shadow hash holding producer counters.
    pub fn stats_key(&self) -> String {
        format!("_{}_STATS", self.name)
    }

    /// Glob pattern matching every row key of this table.
    pub fn row_pattern(&self) -> String {
        format!("{}*", glob_escape(&self.row_prefix()))
    }

    /// Keyspace pattern matching every row of this table in `db_id`.
    pub fn keyspace_pattern(&self, db_id: u32) -> String {
        keyspace_channel(db_id, &self.row_pattern())
    }
}

/// Escape glob metacharacters so `s` matches only itself.
pub fn glob_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Keyspace notification channel for a store key.
pub fn keyspace_channel(db_id: u32, store_key: &str) -> String {
    format!("__keyspace@{db_id}__:{store_key}")
}

/// Key-event notification channel for a command event.
pub fn keyevent_channel(db_id: u32, event: &str) -> String {
    format!("__keyevent@{db_id}__:{event}")
}

/// Split a keyspace channel into `(db_id, store_key)`.
pub fn parse_keyspace_channel(channel: &str) -> Option<(u32, &str)> {
    let rest = channel.strip_prefix("__keyspace@")?;
    let (db, key) = rest.split_once("__:")?;
    Some((db.parse().ok()?, key))
}

/// Reject empty row keys and field names.
pub fn validate_key(key: &str) -> Result<(), SyncError> {
    if key.is_empty() {
        return Err(SyncError::InvalidArgument("row key is empty".into()));
    }
    Ok(())
}
