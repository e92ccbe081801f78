//! Data held by one logical database.
//!
//! Values are strings, hashes or lists. Hashes and lists that become empty
//! are removed, so `exists` and `keys` never report hollow entries.

use std::collections::{BTreeMap, HashMap, VecDeque};

use crate::error::{Result, StoreError};
use crate::pubsub::pattern_matches;

/// A stored value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Value {
    /// Plain string value.
    Bytes(Vec<u8>),
    /// Field/value hash, ordered by field name.
    Hash(BTreeMap<String, String>),
    /// List of byte strings.
    List(VecDeque<Vec<u8>>),
}

/// Keys and values of one logical database.
#[derive(Debug, Default)]
pub(crate) struct Keyspace {
    entries: HashMap<String, Value>,
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::WrongType {
        key: key.to_string(),
    }
}

impl Keyspace {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn exists(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Keys matching a glob pattern, sorted.
    pub(crate) fn keys(&self, pattern: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .entries
            .keys()
            .filter(|k| pattern_matches(pattern, k))
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    pub(crate) fn del(&mut self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    // =========================================================================
    // Strings
    // =========================================================================

    pub(crate) fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match self.entries.get(key) {
            None => Ok(None),
            Some(Value::Bytes(bytes)) => Ok(Some(bytes.clone())),
            Some(_) => Err(wrong_type(key)),
        }
    }

    pub(crate) fn set(&mut self, key: &str, value: Vec<u8>) {
        self.entries.insert(key.to_string(), Value::Bytes(value));
    }

    // =========================================================================
    // Hashes
    // =========================================================================

    fn hash(&self, key: &str) -> Result<Option<&BTreeMap<String, String>>> {
        match self.entries.get(key) {
            None => Ok(None),
            Some(Value::Hash(hash)) => Ok(Some(hash)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn hash_mut(&mut self, key: &str) -> Result<&mut BTreeMap<String, String>> {
        let value = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Value::Hash(BTreeMap::new()));
        match value {
            Value::Hash(hash) => Ok(hash),
            _ => Err(wrong_type(key)),
        }
    }

    pub(crate) fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        Ok(self.hash(key)?.and_then(|h| h.get(field).cloned()))
    }

    pub(crate) fn hgetall(&self, key: &str) -> Result<Vec<(String, String)>> {
        Ok(self
            .hash(key)?
            .map(|h| h.iter().map(|(f, v)| (f.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    /// Set fields in order; returns the number of fields that were new.
    pub(crate) fn hset<'a, I>(&mut self, key: &str, pairs: I) -> Result<usize>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let hash = self.hash_mut(key)?;
        let mut added = 0;
        for (field, value) in pairs {
            if hash.insert(field.to_string(), value.to_string()).is_none() {
                added += 1;
            }
        }
        if hash.is_empty() {
            self.entries.remove(key);
        }
        Ok(added)
    }

    /// Remove a field; returns `(removed, key_deleted)`.
    pub(crate) fn hdel(&mut self, key: &str, field: &str) -> Result<(bool, bool)> {
        let Some(value) = self.entries.get_mut(key) else {
            return Ok((false, false));
        };
        let Value::Hash(hash) = value else {
            return Err(wrong_type(key));
        };
        let removed = hash.remove(field).is_some();
        let emptied = hash.is_empty();
        if emptied {
            self.entries.remove(key);
        }
        Ok((removed, emptied))
    }

    pub(crate) fn hincrby(&mut self, key: &str, field: &str, delta: i64) -> Result<i64> {
        let hash = self.hash_mut(key)?;
        let current = match hash.get(field) {
            None => 0,
            Some(v) => v.parse::<i64>().map_err(|_| StoreError::NotAnInteger {
                key: key.to_string(),
                field: field.to_string(),
            })?,
        };
        let next = current.checked_add(delta).ok_or_else(|| StoreError::NotAnInteger {
            key: key.to_string(),
            field: field.to_string(),
        })?;
        hash.insert(field.to_string(), next.to_string());
        Ok(next)
    }

    // =========================================================================
    // Lists
    // =========================================================================

    /// Append values; returns the new length.
    pub(crate) fn rpush(&mut self, key: &str, values: Vec<Vec<u8>>) -> Result<usize> {
        let value = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Value::List(VecDeque::new()));
        let Value::List(list) = value else {
            return Err(wrong_type(key));
        };
        list.extend(values);
        let len = list.len();
        if len == 0 {
            self.entries.remove(key);
        }
        Ok(len)
    }

    /// Pop up to `count` values from the head.
    pub(crate) fn lpop(&mut self, key: &str, count: usize) -> Result<Vec<Vec<u8>>> {
        let Some(value) = self.entries.get_mut(key) else {
            return Ok(Vec::new());
        };
        let Value::List(list) = value else {
            return Err(wrong_type(key));
        };
        let n = count.min(list.len());
        let popped: Vec<Vec<u8>> = list.drain(..n).collect();
        if list.is_empty() {
            self.entries.remove(key);
        }
        Ok(popped)
    }

    pub(crate) fn llen(&self, key: &str) -> Result<usize> {
        match self.entries.get(key) {
            None => Ok(0),
            Some(Value::List(list)) => Ok(list.len()),
            Some(_) => Err(wrong_type(key)),
        }
    }
}
