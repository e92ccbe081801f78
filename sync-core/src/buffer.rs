//! Event buffer for statesync tables.
//!
//! This module provides a FIFO queue of change events:
//! - Consumer and subscriber tables buffer received events until popped
//! - Producer tables in buffered mode hold written events until flushed
//!
//! Events leave the buffer in exactly the order they entered it.

use std::collections::VecDeque;
use sync_types::KeyOpFieldsValues;

/// FIFO buffer of change events.
#[derive(Debug, Default)]
pub struct EventBuffer {
    queue: VecDeque<KeyOpFieldsValues>,
}

impl EventBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an event to the back of the queue.
    pub fn push(&mut self, event: KeyOpFieldsValues) {
        self.queue.push_back(event);
    }

    /// Add several events, keeping their order.
    pub fn extend(&mut self, events: impl IntoIterator<Item = KeyOpFieldsValues>) {
        self.queue.extend(events);
    }

    /// Remove and return the oldest event.
    pub fn pop(&mut self) -> Option<KeyOpFieldsValues> {
        self.queue.pop_front()
    }

    /// Remove and return every buffered event, oldest first.
    pub fn drain_all(&mut self) -> Vec<KeyOpFieldsValues> {
        self.queue.drain(..).collect()
    }

    /// Number of buffered events.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Discard every buffered event.
    pub fn clear(&mut self) {
        self.queue.clear();
    }
}
