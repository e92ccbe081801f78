//! Pull-style interface shared by consumer and subscriber tables.

use std::sync::Arc;
use std::time::Duration;
use sync_types::{KeyOpFieldsValues, Result};

use crate::select::{Select, SelectResult, Selectable};

/// Default number of queued records fetched per store round trip.
pub const DEFAULT_POP_BATCH_SIZE: usize = 128;

/// A table whose change events are read in order.
pub trait TableReader: Selectable + 'static {
    /// Remove and return the oldest available event.
    ///
    /// # Errors
    ///
    /// [`SyncError::QueueEmpty`](sync_types::SyncError::QueueEmpty) when
    /// nothing is available; store errors otherwise.
    fn pop(&self) -> Result<KeyOpFieldsValues>;

    /// Remove and return every event currently available, oldest first.
    ///
    /// Returns an empty vector when nothing is available.
    fn pops(&self) -> Result<Vec<KeyOpFieldsValues>>;

    /// Number of events buffered locally, not counting any still in the store.
    fn buffered(&self) -> usize;

    /// Wait on this table alone.
    ///
    /// Returns [`SelectResult::Object`] with this table's id once data is
    /// available, or [`SelectResult::Timeout`].
    fn read_data(self: &Arc<Self>, timeout: Option<Duration>) -> Result<SelectResult>
    where
        Self: Sized,
    {
        let mut select = Select::new();
        select.add_selectable(self);
        select.select(timeout)
    }
}
