//! Manually triggered selectable.

use std::sync::atomic::{AtomicU64, Ordering};
use std::task::Waker;
use sync_types::Result;

use crate::select::{Selectable, SelectableId, WakerSet};

/// Becomes ready when [`notify`](Self::notify) is called.
///
/// Notifications accumulate until a select reports the event, which
/// consumes all of them at once.
#[derive(Debug)]
pub struct SelectableEvent {
    id: SelectableId,
    priority: i32,
    pending: AtomicU64,
    wakers: WakerSet,
}

impl Default for SelectableEvent {
    fn default() -> Self {
        Self::new()
    }
}

impl SelectableEvent {
    /// Create an event with priority 0.
    pub fn new() -> Self {
        Self::with_priority(0)
    }

    /// Create an event with a select priority.
    pub fn with_priority(priority: i32) -> Self {
        Self {
            id: SelectableId::next(),
            priority,
            pending: AtomicU64::new(0),
            wakers: WakerSet::default(),
        }
    }

    /// Make the event ready. Safe to call from any thread.
    pub fn notify(&self) {
        self.pending.fetch_add(1, Ordering::AcqRel);
        self.wakers.wake_all();
    }

    /// Number of notifications not yet consumed.
    pub fn pending(&self) -> u64 {
        self.pending.load(Ordering::Acquire)
    }
}

impl Selectable for SelectableEvent {
    fn selectable_id(&self) -> SelectableId {
        self.id
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn poll_ready(&self) -> Result<bool> {
        Ok(self.pending.swap(0, Ordering::AcqRel) > 0)
    }

    fn register_waker(&self, waker: &Waker) {
        self.wakers.register(waker);
    }

    fn deregister_waker(&self, waker: &Waker) {
        self.wakers.deregister(waker);
    }
}
