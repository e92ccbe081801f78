//! Plain channel notifications.
//!
//! Unlike producer/consumer tables, notifications are not queued in the
//! store: a notification sent while no consumer is subscribed is lost.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::task::Waker;
use sync_store::{DbConnector, Subscription};
use sync_types::{FieldValue, NotificationMessage, Result, SyncError};

use crate::select::{Selectable, SelectableId};

/// Publishes [`NotificationMessage`]s on one channel.
#[derive(Debug, Clone)]
pub struct NotificationProducer {
    db: DbConnector,
    channel: String,
}

impl NotificationProducer {
    /// Bind to `channel`.
    pub fn new(db: &DbConnector, channel: &str) -> Result<Self> {
        if channel.is_empty() {
            return Err(SyncError::InvalidArgument("channel name is empty".into()));
        }
        Ok(Self {
            db: db.clone(),
            channel: channel.to_string(),
        })
    }

    /// Send a notification; returns the number of consumers that got it.
    pub fn send(&self, op: &str, data: &str, values: &[FieldValue]) -> Result<usize> {
        let payload = NotificationMessage::new(op, data, values.to_vec()).to_json()?;
        let receivers = self.db.publish(&self.channel, &payload)?;
        tracing::debug!("Notification {} {} sent to {} consumers", op, data, receivers);
        Ok(receivers)
    }
}

/// Receives notifications from one channel.
#[derive(Debug)]
pub struct NotificationConsumer {
    id: SelectableId,
    priority: i32,
    subscription: Subscription,
    queue: Mutex<VecDeque<NotificationMessage>>,
}

impl NotificationConsumer {
    /// Subscribe to `channel` with priority 0.
    pub fn new(db: &DbConnector, channel: &str) -> Result<Self> {
        Self::with_priority(db, channel, 0)
    }

    /// Subscribe to `channel` with a select priority.
    pub fn with_priority(db: &DbConnector, channel: &str, priority: i32) -> Result<Self> {
        if channel.is_empty() {
            return Err(SyncError::InvalidArgument("channel name is empty".into()));
        }
        Ok(Self {
            id: SelectableId::next(),
            priority,
            subscription: db.subscribe(channel)?,
            queue: Mutex::new(VecDeque::new()),
        })
    }

    /// Decode pending messages. Malformed payloads are logged and dropped.
    fn refill(&self, queue: &mut VecDeque<NotificationMessage>) -> Result<()> {
        for msg in self.subscription.drain()? {
            match NotificationMessage::from_json(&msg.payload) {
                Ok(notification) => queue.push_back(notification),
                Err(err) => tracing::error!(
                    "Dropping malformed notification on {}: {}",
                    msg.channel,
                    err
                ),
            }
        }
        Ok(())
    }

    /// Remove and return the oldest notification.
    pub fn pop(&self) -> Result<NotificationMessage> {
        let mut queue = self.queue.lock();
        self.refill(&mut queue)?;
        queue.pop_front().ok_or(SyncError::QueueEmpty)
    }

    /// Remove and return every pending notification.
    pub fn pops(&self) -> Result<Vec<NotificationMessage>> {
        let mut queue = self.queue.lock();
        self.refill(&mut queue)?;
        Ok(queue.drain(..).collect())
    }
}

impl Selectable for NotificationConsumer {
    fn selectable_id(&self) -> SelectableId {
        self.id
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn poll_ready(&self) -> Result<bool> {
        let mut queue = self.queue.lock();
        self.refill(&mut queue)?;
        Ok(!queue.is_empty())
    }

    fn register_waker(&self, waker: &Waker) {
        self.subscription.register_waker(waker);
    }

    fn deregister_waker(&self, waker: &Waker) {
        self.subscription.deregister_waker(waker);
    }
}
