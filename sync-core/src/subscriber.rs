//! Keyspace-driven view of a table.
//!
//! A subscriber watches keyspace notifications for the table's rows. It
//! starts with a snapshot of every existing row as `Set` events, then turns
//! each notification into one event: `del` becomes `Del`, anything else
//! becomes `Set` with the row's fields as they are when the notification is
//! processed. Notifications for rows that have since vanished are skipped.
//! Rapid updates to one key are not coalesced.

use parking_lot::Mutex;
use std::task::Waker;
use sync_store::{DbConnector, StoreError, Subscription};
use sync_types::naming::parse_keyspace_channel;
use sync_types::{KeyOpFieldsValues, Result, SyncError, TableName};

use crate::buffer::EventBuffer;
use crate::reader::TableReader;
use crate::select::{Selectable, SelectableId};

/// Keyspace event meaning the whole key is gone.
const DEL_EVENT: &str = "del";

/// Receives every change to a table's rows, whoever made it.
#[derive(Debug)]
pub struct SubscriberStateTable {
    id: SelectableId,
    priority: i32,
    db: DbConnector,
    name: TableName,
    notifications: Subscription,
    buffer: Mutex<EventBuffer>,
}

impl SubscriberStateTable {
    /// Subscribe to `table_name` with priority 0.
    pub fn new(db: &DbConnector, table_name: &str) -> Result<Self> {
        Self::with_priority(db, table_name, 0)
    }

    /// Subscribe to `table_name` with a select priority.
    ///
    /// The snapshot and the subscription are taken atomically, so no write
    /// is missed or seen twice.
    pub fn with_priority(db: &DbConnector, table_name: &str, priority: i32) -> Result<Self> {
        let name = TableName::new(table_name, db.separator())?;
        if !db.notify_keyspace_events() {
            tracing::warn!(
                "Subscriber {}: keyspace notifications are disabled; only the snapshot will be seen",
                name.name()
            );
        }

        let pattern = name.keyspace_pattern(db.db_id());
        let (notifications, snapshot) = db.transaction(|tx| {
            let subscription = tx.psubscribe(&pattern);
            let mut snapshot = Vec::new();
            for store_key in tx.keys(&name.row_pattern()) {
                let Some(key) = name.strip_row_key(&store_key) else {
                    continue;
                };
                match tx.hgetall(&store_key) {
                    Ok(fields) if !fields.is_empty() => {
                        snapshot.push(KeyOpFieldsValues::set(key, fields));
                    }
                    Ok(_) => {}
                    Err(StoreError::WrongType { .. }) => {
                        tracing::warn!("Subscriber {}: {} is not a row", name.name(), store_key);
                    }
                    Err(err) => return Err(SyncError::from(err)),
                }
            }
            Ok((subscription, snapshot))
        })?;

        tracing::debug!(
            "Subscriber {}: {} rows in snapshot, watching {}",
            name.name(),
            snapshot.len(),
            pattern
        );

        let mut buffer = EventBuffer::new();
        buffer.extend(snapshot);
        Ok(Self {
            id: SelectableId::next(),
            priority,
            db: db.clone(),
            name,
            notifications,
            buffer: Mutex::new(buffer),
        })
    }

    /// Table name.
    pub fn name(&self) -> &str {
        self.name.name()
    }

    /// Turn pending notifications into events.
    fn refill(&self, buffer: &mut EventBuffer) -> Result<()> {
        let messages = self.notifications.drain()?;
        if messages.is_empty() {
            return Ok(());
        }
        let db_id = self.db.db_id();
        let events = self.db.transaction(|tx| {
            let mut events = Vec::with_capacity(messages.len());
            for msg in &messages {
                let Some((msg_db, store_key)) = parse_keyspace_channel(&msg.channel) else {
                    tracing::error!(
                        "Subscriber {}: malformed keyspace channel {}",
                        self.name(),
                        msg.channel
                    );
                    continue;
                };
                if msg_db != db_id {
                    continue;
                }
                let Some(key) = self.name.strip_row_key(store_key) else {
                    continue;
                };

                if msg.payload == DEL_EVENT {
                    events.push(KeyOpFieldsValues::del(key));
                    continue;
                }
                match tx.hgetall(store_key) {
                    Ok(fields) if fields.is_empty() => {
                        tracing::debug!(
                            "Subscriber {}: {} vanished before {} was read",
                            self.name(),
                            key,
                            msg.payload
                        );
                    }
                    Ok(fields) => events.push(KeyOpFieldsValues::set(key, fields)),
                    Err(StoreError::WrongType { .. }) => {
                        tracing::warn!("Subscriber {}: {} is not a row", self.name(), store_key);
                    }
                    Err(err) => return Err(SyncError::from(err)),
                }
            }
            Ok(events)
        })?;
        buffer.extend(events);
        Ok(())
    }
}

impl TableReader for SubscriberStateTable {
    fn pop(&self) -> Result<KeyOpFieldsValues> {
        let mut buffer = self.buffer.lock();
        self.refill(&mut buffer)?;
        buffer.pop().ok_or(SyncError::QueueEmpty)
    }

    fn pops(&self) -> Result<Vec<KeyOpFieldsValues>> {
        let mut buffer = self.buffer.lock();
        self.refill(&mut buffer)?;
        Ok(buffer.drain_all())
    }

    fn buffered(&self) -> usize {
        self.buffer.lock().len()
    }
}

impl Selectable for SubscriberStateTable {
    fn selectable_id(&self) -> SelectableId {
        self.id
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn poll_ready(&self) -> Result<bool> {
        let mut buffer = self.buffer.lock();
        self.refill(&mut buffer)?;
        Ok(!buffer.is_empty())
    }

    fn register_waker(&self, waker: &Waker) {
        self.notifications.register_waker(waker);
    }

    fn deregister_waker(&self, waker: &Waker) {
        self.notifications.deregister_waker(waker);
    }
}
