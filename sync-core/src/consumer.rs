//! Read side of a producer/consumer table pair.
//!
//! A consumer pulls change records from the table's shadow event queue,
//! applies each one to the table itself in the same transaction, and
//! buffers the events for the caller. Consumers on the same table compete:
//! every record is taken by exactly one of them.

use parking_lot::Mutex;
use std::task::Waker;
use sync_store::{DbConnector, Subscription, Transaction};
use sync_types::{ChangeRecord, KeyOpFieldsValues, KeyOperation, Result, SyncError, TableName};

use crate::buffer::EventBuffer;
use crate::reader::{TableReader, DEFAULT_POP_BATCH_SIZE};
use crate::select::{Selectable, SelectableId};

/// Receives events written by [`ProducerStateTable`](crate::ProducerStateTable)s.
#[derive(Debug)]
pub struct ConsumerStateTable {
    id: SelectableId,
    priority: i32,
    db: DbConnector,
    name: TableName,
    signals: Subscription,
    pop_batch_size: usize,
    buffer: Mutex<EventBuffer>,
}

impl ConsumerStateTable {
    /// Bind a consumer with the default batch size and priority 0.
    pub fn new(db: &DbConnector, table_name: &str) -> Result<Self> {
        Self::with_options(db, table_name, DEFAULT_POP_BATCH_SIZE, 0)
    }

    /// Bind a consumer with an explicit batch size and select priority.
    ///
    /// Events queued before construction are available immediately.
    pub fn with_options(
        db: &DbConnector,
        table_name: &str,
        pop_batch_size: usize,
        priority: i32,
    ) -> Result<Self> {
        if pop_batch_size == 0 {
            return Err(SyncError::InvalidArgument("pop batch size is zero".into()));
        }
        let name = TableName::new(table_name, db.separator())?;
        let signals = db.subscribe(&name.channel(db.db_id()))?;
        tracing::debug!("Consumer {}: subscribed to {}", name.name(), signals.topic());
        Ok(Self {
            id: SelectableId::next(),
            priority,
            db: db.clone(),
            name,
            signals,
            pop_batch_size,
            buffer: Mutex::new(EventBuffer::new()),
        })
    }

    /// Table name.
    pub fn name(&self) -> &str {
        self.name.name()
    }

    /// Records fetched per store round trip.
    pub fn pop_batch_size(&self) -> usize {
        self.pop_batch_size
    }

    /// Consume pending signals and, if the buffer is empty, fetch one batch.
    fn refill(&self, buffer: &mut EventBuffer) -> Result<()> {
        self.signals.drain()?;
        if !buffer.is_empty() {
            return Ok(());
        }
        let queue = self.name.event_queue();
        let events = self.db.transaction(|tx| {
            let raw = tx.lpop(&queue, self.pop_batch_size)?;
            let mut events = Vec::with_capacity(raw.len());
            for bytes in raw {
                let record = match ChangeRecord::from_bytes(&bytes) {
                    Ok(record) => record,
                    Err(err) => {
                        tracing::error!("Consumer {}: dropping bad record: {}", self.name(), err);
                        continue;
                    }
                };
                if record.table != self.name.name() {
                    tracing::warn!(
                        "Consumer {}: dropping record for table {}",
                        self.name(),
                        record.table
                    );
                    continue;
                }
                if let Err(err) = apply(tx, &self.name, &record.event) {
                    tracing::error!(
                        "Consumer {}: dropping event for {}: {}",
                        self.name(),
                        record.event.key,
                        err
                    );
                    continue;
                }
                events.push(record.event);
            }
            Ok::<_, SyncError>(events)
        })?;
        if !events.is_empty() {
            tracing::debug!("Consumer {}: fetched {} events", self.name(), events.len());
        }
        buffer.extend(events);
        Ok(())
    }
}

/// Mirror an event into the table rows.
fn apply(tx: &mut Transaction<'_>, name: &TableName, event: &KeyOpFieldsValues) -> Result<()> {
    let store_key = name.row_key(&event.key);
    match event.operation {
        KeyOperation::Set => {
            tx.hset_many(&store_key, &event.fields)?;
        }
        KeyOperation::Del => {
            tx.del(&store_key);
        }
    }
    Ok(())
}

impl TableReader for ConsumerStateTable {
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

impl Selectable for ConsumerStateTable {
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
        self.signals.register_waker(waker);
    }

    fn deregister_waker(&self, waker: &Waker) {
        self.signals.deregister_waker(waker);
    }
}
