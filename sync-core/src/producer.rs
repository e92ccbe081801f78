//! Write side of a producer/consumer table pair.
//!
//! Every write becomes one [`ChangeRecord`] appended to the table's shadow
//! event queue, followed by a signal on the table channel. Records are never
//! coalesced, so consumers see exactly the sequence of calls made here.

use std::collections::BTreeMap;
use sync_store::{DbConnector, Transaction};
use sync_types::naming::{validate_key, PRODUCER_SIGNAL};
use sync_types::{
    ChangeRecord, FieldValue, KeyOpFieldsValues, KeyOperation, Result, SyncError, TableName,
};

use crate::buffer::EventBuffer;
use crate::table::validate_fields;

/// Counter fields kept in the stats hash.
const STAT_SEQUENCE: &str = "sequence";

type Row = BTreeMap<String, String>;

/// Publishes change events for one table.
#[derive(Debug)]
pub struct ProducerStateTable {
    db: DbConnector,
    name: TableName,
    buffered: bool,
    pending: EventBuffer,
    temp_view: Option<BTreeMap<String, Row>>,
}

impl ProducerStateTable {
    /// Bind a producer to `table_name` on the given connection.
    pub fn new(db: &DbConnector, table_name: &str) -> Result<Self> {
        Ok(Self {
            db: db.clone(),
            name: TableName::new(table_name, db.separator())?,
            buffered: false,
            pending: EventBuffer::new(),
            temp_view: None,
        })
    }

    /// Table name.
    pub fn name(&self) -> &str {
        self.name.name()
    }

    /// Queue a `Set` event for `key`.
    pub fn set(&mut self, key: &str, fields: &[FieldValue]) -> Result<()> {
        self.write(key, KeyOperation::Set, fields, "")
    }

    /// Queue a `Del` event for `key`.
    pub fn delete(&mut self, key: &str) -> Result<()> {
        self.write(key, KeyOperation::Del, &[], "")
    }

    /// Queue an event for `<prefix><key>`.
    ///
    /// `fields` are ignored for [`KeyOperation::Del`].
    ///
    /// # Errors
    ///
    /// [`SyncError::InvalidArgument`] for an empty key, or a `Set` with no
    /// fields; [`SyncError::StoreUnavailable`] if the connection is gone.
    pub fn write(
        &mut self,
        key: &str,
        operation: KeyOperation,
        fields: &[FieldValue],
        prefix: &str,
    ) -> Result<()> {
        validate_key(key)?;
        let key = format!("{prefix}{key}");
        let event = match operation {
            KeyOperation::Set => {
                validate_fields(fields)?;
                KeyOpFieldsValues::set(key, fields.to_vec())
            }
            KeyOperation::Del => KeyOpFieldsValues::del(key),
        };

        if let Some(view) = self.temp_view.as_mut() {
            match event.operation {
                KeyOperation::Set => {
                    let row = view.entry(event.key).or_default();
                    for fv in event.fields {
                        row.insert(fv.field, fv.value);
                    }
                }
                KeyOperation::Del => {
                    view.remove(&event.key);
                }
            }
            return Ok(());
        }

        if self.buffered {
            self.pending.push(event);
            return Ok(());
        }

        self.commit(vec![event])
    }

    /// Hold events locally until [`flush`](Self::flush).
    ///
    /// Turning buffering off flushes whatever is held.
    pub fn set_buffered(&mut self, buffered: bool) -> Result<()> {
        self.buffered = buffered;
        if !buffered {
            self.flush()?;
        }
        Ok(())
    }

    /// True in buffered mode.
    pub fn is_buffered(&self) -> bool {
        self.buffered
    }

    /// Write every held event in one transaction with a single signal.
    pub fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let events = self.pending.drain_all();
        self.commit(events)
    }

    /// Number of events written to the store but not yet consumed.
    pub fn count(&self) -> Result<usize> {
        let queue = self.name.event_queue();
        Ok(self.db.transaction(|tx| tx.llen(&queue))?)
    }

    /// Number of events held locally in buffered mode.
    pub fn buffered_count(&self) -> usize {
        self.pending.len()
    }

    /// Discard unconsumed events, both in the store and held locally.
    pub fn clear(&mut self) -> Result<()> {
        self.pending.clear();
        let queue = self.name.event_queue();
        self.db
            .transaction(|tx| Ok::<_, SyncError>(tx.del(&queue)))?;
        tracing::debug!("Producer {}: cleared pending events", self.name());
        Ok(())
    }

    /// Start collecting a desired table state instead of writing events.
    ///
    /// Until [`apply_temp_view`](Self::apply_temp_view), `set` and `delete`
    /// edit the view. Starting a new view discards the previous one.
    pub fn create_temp_view(&mut self) {
        if self.temp_view.replace(BTreeMap::new()).is_some() {
            tracing::warn!("Producer {}: discarding unapplied temp view", self.name());
        }
    }

    /// True while a temp view is being collected.
    pub fn has_temp_view(&self) -> bool {
        self.temp_view.is_some()
    }

    /// Write the events that turn the current table into the temp view.
    ///
    /// Rows missing from the view are deleted. Rows whose fields only grew or
    /// changed get a `Set` with the differing fields. Rows that lost fields
    /// get a `Del` followed by a full `Set`.
    ///
    /// Events still held in buffered mode are flushed first, so they stay
    /// ahead of the diff.
    pub fn apply_temp_view(&mut self) -> Result<()> {
        if self.temp_view.is_none() {
            return Err(SyncError::InvalidArgument(format!(
                "no temp view on table {}",
                self.name()
            )));
        }
        self.flush()?;
        let view = self.temp_view.take().unwrap_or_default();

        let name = self.name.clone();
        let count = self.db.transaction(|tx| {
            let current = read_rows(tx, &name)?;
            let events = diff_rows(&current, &view);
            let count = events.len();
            append_records(tx, &name, events)?;
            Ok::<_, SyncError>(count)
        })?;
        tracing::debug!(
            "Producer {}: applied temp view ({} events)",
            self.name(),
            count
        );
        Ok(())
    }

    fn commit(&self, events: Vec<KeyOpFieldsValues>) -> Result<()> {
        let count = events.len();
        self.db
            .transaction(|tx| append_records(tx, &self.name, events))?;
        tracing::debug!("Producer {}: wrote {} events", self.name(), count);
        Ok(())
    }
}

/// Append one record per event, bump the counters and signal once.
fn append_records(
    tx: &mut Transaction<'_>,
    name: &TableName,
    events: Vec<KeyOpFieldsValues>,
) -> Result<()> {
    if events.is_empty() {
        return Ok(());
    }
    let stats = name.stats_key();
    let mut records = Vec::with_capacity(events.len());
    for event in events {
        let sequence = tx.hincrby(&stats, STAT_SEQUENCE, 1)?;
        let counter = match event.operation {
            KeyOperation::Set => "set",
            KeyOperation::Del => "del",
        };
        tx.hincrby(&stats, counter, 1)?;
        let record = ChangeRecord::new(name.name(), sequence.unsigned_abs(), event);
        records.push(record.to_bytes()?);
    }
    tx.rpush(&name.event_queue(), records)?;
    tx.publish(&name.channel(tx.db_id()), PRODUCER_SIGNAL);
    Ok(())
}

fn read_rows(tx: &Transaction<'_>, name: &TableName) -> Result<BTreeMap<String, Row>> {
    let mut rows = BTreeMap::new();
    for store_key in tx.keys(&name.row_pattern()) {
        let Some(key) = name.strip_row_key(&store_key) else {
            continue;
        };
        let row: Row = tx
            .hgetall(&store_key)?
            .into_iter()
            .map(|fv| (fv.field, fv.value))
            .collect();
        rows.insert(key.to_string(), row);
    }
    Ok(rows)
}

fn to_fields(row: &Row) -> Vec<FieldValue> {
    row.iter().map(|(f, v)| FieldValue::new(f, v)).collect()
}

/// Events that turn `current` into `desired`.
fn diff_rows(current: &BTreeMap<String, Row>, desired: &BTreeMap<String, Row>) -> Vec<KeyOpFieldsValues> {
    let mut events = Vec::new();

    for key in current.keys().filter(|k| !desired.contains_key(*k)) {
        events.push(KeyOpFieldsValues::del(key.clone()));
    }

    for (key, want) in desired {
        if want.is_empty() {
            continue;
        }
        match current.get(key) {
            None => events.push(KeyOpFieldsValues::set(key.clone(), to_fields(want))),
            Some(have) if have.keys().any(|f| !want.contains_key(f)) => {
                events.push(KeyOpFieldsValues::del(key.clone()));
                events.push(KeyOpFieldsValues::set(key.clone(), to_fields(want)));
            }
            Some(have) => {
                let changed: Vec<FieldValue> = want
                    .iter()
                    .filter(|(f, v)| have.get(*f) != Some(*v))
                    .map(|(f, v)| FieldValue::new(f, v))
                    .collect();
                if !changed.is_empty() {
                    events.push(KeyOpFieldsValues::set(key.clone(), changed));
                }
            }
        }
    }

    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use sync_store::StoreServer;
    use sync_types::field_values;

    fn setup() -> (StoreServer, DbConnector) {
        let server = StoreServer::ephemeral().unwrap();
        let db = DbConnector::connect(&server.connection_info(0)).unwrap();
        (server, db)
    }

    fn queued(db: &DbConnector, table: &str) -> Vec<ChangeRecord> {
        let queue = format!("_{table}_EVENTS");
        db.transaction(|tx| tx.lpop(&queue, usize::MAX))
            .unwrap()
            .iter()
            .map(|bytes| ChangeRecord::from_bytes(bytes).unwrap())
            .collect()
    }

    fn row(pairs: &[(&str, &str)]) -> Row {
        pairs
            .iter()
            .map(|(f, v)| (f.to_string(), v.to_string()))
            .collect()
    }

    // =========================================================================
    // Writes
    // =========================================================================

    #[test]
    fn each_call_appends_one_record_and_signals() {
        let (_server, db) = setup();
        let signals = db.subscribe("T_CHANNEL@0").unwrap();
        let mut producer = ProducerStateTable::new(&db, "T").unwrap();

        producer.set("aaa", &field_values([("a", "b")])).unwrap();
        producer.set("aaa", &field_values([("a", "c")])).unwrap();
        producer.delete("aaa").unwrap();

        assert_eq!(producer.count().unwrap(), 3);
        assert_eq!(signals.drain().unwrap().len(), 3);

        let records = queued(&db, "T");
        let sequences: Vec<u64> = records.iter().map(|r| r.sequence).collect();
        assert_eq!(sequences, [1, 2, 3]);
        assert_eq!(records[0].event.value_of("a"), Some("b"));
        assert_eq!(records[1].event.value_of("a"), Some("c"));
        assert_eq!(records[2].event, KeyOpFieldsValues::del("aaa"));
        assert!(records.iter().all(|r| r.table == "T"));
    }

    #[test]
    fn write_applies_prefix_and_ignores_del_fields() {
        let (_server, db) = setup();
        let mut producer = ProducerStateTable::new(&db, "T").unwrap();

        producer
            .write("k", KeyOperation::Del, &field_values([("x", "y")]), "pre_")
            .unwrap();

        let records = queued(&db, "T");
        assert_eq!(records[0].event.key, "pre_k");
        assert!(records[0].event.fields.is_empty());
    }

    #[test]
    fn invalid_writes_are_rejected() {
        let (_server, db) = setup();
        let mut producer = ProducerStateTable::new(&db, "T").unwrap();

        assert!(matches!(
            producer.set("k", &[]),
            Err(SyncError::InvalidArgument(_))
        ));
        assert!(matches!(
            producer.delete(""),
            Err(SyncError::InvalidArgument(_))
        ));
        assert_eq!(producer.count().unwrap(), 0);
    }

    #[test]
    fn stats_count_operations() {
        let (_server, db) = setup();
        let mut producer = ProducerStateTable::new(&db, "T").unwrap();
        producer.set("a", &field_values([("f", "v")])).unwrap();
        producer.set("b", &field_values([("f", "v")])).unwrap();
        producer.delete("a").unwrap();

        assert_eq!(db.hget("_T_STATS", "set").unwrap().as_deref(), Some("2"));
        assert_eq!(db.hget("_T_STATS", "del").unwrap().as_deref(), Some("1"));
    }

    // =========================================================================
    // Buffering
    // =========================================================================

    #[test]
    fn buffered_writes_wait_for_flush() {
        let (_server, db) = setup();
        let signals = db.subscribe("T_CHANNEL@0").unwrap();
        let mut producer = ProducerStateTable::new(&db, "T").unwrap();
        producer.set_buffered(true).unwrap();

        producer.set("a", &field_values([("f", "1")])).unwrap();
        producer.set("b", &field_values([("f", "2")])).unwrap();
        assert_eq!(producer.count().unwrap(), 0);
        assert_eq!(producer.buffered_count(), 2);

        producer.flush().unwrap();
        assert_eq!(producer.count().unwrap(), 2);
        assert_eq!(producer.buffered_count(), 0);
        assert_eq!(signals.drain().unwrap().len(), 1);
    }

    #[test]
    fn leaving_buffered_mode_flushes() {
        let (_server, db) = setup();
        let mut producer = ProducerStateTable::new(&db, "T").unwrap();
        producer.set_buffered(true).unwrap();
        producer.delete("a").unwrap();
        producer.set_buffered(false).unwrap();
        assert!(!producer.is_buffered());
        assert_eq!(producer.count().unwrap(), 1);
    }

    #[test]
    fn clear_discards_pending() {
        let (_server, db) = setup();
        let mut producer = ProducerStateTable::new(&db, "T").unwrap();
        producer.set("a", &field_values([("f", "1")])).unwrap();
        producer.set_buffered(true).unwrap();
        producer.set("b", &field_values([("f", "1")])).unwrap();

        producer.clear().unwrap();
        assert_eq!(producer.count().unwrap(), 0);
        assert_eq!(producer.buffered_count(), 0);
    }

    // =========================================================================
    // Temp view
    // =========================================================================

    #[test]
    fn diff_emits_minimal_events() {
        let mut current = BTreeMap::new();
        current.insert("gone".to_string(), row(&[("f", "1")]));
        current.insert("same".to_string(), row(&[("f", "1")]));
        current.insert("grown".to_string(), row(&[("f", "1")]));
        current.insert("shrunk".to_string(), row(&[("f", "1"), ("g", "2")]));

        let mut desired = BTreeMap::new();
        desired.insert("same".to_string(), row(&[("f", "1")]));
        desired.insert("grown".to_string(), row(&[("f", "1"), ("g", "2")]));
        desired.insert("shrunk".to_string(), row(&[("f", "1")]));
        desired.insert("new".to_string(), row(&[("f", "1")]));

        let events = diff_rows(&current, &desired);
        assert_eq!(
            events,
            vec![
                KeyOpFieldsValues::del("gone"),
                KeyOpFieldsValues::set("grown", field_values([("g", "2")])),
                KeyOpFieldsValues::set("new", field_values([("f", "1")])),
                KeyOpFieldsValues::del("shrunk"),
                KeyOpFieldsValues::set("shrunk", field_values([("f", "1")])),
            ]
        );
    }

    #[test]
    fn temp_view_writes_diff_against_table() {
        let (_server, db) = setup();
        let table = crate::Table::new(&db, "T").unwrap();
        table.set("keep", &field_values([("f", "1")])).unwrap();
        table.set("drop", &field_values([("f", "1")])).unwrap();

        let mut producer = ProducerStateTable::new(&db, "T").unwrap();
        producer.create_temp_view();
        producer.set("keep", &field_values([("f", "1")])).unwrap();
        producer.set("add", &field_values([("f", "2")])).unwrap();
        producer.delete("never").unwrap();
        assert!(producer.has_temp_view());
        assert_eq!(producer.count().unwrap(), 0);

        producer.apply_temp_view().unwrap();
        assert!(!producer.has_temp_view());

        let events: Vec<KeyOpFieldsValues> =
            queued(&db, "T").into_iter().map(|r| r.event).collect();
        assert_eq!(
            events,
            vec![
                KeyOpFieldsValues::del("drop"),
                KeyOpFieldsValues::set("add", field_values([("f", "2")])),
            ]
        );
    }

    #[test]
    fn buffered_events_stay_ahead_of_temp_view_diff() {
        let (_server, db) = setup();
        let mut producer = ProducerStateTable::new(&db, "T").unwrap();
        producer.set_buffered(true).unwrap();
        producer.set("first", &field_values([("a", "1")])).unwrap();

        producer.create_temp_view();
        producer.set("second", &field_values([("a", "2")])).unwrap();
        producer.apply_temp_view().unwrap();
        assert_eq!(producer.buffered_count(), 0);
        producer.flush().unwrap();

        let keys: Vec<String> = queued(&db, "T")
            .into_iter()
            .map(|r| r.event.key)
            .collect();
        assert_eq!(keys, ["first", "second"]);
    }

    #[test]
    fn apply_without_view_is_an_error() {
        let (_server, db) = setup();
        let mut producer = ProducerStateTable::new(&db, "T").unwrap();
        assert!(matches!(
            producer.apply_temp_view(),
            Err(SyncError::InvalidArgument(_))
        ));
    }
}
