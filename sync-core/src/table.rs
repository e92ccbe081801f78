//! Direct row access to a named table.

use sync_store::DbConnector;
use sync_types::naming::validate_key;
use sync_types::{FieldValue, Result, SyncError, TableName};

/// Reject an empty field list or an empty field name.
pub(crate) fn validate_fields(fields: &[FieldValue]) -> Result<()> {
    if fields.is_empty() {
        return Err(SyncError::InvalidArgument("field list is empty".into()));
    }
    if fields.iter().any(|fv| fv.field.is_empty()) {
        return Err(SyncError::InvalidArgument("field name is empty".into()));
    }
    Ok(())
}

/// Read/write access to the rows of one table.
///
/// Rows are stored as hashes at `<table><sep><key>`, where the separator
/// comes from the connection's database configuration.
#[derive(Debug, Clone)]
pub struct Table {
    db: DbConnector,
    name: TableName,
}

impl Table {
    /// Bind to `table_name` on the given connection.
    ///
    /// # Errors
    ///
    /// [`SyncError::InvalidArgument`] if the name is empty or contains the
    /// database's separator.
    pub fn new(db: &DbConnector, table_name: &str) -> Result<Self> {
        Ok(Self {
            db: db.clone(),
            name: TableName::new(table_name, db.separator())?,
        })
    }

    /// Table name.
    pub fn name(&self) -> &str {
        self.name.name()
    }

    /// Separator between table name and row key.
    pub fn separator(&self) -> &str {
        self.name.separator()
    }

    /// Store key of a row.
    pub fn store_key(&self, key: &str) -> String {
        self.name.row_key(key)
    }

    /// Upsert a row: listed fields are overwritten, other fields are kept.
    ///
    /// Duplicate field names resolve to the last value given.
    pub fn set(&self, key: &str, fields: &[FieldValue]) -> Result<()> {
        validate_key(key)?;
        validate_fields(fields)?;
        let store_key = self.store_key(key);
        self.db.transaction(|tx| {
            tx.hset_many(&store_key, fields)?;
            Ok::<_, SyncError>(())
        })?;
        tracing::debug!("Table {}: set {} ({} fields)", self.name(), key, fields.len());
        Ok(())
    }

    /// Read a row. `None` means the row does not exist.
    ///
    /// Fields come back ordered by field name.
    pub fn get(&self, key: &str) -> Result<Option<Vec<FieldValue>>> {
        validate_key(key)?;
        let store_key = self.store_key(key);
        let fields = self.db.transaction(|tx| tx.hgetall(&store_key))?;
        Ok(if fields.is_empty() { None } else { Some(fields) })
    }

    /// Remove a row. Removing a missing row is a no-op.
    pub fn delete(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        let store_key = self.store_key(key);
        let existed = self
            .db
            .transaction(|tx| Ok::<_, SyncError>(tx.del(&store_key)))?;
        if existed {
            tracing::debug!("Table {}: deleted {}", self.name(), key);
        }
        Ok(())
    }

    /// Every row key in the table, each once, in no particular order.
    pub fn get_keys(&self) -> Result<Vec<String>> {
        let pattern = self.name.row_pattern();
        let store_keys = self
            .db
            .transaction(|tx| Ok::<_, SyncError>(tx.keys(&pattern)))?;
        Ok(store_keys
            .iter()
            .filter_map(|k| self.name.strip_row_key(k))
            .map(str::to_string)
            .collect())
    }

    /// Read one field of a row.
    pub fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        validate_key(key)?;
        let store_key = self.store_key(key);
        Ok(self.db.transaction(|tx| tx.hget(&store_key, field))?)
    }

    /// Write one field of a row.
    pub fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        self.set(key, &[FieldValue::new(field, value)])
    }

    /// Remove one field of a row. The row disappears with its last field.
    pub fn hdel(&self, key: &str, field: &str) -> Result<()> {
        validate_key(key)?;
        let store_key = self.store_key(key);
        self.db.transaction(|tx| tx.hdel(&store_key, field))?;
        Ok(())
    }
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

    #[test]
    fn set_get_delete_roundtrip() {
        let (_server, db) = setup();
        let table = Table::new(&db, "T").unwrap();

        table
            .set("aaa", &field_values([("a", "b"), ("c", "d")]))
            .unwrap();
        let fields = table.get("aaa").unwrap().unwrap();
        assert_eq!(fields, field_values([("a", "b"), ("c", "d")]));

        table.delete("aaa").unwrap();
        assert!(table.get("aaa").unwrap().is_none());
    }

    #[test]
    fn set_keeps_unlisted_fields() {
        let (_server, db) = setup();
        let table = Table::new(&db, "T").unwrap();

        table.set("k", &field_values([("x", "1"), ("y", "2")])).unwrap();
        table.set("k", &field_values([("x", "3")])).unwrap();

        assert_eq!(
            table.get("k").unwrap().unwrap(),
            field_values([("x", "3"), ("y", "2")])
        );
    }

    #[test]
    fn get_missing_row_is_none() {
        let (_server, db) = setup();
        let table = Table::new(&db, "T").unwrap();
        assert!(table.get("never").unwrap().is_none());
        table.delete("never").unwrap();
    }

    #[test]
    fn invalid_input_is_rejected() {
        let (_server, db) = setup();
        let table = Table::new(&db, "T").unwrap();

        assert!(matches!(
            table.set("k", &[]),
            Err(SyncError::InvalidArgument(_))
        ));
        assert!(matches!(
            table.set("", &field_values([("a", "b")])),
            Err(SyncError::InvalidArgument(_))
        ));
        assert!(matches!(
            table.set("k", &field_values([("", "b")])),
            Err(SyncError::InvalidArgument(_))
        ));
        assert!(matches!(
            Table::new(&db, "A:B"),
            Err(SyncError::InvalidArgument(_))
        ));
    }

    #[test]
    fn tables_do_not_see_each_other() {
        let (_server, db) = setup();
        let t = Table::new(&db, "T").unwrap();
        let tt = Table::new(&db, "TT").unwrap();

        t.set("k1", &field_values([("a", "b")])).unwrap();
        t.set("k2", &field_values([("a", "b")])).unwrap();
        tt.set("k3", &field_values([("a", "b")])).unwrap();

        let mut keys = t.get_keys().unwrap();
        keys.sort();
        assert_eq!(keys, ["k1", "k2"]);
        assert_eq!(tt.get_keys().unwrap(), ["k3"]);
    }

    #[test]
    fn configured_separator_is_used() {
        let server = StoreServer::ephemeral().unwrap();
        let info = server.connection_info(4).with_separator("|");
        let db = DbConnector::connect(&info).unwrap();
        let table = Table::new(&db, "PORT").unwrap();

        table.hset("Ethernet0", "mtu", "9100").unwrap();
        assert_eq!(table.separator(), "|");
        assert!(db.exists("PORT|Ethernet0").unwrap());
        assert_eq!(
            table.hget("Ethernet0", "mtu").unwrap().as_deref(),
            Some("9100")
        );

        table.hdel("Ethernet0", "mtu").unwrap();
        assert!(table.get("Ethernet0").unwrap().is_none());
    }

    #[test]
    fn closed_connection_is_unavailable() {
        let (_server, db) = setup();
        let table = Table::new(&db, "T").unwrap();
        db.close();
        assert!(matches!(
            table.get("k"),
            Err(SyncError::StoreUnavailable(_))
        ));
    }
}
