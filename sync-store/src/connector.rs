//! Connection handle to one logical database.
//!
//! All data access goes through [`DbConnector::transaction`], which runs a
//! closure against the locked database. Commands inside one transaction are
//! atomic with respect to every other connection, and the keyspace
//! notifications they emit are published before the lock is released.

use crate::config::{DbConnectionInfo, Endpoint};
use crate::error::{Result, StoreError};
use crate::keyspace::Keyspace;
use crate::pubsub::{Mailbox, Subscription};
use crate::server::{lookup, ServerShared};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use sync_types::naming::{keyevent_channel, keyspace_channel};
use sync_types::FieldValue;

#[derive(Debug, Default)]
struct Connection {
    closed: AtomicBool,
    mailboxes: Mutex<Vec<Weak<Mailbox>>>,
}

impl Connection {
    fn track(&self, subscription: &Subscription) {
        let mut mailboxes = self.mailboxes.lock();
        mailboxes.retain(|weak| weak.strong_count() > 0);
        mailboxes.push(Arc::downgrade(subscription.mailbox()));
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for weak in self.mailboxes.lock().drain(..) {
            if let Some(mailbox) = weak.upgrade() {
                mailbox.close();
            }
        }
    }
}

/// Handle to one logical database on a running store server.
///
/// Clones share the underlying connection: closing one closes all of them.
/// Use [`duplicate`](Self::duplicate) for an independent connection.
#[derive(Debug, Clone)]
pub struct DbConnector {
    shared: Arc<ServerShared>,
    conn: Arc<Connection>,
    info: DbConnectionInfo,
}

impl DbConnector {
    /// Connect using resolved connection info.
    ///
    /// # Errors
    ///
    /// [`StoreError::Unavailable`] if no server answers on the endpoint,
    /// [`StoreError::InvalidDatabase`] if the database index is out of range.
    pub fn connect(info: &DbConnectionInfo) -> Result<Self> {
        let shared = lookup(&info.endpoint).ok_or_else(|| StoreError::Unavailable {
            endpoint: info.endpoint.to_string(),
        })?;
        if info.db_id >= shared.config.databases {
            return Err(StoreError::InvalidDatabase {
                db_id: info.db_id,
                databases: shared.config.databases,
            });
        }
        shared
            .metrics
            .connections_total
            .fetch_add(1, Ordering::Relaxed);
        tracing::debug!("Connected to db {} at {}", info.db_id, info.endpoint);
        Ok(Self {
            shared,
            conn: Arc::new(Connection::default()),
            info: info.clone(),
        })
    }

    /// Connect over TCP.
    pub fn new_tcp(db_id: u32, host: &str, port: u16) -> Result<Self> {
        Self::connect(&DbConnectionInfo::tcp(db_id, host, port))
    }

    /// Connect over a unix socket.
    pub fn new_unix(db_id: u32, path: impl Into<PathBuf>) -> Result<Self> {
        Self::connect(&DbConnectionInfo::unix(db_id, path))
    }

    /// Open a fresh connection with the same parameters.
    pub fn duplicate(&self) -> Result<Self> {
        Self::connect(&self.info)
    }

    /// Logical database index.
    pub fn db_id(&self) -> u32 {
        self.info.db_id
    }

    /// Table separator configured for this database.
    pub fn separator(&self) -> &str {
        &self.info.separator
    }

    /// Endpoint this connection talks to.
    pub fn endpoint(&self) -> &Endpoint {
        &self.info.endpoint
    }

    /// Connection parameters.
    pub fn info(&self) -> &DbConnectionInfo {
        &self.info
    }

    /// Whether the server emits keyspace notifications.
    pub fn notify_keyspace_events(&self) -> bool {
        self.shared.config.notify_keyspace_events
    }

    /// True while neither the connection nor the server has been closed.
    pub fn is_connected(&self) -> bool {
        !self.conn.closed.load(Ordering::Acquire) && self.shared.is_running()
    }

    /// Close the connection and every subscription opened through it.
    pub fn close(&self) {
        self.conn.close();
        tracing::debug!("Closed connection to db {} at {}", self.info.db_id, self.info.endpoint);
    }

    fn unavailable(&self) -> StoreError {
        StoreError::Unavailable {
            endpoint: self.info.endpoint.to_string(),
        }
    }

    /// Run `f` atomically against this database.
    ///
    /// Commands run in order and are not rolled back if `f` fails part way.
    pub fn transaction<T, E, F>(&self, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&mut Transaction<'_>) -> std::result::Result<T, E>,
        E: From<StoreError>,
    {
        if !self.is_connected() {
            return Err(self.unavailable().into());
        }
        let db = self
            .shared
            .databases
            .get(self.info.db_id as usize)
            .ok_or_else(|| self.unavailable())?;
        let mut keyspace = db.lock();
        self.shared
            .metrics
            .transactions_total
            .fetch_add(1, Ordering::Relaxed);
        let mut tx = Transaction {
            keyspace: &mut *keyspace,
            connector: self,
        };
        f(&mut tx)
    }

    // =========================================================================
    // Single-command shortcuts
    // =========================================================================

    /// `EXISTS key`
    pub fn exists(&self, key: &str) -> Result<bool> {
        self.transaction(|tx| Ok(tx.exists(key)))
    }

    /// `KEYS pattern`
    pub fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        self.transaction(|tx| Ok(tx.keys(pattern)))
    }

    /// `DEL key`
    pub fn del(&self, key: &str) -> Result<bool> {
        self.transaction(|tx| Ok(tx.del(key)))
    }

    /// `GET key`
    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.transaction(|tx| tx.get(key))
    }

    /// `SET key value`
    pub fn set(&self, key: &str, value: impl Into<Vec<u8>>) -> Result<()> {
        let value = value.into();
        self.transaction(|tx| {
            tx.set(key, value);
            Ok(())
        })
    }

    /// `HGET key field`
    pub fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        self.transaction(|tx| tx.hget(key, field))
    }

    /// `HSET key field value`
    pub fn hset(&self, key: &str, field: &str, value: &str) -> Result<bool> {
        self.transaction(|tx| tx.hset(key, field, value))
    }

    /// `HGETALL key`
    pub fn hgetall(&self, key: &str) -> Result<Vec<FieldValue>> {
        self.transaction(|tx| tx.hgetall(key))
    }

    /// `LLEN key`
    pub fn llen(&self, key: &str) -> Result<usize> {
        self.transaction(|tx| tx.llen(key))
    }

    /// `PUBLISH channel payload`; returns the number of receivers.
    pub fn publish(&self, channel: &str, payload: &str) -> Result<usize> {
        self.transaction(|tx| Ok(tx.publish(channel, payload)))
    }

    /// `SUBSCRIBE channel`
    pub fn subscribe(&self, channel: &str) -> Result<Subscription> {
        self.transaction(|tx| Ok(tx.subscribe(channel)))
    }

    /// `PSUBSCRIBE pattern`
    pub fn psubscribe(&self, pattern: &str) -> Result<Subscription> {
        self.transaction(|tx| Ok(tx.psubscribe(pattern)))
    }
}

/// Commands executed while holding the database lock.
pub struct Transaction<'a> {
    keyspace: &'a mut Keyspace,
    connector: &'a DbConnector,
}

impl Transaction<'_> {
    fn notify(&self, event: &str, key: &str) {
        let shared = &self.connector.shared;
        if !shared.config.notify_keyspace_events {
            return;
        }
        let db_id = self.connector.info.db_id;
        shared.hub.publish(&keyspace_channel(db_id, key), event);
        shared.hub.publish(&keyevent_channel(db_id, event), key);
        shared
            .metrics
            .messages_published
            .fetch_add(2, Ordering::Relaxed);
    }

    /// Database index this transaction runs against.
    pub fn db_id(&self) -> u32 {
        self.connector.info.db_id
    }

    /// `EXISTS key`
    pub fn exists(&self, key: &str) -> bool {
        self.keyspace.exists(key)
    }

    /// `KEYS pattern` (sorted)
    pub fn keys(&self, pattern: &str) -> Vec<String> {
        self.keyspace.keys(pattern)
    }

    /// `DEL key`; returns whether the key existed.
    pub fn del(&mut self, key: &str) -> bool {
        let existed = self.keyspace.del(key);
        if existed {
            self.notify("del", key);
        }
        existed
    }

    /// `GET key`
    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.keyspace.get(key)
    }

    /// `SET key value`
    pub fn set(&mut self, key: &str, value: Vec<u8>) {
        self.keyspace.set(key, value);
        self.notify("set", key);
    }

    /// `HGET key field`
    pub fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        self.keyspace.hget(key, field)
    }

    /// `HGETALL key`, ordered by field name.
    pub fn hgetall(&self, key: &str) -> Result<Vec<FieldValue>> {
        Ok(self
            .keyspace
            .hgetall(key)?
            .into_iter()
            .map(|(field, value)| FieldValue { field, value })
            .collect())
    }

    /// `HSET key field value`; returns whether the field was new.
    pub fn hset(&mut self, key: &str, field: &str, value: &str) -> Result<bool> {
        let added = self.keyspace.hset(key, [(field, value)])?;
        self.notify("hset", key);
        Ok(added == 1)
    }

    /// `HSET key f1 v1 f2 v2 ...`; returns the number of new fields.
    ///
    /// An empty slice is a no-op and emits no notification.
    pub fn hset_many(&mut self, key: &str, fields: &[FieldValue]) -> Result<usize> {
        if fields.is_empty() {
            return Ok(0);
        }
        let added = self.keyspace.hset(
            key,
            fields.iter().map(|fv| (fv.field.as_str(), fv.value.as_str())),
        )?;
        self.notify("hset", key);
        Ok(added)
    }

    /// `HDEL key field`; returns whether the field existed.
    pub fn hdel(&mut self, key: &str, field: &str) -> Result<bool> {
        let (removed, emptied) = self.keyspace.hdel(key, field)?;
        if removed {
            self.notify("hdel", key);
        }
        if emptied {
            self.notify("del", key);
        }
        Ok(removed)
    }

    /// `HINCRBY key field delta`
    pub fn hincrby(&mut self, key: &str, field: &str, delta: i64) -> Result<i64> {
        let value = self.keyspace.hincrby(key, field, delta)?;
        self.notify("hincrby", key);
        Ok(value)
    }

    /// `RPUSH key v1 v2 ...`; returns the new length.
    pub fn rpush(&mut self, key: &str, values: Vec<Vec<u8>>) -> Result<usize> {
        let pushed = !values.is_empty();
        let len = self.keyspace.rpush(key, values)?;
        if pushed {
            self.notify("rpush", key);
        }
        Ok(len)
    }

    /// `LPOP key count`
    pub fn lpop(&mut self, key: &str, count: usize) -> Result<Vec<Vec<u8>>> {
        let popped = self.keyspace.lpop(key, count)?;
        if !popped.is_empty() {
            self.notify("lpop", key);
            if !self.keyspace.exists(key) {
                self.notify("del", key);
            }
        }
        Ok(popped)
    }

    /// `LLEN key`
    pub fn llen(&self, key: &str) -> Result<usize> {
        self.keyspace.llen(key)
    }

    /// `PUBLISH channel payload`; returns the number of receivers.
    pub fn publish(&mut self, channel: &str, payload: &str) -> usize {
        let shared = &self.connector.shared;
        shared
            .metrics
            .messages_published
            .fetch_add(1, Ordering::Relaxed);
        shared.hub.publish(channel, payload)
    }

    /// `SUBSCRIBE channel`
    ///
    /// Taken inside a transaction, the subscription sees exactly the
    /// messages published after the data read in the same transaction.
    pub fn subscribe(&mut self, channel: &str) -> Subscription {
        let mailbox = self.connector.shared.hub.subscribe(channel);
        self.register(mailbox, channel)
    }

    /// `PSUBSCRIBE pattern`
    pub fn psubscribe(&mut self, pattern: &str) -> Subscription {
        let mailbox = self.connector.shared.hub.psubscribe(pattern);
        self.register(mailbox, pattern)
    }

    fn register(&self, mailbox: Arc<Mailbox>, topic: &str) -> Subscription {
        let subscription =
            Subscription::new(mailbox, topic, self.connector.info.endpoint.to_string());
        self.connector.conn.track(&subscription);
        subscription
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::StoreServer;

    fn connect(server: &StoreServer, db_id: u32) -> DbConnector {
        DbConnector::connect(&server.connection_info(db_id)).unwrap()
    }

    #[test]
    fn connect_without_server_is_unavailable() {
        let result = DbConnector::new_tcp(0, "127.0.0.1", 1);
        assert!(matches!(result, Err(StoreError::Unavailable { .. })));
    }

    #[test]
    fn connect_checks_database_range() {
        let server = StoreServer::ephemeral().unwrap();
        let result = DbConnector::connect(&server.connection_info(16));
        assert!(matches!(result, Err(StoreError::InvalidDatabase { .. })));
    }

    #[test]
    fn databases_are_isolated() {
        let server = StoreServer::ephemeral().unwrap();
        let db0 = connect(&server, 0);
        let db1 = connect(&server, 1);

        db0.hset("T:a", "f", "v").unwrap();
        assert!(db0.exists("T:a").unwrap());
        assert!(!db1.exists("T:a").unwrap());
    }

    #[test]
    fn keyspace_notifications_follow_writes() {
        let server = StoreServer::ephemeral().unwrap();
        let db = connect(&server, 0);
        let sub = db.psubscribe("__keyspace@0__:T:*").unwrap();

        db.transaction(|tx| {
            tx.hset_many("T:a", &[FieldValue::new("x", "1")])?;
            tx.hdel("T:a", "x")?;
            tx.hset("U:b", "x", "1")?;
            Ok::<_, StoreError>(())
        })
        .unwrap();

        let events: Vec<(String, String)> = sub
            .drain()
            .unwrap()
            .into_iter()
            .map(|m| (m.channel, m.payload))
            .collect();
        assert_eq!(
            events,
            vec![
                ("__keyspace@0__:T:a".to_string(), "hset".to_string()),
                ("__keyspace@0__:T:a".to_string(), "hdel".to_string()),
                ("__keyspace@0__:T:a".to_string(), "del".to_string()),
            ]
        );
    }

    #[test]
    fn keyevent_channel_carries_key() {
        let server = StoreServer::ephemeral().unwrap();
        let db = connect(&server, 2);
        let sub = db.subscribe("__keyevent@2__:del").unwrap();

        db.set("k", "v").unwrap();
        assert!(db.del("k").unwrap());
        assert!(!db.del("k").unwrap());

        let msgs = sub.drain().unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].payload, "k");
    }

    #[test]
    fn notifications_off_when_disabled() {
        let server = StoreServer::start(crate::config::ServerConfig {
            port: 1,
            hostname: "notify-off.test".into(),
            ..Default::default()
        })
        .unwrap();
        let db = connect(&server, 0);
        let sub = db.psubscribe("__key*").unwrap();
        db.hset("k", "f", "v").unwrap();
        assert_eq!(sub.pending(), 0);
        assert!(!db.notify_keyspace_events());
    }

    #[test]
    fn close_fails_subscriptions_and_commands() {
        let server = StoreServer::ephemeral().unwrap();
        let db = connect(&server, 0);
        let other = db.duplicate().unwrap();
        let sub = db.subscribe("c").unwrap();

        db.close();
        assert!(!db.is_connected());
        assert!(matches!(sub.try_recv(), Err(StoreError::Unavailable { .. })));
        assert!(matches!(db.exists("k"), Err(StoreError::Unavailable { .. })));

        // Independent connection is unaffected
        assert!(other.is_connected());
        assert_eq!(other.publish("c", "x").unwrap(), 0);
    }

    #[test]
    fn server_shutdown_disconnects_clients() {
        let server = StoreServer::ephemeral().unwrap();
        let db = connect(&server, 0);
        server.shutdown();
        assert!(!db.is_connected());
        assert!(matches!(db.get("k"), Err(StoreError::Unavailable { .. })));
    }

    #[test]
    fn list_pop_is_atomic_across_connections() {
        let server = StoreServer::ephemeral().unwrap();
        let a = connect(&server, 0);
        let b = a.duplicate().unwrap();

        a.transaction(|tx| tx.rpush("q", (0u8..10).map(|i| vec![i]).collect()))
            .unwrap();
        let first = a.transaction(|tx| tx.lpop("q", 6)).unwrap();
        let second = b.transaction(|tx| tx.lpop("q", 6)).unwrap();

        assert_eq!(first.len(), 6);
        assert_eq!(second.len(), 4);
        assert_eq!(a.llen("q").unwrap(), 0);
    }
}
