//! Store server lifecycle.
//!
//! A [`StoreServer`] owns the databases and the pub/sub hub. While running it
//! is registered under each of its endpoints, which is how
//! [`DbConnector`](crate::DbConnector) finds it.

use crate::config::{DbConnectionInfo, Endpoint, ServerConfig};
use crate::error::{Result, StoreError};
use crate::keyspace::Keyspace;
use crate::pubsub::PubSubHub;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

/// First port handed out by [`StoreServer::ephemeral`].
const EPHEMERAL_PORT_BASE: u16 = 40000;

static NEXT_EPHEMERAL_PORT: AtomicU16 = AtomicU16::new(EPHEMERAL_PORT_BASE);

fn registry() -> &'static DashMap<Endpoint, Arc<ServerShared>> {
    static REGISTRY: OnceLock<DashMap<Endpoint, Arc<ServerShared>>> = OnceLock::new();
    REGISTRY.get_or_init(DashMap::new)
}

/// Look up the running server behind an endpoint.
pub(crate) fn lookup(endpoint: &Endpoint) -> Option<Arc<ServerShared>> {
    registry()
        .get(endpoint)
        .map(|entry| Arc::clone(entry.value()))
        .filter(|shared| shared.is_running())
}

/// Operational counters.
///
/// All counters are monotonically increasing for the lifetime of the server.
#[derive(Debug, Default)]
pub struct StoreMetrics {
    /// Connections opened.
    pub connections_total: AtomicU64,
    /// Transactions executed.
    pub transactions_total: AtomicU64,
    /// Messages published (explicit publishes and notifications).
    pub messages_published: AtomicU64,
}

/// State shared between a server and its connections.
#[derive(Debug)]
pub(crate) struct ServerShared {
    pub(crate) config: ServerConfig,
    running: AtomicBool,
    pub(crate) databases: Vec<Mutex<Keyspace>>,
    pub(crate) hub: PubSubHub,
    pub(crate) metrics: StoreMetrics,
}

impl ServerShared {
    fn new(config: ServerConfig) -> Self {
        let databases = (0..config.databases)
            .map(|_| Mutex::new(Keyspace::new()))
            .collect();
        Self {
            config,
            running: AtomicBool::new(true),
            databases,
            hub: PubSubHub::new(),
            metrics: StoreMetrics::default(),
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// An in-process store server.
///
/// The server stops when [`shutdown`](Self::shutdown) is called or when it is
/// dropped. Connections opened against it fail from then on.
#[derive(Debug)]
pub struct StoreServer {
    shared: Arc<ServerShared>,
    endpoints: Vec<Endpoint>,
}

impl StoreServer {
    /// Start a server answering on every endpoint of `config`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::AddressInUse`] if a running server already
    /// answers on one of the endpoints.
    pub fn start(config: ServerConfig) -> Result<Self> {
        let endpoints = config.endpoints();
        let shared = Arc::new(ServerShared::new(config));

        let mut claimed: Vec<Endpoint> = Vec::with_capacity(endpoints.len());
        for endpoint in &endpoints {
            if let Err(err) = claim(endpoint, &shared) {
                for endpoint in &claimed {
                    release(endpoint, &shared);
                }
                return Err(err);
            }
            claimed.push(endpoint.clone());
        }

        tracing::info!(
            "Store server started on {} ({} databases, keyspace notifications {})",
            endpoints
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", "),
            shared.config.databases,
            if shared.config.notify_keyspace_events {
                "on"
            } else {
                "off"
            }
        );

        Ok(Self { shared, endpoints })
    }

    /// Start a server on a free loopback port with keyspace notifications on.
    ///
    /// Intended for tests: each call gets its own isolated server.
    pub fn ephemeral() -> Result<Self> {
        let mut last_err = None;
        for _ in 0..=u16::MAX - EPHEMERAL_PORT_BASE {
            let port = next_ephemeral_port();
            let config = ServerConfig {
                port,
                notify_keyspace_events: true,
                ..ServerConfig::default()
            };
            match Self::start(config) {
                Ok(server) => return Ok(server),
                Err(err @ StoreError::AddressInUse { .. }) => last_err = Some(err),
                Err(err) => return Err(err),
            }
        }
        Err(last_err.unwrap_or(StoreError::AddressInUse {
            endpoint: "127.0.0.1".into(),
        }))
    }

    /// The server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    /// The primary (TCP) endpoint.
    pub fn endpoint(&self) -> &Endpoint {
        // start() always registers the TCP endpoint first
        &self.endpoints[0]
    }

    /// Every endpoint this server answers on.
    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    /// Connection info for database `db_id` on the primary endpoint.
    pub fn connection_info(&self, db_id: u32) -> DbConnectionInfo {
        DbConnectionInfo {
            db_id,
            endpoint: self.endpoint().clone(),
            separator: sync_types::DEFAULT_SEPARATOR.to_string(),
        }
    }

    /// Operational counters.
    pub fn metrics(&self) -> &StoreMetrics {
        &self.shared.metrics
    }

    /// Number of keys in database `db_id`.
    pub fn dbsize(&self, db_id: u32) -> Result<usize> {
        let db = self
            .shared
            .databases
            .get(db_id as usize)
            .ok_or(StoreError::InvalidDatabase {
                db_id,
                databases: self.shared.config.databases,
            })?;
        Ok(db.lock().len())
    }

    /// True until the server is shut down.
    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    /// Stop the server. Idempotent.
    ///
    /// Endpoints are released and every open subscription is closed.
    pub fn shutdown(&self) {
        if !self.shared.running.swap(false, Ordering::AcqRel) {
            return;
        }
        for endpoint in &self.endpoints {
            release(endpoint, &self.shared);
        }
        self.shared.hub.close_all();
        let metrics = &self.shared.metrics;
        tracing::info!(
            "Store server on {} stopped ({} connections, {} transactions, {} messages)",
            self.endpoint(),
            metrics.connections_total.load(Ordering::Relaxed),
            metrics.transactions_total.load(Ordering::Relaxed),
            metrics.messages_published.load(Ordering::Relaxed)
        );
    }
}

impl Drop for StoreServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn next_ephemeral_port() -> u16 {
    let port = NEXT_EPHEMERAL_PORT.fetch_add(1, Ordering::Relaxed);
    if port < EPHEMERAL_PORT_BASE {
        // Wrapped around
        NEXT_EPHEMERAL_PORT.store(EPHEMERAL_PORT_BASE + 1, Ordering::Relaxed);
        EPHEMERAL_PORT_BASE
    } else {
        port
    }
}

fn claim(endpoint: &Endpoint, shared: &Arc<ServerShared>) -> Result<()> {
    match registry().entry(endpoint.clone()) {
        Entry::Occupied(mut entry) => {
            if entry.get().is_running() {
                return Err(StoreError::AddressInUse {
                    endpoint: endpoint.to_string(),
                });
            }
            entry.insert(Arc::clone(shared));
        }
        Entry::Vacant(entry) => {
            entry.insert(Arc::clone(shared));
        }
    }
    Ok(())
}

fn release(endpoint: &Endpoint, shared: &Arc<ServerShared>) {
    registry().remove_if(endpoint, |_, current| Arc::ptr_eq(current, shared));
}
