//! # sync-store
//!
//! In-process key-value store for statesync.
//!
//! This crate provides the store the table layer runs against:
//! - [`StoreServer`] - Logical databases, pub/sub hub, endpoint registration
//! - [`DbConnector`] - Connection to one database, atomic [`Transaction`]s
//! - [`Subscription`] - Channel and pattern subscriptions with waker support
//! - [`StoreConfig`] - TOML configuration and database catalog
//!
//! ## Keyspace notifications
//!
//! When `notify_keyspace_events` is enabled every write publishes the
//! command name on `__keyspace@<db>__:<key>` and the key on
//! `__keyevent@<db>__:<command>`, before the transaction releases its lock.
//!
//! ## Not provided
//!
//! Persistence, eviction, expiry, replication and a network listener.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod connector;
pub mod error;
mod keyspace;
pub mod pubsub;
pub mod server;

pub use config::{ConfigError, DatabaseConfig, DbConnectionInfo, Endpoint, ServerConfig, StoreConfig};
pub use connector::{DbConnector, Transaction};
pub use error::{Result, StoreError};
pub use pubsub::{pattern_matches, PubSubMessage, Subscription};
pub use server::{StoreMetrics, StoreServer};
