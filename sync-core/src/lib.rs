//! # sync-core
//!
//! Table state synchronization for statesync.
//!
//! This crate implements the table layer on top of `sync-store`:
//! - [`Table`] - Direct row access
//! - [`ProducerStateTable`] / [`ConsumerStateTable`] - Queued change events
//!   with exactly-once delivery per event
//! - [`SubscriberStateTable`] - Change events derived from keyspace notifications
//! - [`NotificationProducer`] / [`NotificationConsumer`] - Fire-and-forget messages
//! - [`Select`] - Waits on any mix of tables, [`SelectableTimer`]s and
//!   [`SelectableEvent`]s
//!
//! ## Event loop
//!
//! ```text
//! writer ── ProducerStateTable ──► _T_EVENTS + T_CHANNEL ──► ConsumerStateTable ─┐
//! writer ── Table ───────────────► __keyspace@db__:T:* ───► SubscriberStateTable ┤
//!                                                                      Select ◄──┘
//! ```
//!
//! The reader blocks in [`Select::select`] until one of its tables is ready,
//! then pops the buffered events in publish order.
//!
//! ## Features
//!
//! - `async` (default): [`TableReaderAsync`] adapters built on tokio

#![warn(missing_docs)]
#![warn(clippy::all)]

#[cfg(feature = "async")]
pub mod async_util;
pub mod buffer;
pub mod consumer;
pub mod event;
pub mod notification;
pub mod producer;
pub mod reader;
pub mod select;
pub mod subscriber;
pub mod table;
pub mod timer;

#[cfg(feature = "async")]
pub use async_util::TableReaderAsync;
pub use buffer::EventBuffer;
pub use consumer::ConsumerStateTable;
pub use event::SelectableEvent;
pub use notification::{NotificationConsumer, NotificationProducer};
pub use producer::ProducerStateTable;
pub use reader::{TableReader, DEFAULT_POP_BATCH_SIZE};
pub use select::{Interrupter, Select, SelectResult, Selectable, SelectableId};
pub use subscriber::SubscriberStateTable;
pub use table::Table;
pub use timer::SelectableTimer;

pub use sync_store::{DbConnectionInfo, DbConnector, StoreConfig, StoreServer};
pub use sync_types::{field_values, FieldValue, KeyOpFieldsValues, KeyOperation, Result, SyncError};
