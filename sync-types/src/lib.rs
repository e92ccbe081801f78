//! # sync-types
//!
//! Record encoding for statesync tables.
//!
//! This crate provides the foundational types used across all statesync crates:
//! - [`FieldValue`], [`KeyOperation`], [`KeyOpFieldsValues`] - Rows and change events
//! - [`ChangeRecord`] - Queued change event wrapper (MessagePack)
//! - [`NotificationMessage`] - Plain channel notifications (JSON)
//! - [`TableName`] - Store key naming conventions
//! - [`SyncError`] - Error types

#![warn(missing_docs)]
#![warn(clippy::all)]

mod envelope;
mod error;
pub mod naming;
mod notification;
mod record;

pub use envelope::{ChangeRecord, RECORD_VERSION};
pub use error::{Result, SyncError};
pub use naming::{TableName, CONFIG_SEPARATOR, DEFAULT_SEPARATOR};
pub use notification::NotificationMessage;
pub use record::{field_values, FieldValue, KeyOpFieldsValues, KeyOperation};
