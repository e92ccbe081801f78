//! Async adapters for table readers.
//!
//! [`TableReader::read_data`] blocks the calling thread. These adapters run
//! it on tokio's blocking pool so async code can wait on a table without
//! stalling the runtime.
//!
//! ```rust,ignore
//! use statesync_core::{ConsumerStateTable, TableReaderAsync};
//! use std::sync::Arc;
//!
//! async fn drain(consumer: Arc<ConsumerStateTable>) {
//!     let events = consumer.pops_async(None).await.unwrap();
//! }
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use sync_types::{KeyOpFieldsValues, Result, SyncError};

use crate::reader::TableReader;
use crate::select::SelectResult;

/// Async versions of the blocking [`TableReader`] calls.
pub trait TableReaderAsync: Send + Sync {
    /// Async version of [`TableReader::read_data`].
    fn read_data_async(
        &self,
        timeout: Option<Duration>,
    ) -> impl Future<Output = Result<SelectResult>> + Send;

    /// Wait for data like `read_data_async`, then take everything available.
    ///
    /// Returns an empty vector if the timeout elapses first.
    fn pops_async(
        &self,
        timeout: Option<Duration>,
    ) -> impl Future<Output = Result<Vec<KeyOpFieldsValues>>> + Send;
}

fn join_error(err: tokio::task::JoinError) -> SyncError {
    SyncError::Select(format!("spawn_blocking join error: {}", err))
}

// Blanket implementation for shared readers
impl<T: TableReader> TableReaderAsync for Arc<T> {
    async fn read_data_async(&self, timeout: Option<Duration>) -> Result<SelectResult> {
        let reader = Arc::clone(self);
        tokio::task::spawn_blocking(move || reader.read_data(timeout))
            .await
            .map_err(join_error)?
    }

    async fn pops_async(&self, timeout: Option<Duration>) -> Result<Vec<KeyOpFieldsValues>> {
        let reader = Arc::clone(self);
        tokio::task::spawn_blocking(move || match reader.read_data(timeout)? {
            SelectResult::Object(_) => reader.pops(),
            SelectResult::Timeout | SelectResult::Signal => Ok(Vec::new()),
        })
        .await
        .map_err(join_error)?
    }
}
