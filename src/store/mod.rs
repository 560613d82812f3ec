//! The wide-column backend the archive writes into.
//!
//! The archive only needs two things from a backend: an idempotent batched
//! upsert keyed by (partition, sort key), and an ordered, paged range scan
//! inside one partition. Everything else (replication, consistency levels,
//! connection pooling) is the backend's business.

use std::{ops::Bound, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::partition::{PartitionKey, SortKey};

pub mod memory;

pub use memory::MemStore;

/// One row to upsert.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteEntry {
    pub partition: PartitionKey,
    pub sort_key: SortKey,
    pub payload: Bytes,
}

/// One row as returned by a scan.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub sort_key: SortKey,
    pub payload: Bytes,
}

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("store error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Whether retrying the same operation later can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Timeout(_))
    }
}

#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Upserts every entry. Writing an entry that already exists leaves the
    /// partition unchanged, so a batch can be retried safely. A failed batch
    /// may have been partially applied.
    async fn write_batch(&self, entries: &[WriteEntry]) -> Result<(), StoreError>;

    /// Up to `limit` rows of `partition` with `after < sort_key < before` (or
    /// `<=` for an included lower bound), in ascending sort key order.
    async fn scan_page(
        &self,
        partition: &PartitionKey,
        after: Bound<SortKey>,
        before: SortKey,
        limit: usize,
    ) -> Result<Vec<Row>, StoreError>;
}
