use std::{
    collections::{BTreeMap, HashMap},
    ops::Bound,
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};

use crate::partition::{PartitionKey, SortKey};

use super::{Row, Store, StoreError, WriteEntry};

#[derive(Debug)]
struct Faults {
    available: bool,
    failing_writes: usize,
    failing_scans: usize,
    write_delay: Option<Duration>,
    scan_delay: Option<Duration>,
}

impl Default for Faults {
    fn default() -> Self {
        Faults {
            available: true,
            failing_writes: 0,
            failing_scans: 0,
            write_delay: None,
            scan_delay: None,
        }
    }
}

/// An in-process [`Store`] with fault injection, used by tests and local
/// runs.
#[derive(Debug, Default)]
pub struct MemStore {
    partitions: RwLock<HashMap<PartitionKey, BTreeMap<SortKey, Bytes>>>,
    faults: Mutex<Faults>,
    batches_written: AtomicUsize,
    scans: AtomicUsize,
}

impl MemStore {
    pub fn new() -> Self {
        MemStore::default()
    }

    /// While unavailable every operation fails with
    /// [`StoreError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.faults.lock().available = available;
    }

    pub fn is_available(&self) -> bool {
        self.faults.lock().available
    }

    /// Fails the next `n` batch writes with a backend error.
    pub fn fail_next_writes(&self, n: usize) {
        self.faults.lock().failing_writes = n;
    }

    /// Fails the next `n` scans with a backend error.
    pub fn fail_next_scans(&self, n: usize) {
        self.faults.lock().failing_scans = n;
    }

    pub fn set_write_delay(&self, delay: Option<Duration>) {
        self.faults.lock().write_delay = delay;
    }

    pub fn set_scan_delay(&self, delay: Option<Duration>) {
        self.faults.lock().scan_delay = delay;
    }

    /// Total number of rows over all partitions.
    pub fn row_count(&self) -> usize {
        self.partitions.read().values().map(|p| p.len()).sum()
    }

    pub fn partition_rows(&self, partition: &PartitionKey) -> Vec<Row> {
        self.partitions
            .read()
            .get(partition)
            .map(|rows| {
                rows.iter()
                    .map(|(k, v)| Row {
                        sort_key: *k,
                        payload: v.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn partition_keys(&self) -> Vec<PartitionKey> {
        let mut keys: Vec<_> = self.partitions.read().keys().copied().collect();
        keys.sort();
        keys
    }

    /// Number of batches that were applied.
    pub fn batches_written(&self) -> usize {
        self.batches_written.load(Ordering::SeqCst)
    }

    /// Number of scans that were served, successfully or not.
    pub fn scans(&self) -> usize {
        self.scans.load(Ordering::SeqCst)
    }

    fn check(&self, write: bool) -> Result<(), StoreError> {
        let mut faults = self.faults.lock();
        if !faults.available {
            return Err(StoreError::Unavailable("no replica reachable".into()));
        }
        let failing = if write {
            &mut faults.failing_writes
        } else {
            &mut faults.failing_scans
        };
        if *failing > 0 {
            *failing -= 1;
            return Err(StoreError::Backend("injected failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Store for MemStore {
    async fn write_batch(&self, entries: &[WriteEntry]) -> Result<(), StoreError> {
        let delay = self.faults.lock().write_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.check(true)?;

        let mut partitions = self.partitions.write();
        for entry in entries {
            partitions
                .entry(entry.partition)
                .or_default()
                .insert(entry.sort_key, entry.payload.clone());
        }
        self.batches_written.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn scan_page(
        &self,
        partition: &PartitionKey,
        after: Bound<SortKey>,
        before: SortKey,
        limit: usize,
    ) -> Result<Vec<Row>, StoreError> {
        self.scans.fetch_add(1, Ordering::SeqCst);
        let delay = self.faults.lock().scan_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.check(false)?;

        let empty = match after {
            Bound::Included(k) | Bound::Excluded(k) => k >= before,
            Bound::Unbounded => false,
        };
        if empty {
            return Ok(Vec::new());
        }

        let partitions = self.partitions.read();
        let rows = match partitions.get(partition) {
            None => Vec::new(),
            Some(rows) => rows
                .range((after, Bound::Excluded(before)))
                .take(limit)
                .map(|(k, v)| Row {
                    sort_key: *k,
                    payload: v.clone(),
                })
                .collect(),
        };
        Ok(rows)
    }
}
