use std::{
    ops::Bound,
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    packet::PacketRecord,
    partition::{time_block, PartitionKey, SortKey},
    store::{Row, Store, StoreError},
    Error,
};

use super::{builder::ShardSpan, merge::ShardSource};

/// What a running shard has fetched so far.
#[derive(Debug)]
pub struct ShardProgress {
    span: ShardSpan,
    rows: AtomicU64,
    pages: AtomicU64,
    latest_millis: AtomicI64,
    exhausted: AtomicBool,
}

/// Point-in-time copy of a [`ShardProgress`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardProgressSnapshot {
    pub span: ShardSpan,
    pub rows: u64,
    pub pages: u64,
    /// Timestamp of the last row fetched.
    pub latest_millis: Option<i64>,
    pub exhausted: bool,
}

impl ShardProgress {
    pub(crate) fn new(span: ShardSpan) -> Self {
        ShardProgress {
            span,
            rows: AtomicU64::new(0),
            pages: AtomicU64::new(0),
            latest_millis: AtomicI64::new(i64::MIN),
            exhausted: AtomicBool::new(false),
        }
    }

    fn record_page(&self, rows: &[Row]) {
        self.pages.fetch_add(1, Ordering::Relaxed);
        self.rows.fetch_add(rows.len() as u64, Ordering::Relaxed);
        if let Some(last) = rows.last() {
            self.latest_millis
                .fetch_max(last.sort_key.timestamp_millis, Ordering::Relaxed);
        }
    }

    pub(crate) fn is_exhausted(&self) -> bool {
        self.exhausted.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> ShardProgressSnapshot {
        let latest = self.latest_millis.load(Ordering::Relaxed);
        ShardProgressSnapshot {
            span: self.span,
            rows: self.rows.load(Ordering::Relaxed),
            pages: self.pages.load(Ordering::Relaxed),
            latest_millis: (latest != i64::MIN).then_some(latest),
            exhausted: self.exhausted.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct FetchPolicy {
    pub timeout: Duration,
    pub backoff: Duration,
    pub max_attempts: u32,
}

struct Page {
    partition: PartitionKey,
    rows: Vec<Row>,
}

/// Pages through the partitions of one shard on its own task, one page ahead
/// of the consumer.
pub(crate) struct ShardQuery {
    pub span: ShardSpan,
    pub start_millis: i64,
    pub stop_millis: i64,
    pub page_size: usize,
    pub store: Arc<dyn Store>,
    pub permits: Arc<Semaphore>,
    pub policy: FetchPolicy,
    pub progress: Arc<ShardProgress>,
}

impl ShardQuery {
    /// Starts fetching the first page right away.
    pub(crate) fn spawn(self, ct: CancellationToken) -> ShardReceiver {
        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(self.run(tx, ct));
        ShardReceiver { rx }
    }

    async fn run(self, tx: mpsc::Sender<Result<Page, Error>>, ct: CancellationToken) {
        let (mut block, last_block) = match self.span {
            ShardSpan::Partition(_) => (0, 0),
            ShardSpan::TimeBlocks { first, last } => (first, last),
        };
        let before = SortKey::lowest_at(self.stop_millis);
        let mut after = Bound::Included(SortKey::lowest_at(self.start_millis));

        while block <= last_block {
            if ct.is_cancelled() {
                return;
            }
            let partition = match self.span {
                ShardSpan::Partition(key) => key,
                ShardSpan::TimeBlocks { .. } => PartitionKey::TimeBlock(block),
            };

            let rows = match self.fetch(&partition, after, before).await {
                Ok(rows) => rows,
                Err(e) => {
                    warn!(shard = %self.span, %partition, error = %e, "shard query failed");
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            };
            self.progress.record_page(&rows);

            // A short page means the current partition has nothing more in
            // the interval.
            if rows.len() < self.page_size {
                block += 1;
            }
            if let Some(last) = rows.last() {
                after = Bound::Excluded(last.sort_key);
                if let ShardSpan::TimeBlocks { .. } = self.span {
                    block = block.max(time_block(last.sort_key.timestamp_millis));
                }
            }

            if rows.is_empty() {
                continue;
            }
            tokio::select! {
                _ = ct.cancelled() => return,
                sent = tx.send(Ok(Page { partition, rows })) => {
                    if sent.is_err() {
                        return;
                    }
                }
            }
        }
        self.progress.exhausted.store(true, Ordering::Release);
        debug!(shard = %self.span, rows = self.progress.rows.load(Ordering::Relaxed), "shard exhausted");
    }

    /// One page, with a bounded wait per attempt and a fixed backoff between
    /// attempts.
    async fn fetch(
        &self,
        partition: &PartitionKey,
        after: Bound<SortKey>,
        before: SortKey,
    ) -> Result<Vec<Row>, Error> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = {
                let _permit = self
                    .permits
                    .acquire()
                    .await
                    .map_err(|e| Error::Other(e.into()))?;
                match tokio::time::timeout(
                    self.policy.timeout,
                    self.store
                        .scan_page(partition, after, before, self.page_size),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(StoreError::Timeout(self.policy.timeout)),
                }
            };

            match result {
                Ok(rows) => return Ok(rows),
                Err(e) if attempt < max_attempts => {
                    debug!(%partition, attempt, transient = e.is_transient(), error = %e, "page fetch failed, retrying");
                    tokio::time::sleep(self.policy.backoff).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Consumer end of a [`ShardQuery`]. Rows are decoded here, on the caller's
/// side.
pub(crate) struct ShardReceiver {
    rx: mpsc::Receiver<Result<Page, Error>>,
}

#[async_trait]
impl ShardSource for ShardReceiver {
    async fn next_page(&mut self) -> Option<Result<Vec<PacketRecord>, Error>> {
        let page = match self.rx.recv().await? {
            Ok(page) => page,
            Err(e) => return Some(Err(e)),
        };
        let partition = page.partition;
        let records = page
            .rows
            .iter()
            .map(|row| {
                PacketRecord::from_bytes(&row.payload).map_err(|e| Error::CorruptRow {
                    partition,
                    reason: format!("{:#}", e),
                })
            })
            .collect();
        Some(records)
    }
}
