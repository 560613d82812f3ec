use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, AtomicU8, Ordering},
        Arc,
    },
};

use futures::Stream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{packet::PacketRecord, Error};

use super::{
    merge::{BoxedShard, MergeIterator},
    shard::{ShardProgress, ShardProgressSnapshot},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryState {
    Running = 0,
    /// Every shard is exhausted. Records fetched but not read yet can still
    /// be read.
    Done = 1,
    Cancelled = 2,
    /// A shard could not be read. Records released before the failure stay
    /// valid.
    Failed = 3,
}

impl From<u8> for QueryState {
    fn from(value: u8) -> Self {
        match value {
            1 => QueryState::Done,
            2 => QueryState::Cancelled,
            3 => QueryState::Failed,
            _ => QueryState::Running,
        }
    }
}

impl fmt::Display for QueryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            QueryState::Running => "RUNNING",
            QueryState::Done => "DONE",
            QueryState::Cancelled => "CANCELLED",
            QueryState::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
struct Control {
    state: AtomicU8,
    released: AtomicU64,
    cancel: CancellationToken,
    shards: Vec<Arc<ShardProgress>>,
}

/// Thread-safe view of a running query, for observing or cancelling it from
/// somewhere other than the consumer.
#[derive(Debug, Clone)]
pub struct QueryControl {
    inner: Arc<Control>,
}

impl QueryControl {
    pub(crate) fn new(cancel: CancellationToken, shards: Vec<Arc<ShardProgress>>) -> Self {
        QueryControl {
            inner: Arc::new(Control {
                state: AtomicU8::new(QueryState::Running as u8),
                released: AtomicU64::new(0),
                cancel,
                shards,
            }),
        }
    }

    pub fn state(&self) -> QueryState {
        let state = self.stored_state();
        if state == QueryState::Running && self.fetch_complete() {
            self.mark_done();
            return self.stored_state();
        }
        state
    }

    fn stored_state(&self) -> QueryState {
        self.inner.state.load(Ordering::Acquire).into()
    }

    /// Whether every shard has fetched its last page.
    fn fetch_complete(&self) -> bool {
        self.inner.shards.iter().all(|s| s.is_exhausted())
    }

    fn mark_done(&self) {
        if self.finish(QueryState::Done) {
            info!(released = self.released(), "query done");
        }
    }

    /// Records handed to the consumer so far.
    pub fn released(&self) -> u64 {
        self.inner.released.load(Ordering::Acquire)
    }

    /// Best effort: fetches in flight complete and are discarded. Has no
    /// effect once the query finished, including when every shard is
    /// exhausted.
    pub fn cancel(&self) {
        if self.state() != QueryState::Running {
            return;
        }
        if self.finish(QueryState::Cancelled) {
            debug!(released = self.released(), "query cancelled");
        }
        self.inner.cancel.cancel();
    }

    pub fn progress(&self) -> Vec<ShardProgressSnapshot> {
        self.inner.shards.iter().map(|s| s.snapshot()).collect()
    }

    /// A read failure overrides `Done`, which may have been reached while
    /// undecoded rows were still buffered.
    fn fail(&self) -> bool {
        self.inner
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
                match QueryState::from(s) {
                    QueryState::Running | QueryState::Done => Some(QueryState::Failed as u8),
                    _ => None,
                }
            })
            .is_ok()
    }

    /// Leaves `Running` for `to`. Returns false if the query already ended.
    fn finish(&self, to: QueryState) -> bool {
        self.inner
            .state
            .compare_exchange(
                QueryState::Running as u8,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

/// A lazy, timestamp-ordered sequence of query results.
pub struct QueryHandle {
    merge: MergeIterator<BoxedShard>,
    control: QueryControl,
    /// The merge returned its last record.
    finished: bool,
}

impl QueryHandle {
    pub(crate) fn new(merge: MergeIterator<BoxedShard>, control: QueryControl) -> Self {
        QueryHandle {
            merge,
            control,
            finished: false,
        }
    }

    pub fn control(&self) -> QueryControl {
        self.control.clone()
    }

    pub fn state(&self) -> QueryState {
        self.control.state()
    }

    pub fn released(&self) -> u64 {
        self.control.released()
    }

    pub fn cancel(&self) {
        self.control.cancel()
    }

    pub fn progress(&self) -> Vec<ShardProgressSnapshot> {
        self.control.progress()
    }

    /// The next record, None once the query is done or cancelled. After an
    /// error the query is `Failed` and yields nothing more.
    pub async fn next(&mut self) -> Option<Result<PacketRecord, Error>> {
        if self.finished {
            return None;
        }
        match self.control.stored_state() {
            QueryState::Running | QueryState::Done => {}
            QueryState::Cancelled | QueryState::Failed => return None,
        }
        let cancel = self.control.inner.cancel.clone();
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.control.finish(QueryState::Cancelled);
                return None;
            }
            next = self.merge.next() => next,
        };

        match next {
            Some(Ok(record)) => {
                self.control.inner.released.fetch_add(1, Ordering::AcqRel);
                Some(Ok(record))
            }
            Some(Err(e)) => {
                self.finished = true;
                if self.control.fail() {
                    warn!(error = %e, released = self.released(), "query failed");
                }
                self.control.inner.cancel.cancel();
                Some(Err(e))
            }
            None => {
                self.finished = true;
                self.control.mark_done();
                None
            }
        }
    }

    /// Every remaining record, in order. Stops early without error if the
    /// query is cancelled.
    pub async fn collect(mut self) -> Result<Vec<PacketRecord>, Error> {
        let mut out = Vec::new();
        while let Some(record) = self.next().await {
            out.push(record?);
        }
        Ok(out)
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<PacketRecord, Error>> {
        futures::stream::unfold(self, |mut handle| async move {
            let item = handle.next().await?;
            Some((item, handle))
        })
    }
}

impl Drop for QueryHandle {
    fn drop(&mut self) {
        self.control.inner.cancel.cancel();
    }
}
