use std::{ops::Range, sync::Arc};

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    config::QueryConfig,
    packet::VesselId,
    partition::Area,
    store::Store,
    Error,
};

mod builder;
mod handle;
pub mod merge;
mod shard;

pub use builder::{QueryBuilder, QueryPlan, Selector, ShardSpan};
pub use handle::{QueryControl, QueryHandle, QueryState};
pub use merge::{BoxedShard, MergeIterator, ShardSource, VecSource};
pub use shard::ShardProgressSnapshot;

use shard::{FetchPolicy, ShardProgress, ShardQuery};

/// Runs range queries against a [`Store`]. Every shard of a query pages
/// through its partitions on its own task; the consumer sees one
/// timestamp-ordered sequence.
///
/// Page fetches in flight are capped per engine, across all of its queries.
pub struct QueryEngine {
    store: Arc<dyn Store>,
    config: QueryConfig,
    permits: Arc<Semaphore>,
}

impl QueryEngine {
    pub fn new(store: Arc<dyn Store>, config: QueryConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_inflight_fetches.max(1)));
        QueryEngine {
            store,
            config,
            permits,
        }
    }

    pub fn config(&self) -> &QueryConfig {
        &self.config
    }

    /// Plans `query` and starts fetching the first page of every shard.
    /// Must be called from within a tokio runtime.
    pub fn execute(&self, query: QueryBuilder) -> Result<QueryHandle, Error> {
        let plan = query.plan(self.config.oversampling_factor)?;
        let page_size = plan.page_size.unwrap_or(self.config.page_size).max(1);
        let policy = FetchPolicy {
            timeout: self.config.fetch_timeout(),
            backoff: self.config.fetch_retry_backoff(),
            max_attempts: self.config.fetch_max_attempts,
        };
        debug!(
            shards = plan.shards.len(),
            start = plan.start_millis,
            stop = plan.stop_millis,
            resolution = ?plan.resolution,
            "executing query"
        );

        let cancel = CancellationToken::new();
        let mut progress = Vec::with_capacity(plan.shards.len());
        let mut sources: Vec<BoxedShard> = Vec::with_capacity(plan.shards.len());
        for span in plan.shards {
            let shard_progress = Arc::new(ShardProgress::new(span));
            progress.push(shard_progress.clone());
            let shard = ShardQuery {
                span,
                start_millis: plan.start_millis,
                stop_millis: plan.stop_millis,
                page_size,
                store: self.store.clone(),
                permits: self.permits.clone(),
                policy,
                progress: shard_progress,
            };
            sources.push(Box::new(shard.spawn(cancel.child_token())));
        }

        let control = QueryControl::new(cancel, progress);
        Ok(QueryHandle::new(MergeIterator::new(sources), control))
    }

    /// Every packet received in `interval`.
    pub fn query_by_time(&self, interval: Range<i64>) -> Result<QueryHandle, Error> {
        self.execute(QueryBuilder::for_time(interval))
    }

    /// Every packet of the given vessels in `interval`.
    pub fn query_by_vessel(
        &self,
        vessels: &[VesselId],
        interval: Range<i64>,
    ) -> Result<QueryHandle, Error> {
        self.execute(QueryBuilder::for_vessels(vessels.iter().copied(), interval))
    }

    /// Every positioned packet in the grid cells covering `area`. Cells are
    /// coarser than the area, so results may include packets just outside
    /// it.
    pub fn query_by_area(&self, area: Area, interval: Range<i64>) -> Result<QueryHandle, Error> {
        self.execute(QueryBuilder::for_area(area, interval))
    }
}
