use std::{
    cmp::Reverse,
    collections::{BinaryHeap, VecDeque},
};

use async_trait::async_trait;

use crate::{packet::PacketRecord, Error};

/// A source of time-ordered pages, one per shard of a query.
#[async_trait]
pub trait ShardSource: Send {
    /// The next page, or None once the shard is exhausted. Pages may be
    /// empty.
    async fn next_page(&mut self) -> Option<Result<Vec<PacketRecord>, Error>>;
}

pub type BoxedShard = Box<dyn ShardSource>;

#[async_trait]
impl ShardSource for BoxedShard {
    async fn next_page(&mut self) -> Option<Result<Vec<PacketRecord>, Error>> {
        self.as_mut().next_page().await
    }
}

struct Head<S> {
    source: Option<S>,
    buffered: VecDeque<PacketRecord>,
}

/// Merges time-ordered shards into one sequence ordered by timestamp. Records
/// with equal timestamps come out in shard order.
///
/// A shard is only asked for its next page once its buffered records are all
/// released, and only when the next record is asked for. The merge never
/// waits on a shard whose turn it is not, and never holds back a record it
/// already has.
pub struct MergeIterator<S> {
    heads: Vec<Head<S>>,
    heap: BinaryHeap<Reverse<(i64, usize)>>,
    primed: bool,
    failed: bool,
    /// Shard whose last buffered record was released and that must be
    /// refilled before the next pick.
    drained: Option<usize>,
}

impl<S> MergeIterator<S>
where
    S: ShardSource,
{
    pub fn new<J>(sources: J) -> Self
    where
        J: IntoIterator<Item = S>,
    {
        let heads: Vec<_> = sources
            .into_iter()
            .map(|s| Head {
                source: Some(s),
                buffered: VecDeque::new(),
            })
            .collect();
        MergeIterator {
            heap: BinaryHeap::with_capacity(heads.len()),
            heads,
            primed: false,
            failed: false,
            drained: None,
        }
    }

    /// Shards that may still produce records.
    pub fn live_shards(&self) -> usize {
        self.heads
            .iter()
            .filter(|h| h.source.is_some() || !h.buffered.is_empty())
            .count()
    }

    /// Pulls pages from shard `idx` until it has a record buffered or is
    /// exhausted.
    async fn refill(&mut self, idx: usize) -> Result<(), Error> {
        let head = &mut self.heads[idx];
        while head.buffered.is_empty() {
            let Some(source) = head.source.as_mut() else {
                return Ok(());
            };
            match source.next_page().await {
                Some(Ok(page)) => head.buffered.extend(page),
                Some(Err(e)) => {
                    head.source = None;
                    return Err(e);
                }
                None => head.source = None,
            }
        }
        if let Some(first) = head.buffered.front() {
            self.heap.push(Reverse((first.timestamp_millis(), idx)));
        }
        Ok(())
    }

    fn fail(&mut self, e: Error) -> Option<Result<PacketRecord, Error>> {
        self.failed = true;
        self.heap.clear();
        for head in &mut self.heads {
            head.source = None;
            head.buffered.clear();
        }
        Some(Err(e))
    }

    /// The next record in timestamp order. After an error is returned the
    /// iterator is finished.
    pub async fn next(&mut self) -> Option<Result<PacketRecord, Error>> {
        if self.failed {
            return None;
        }
        if let Some(idx) = self.drained {
            let refilled = self.refill(idx).await;
            self.drained = None;
            if let Err(e) = refilled {
                return self.fail(e);
            }
        }
        if !self.primed {
            self.primed = true;
            for idx in 0..self.heads.len() {
                if let Err(e) = self.refill(idx).await {
                    return self.fail(e);
                }
            }
        }

        let Reverse((_, idx)) = self.heap.pop()?;
        let record = self.heads[idx].buffered.pop_front()?;
        if self.heads[idx].buffered.is_empty() {
            self.drained = Some(idx);
        } else if let Some(next) = self.heads[idx].buffered.front() {
            self.heap.push(Reverse((next.timestamp_millis(), idx)));
        }
        Some(Ok(record))
    }
}

/// Pages held in memory. Used to merge already materialized results.
pub struct VecSource {
    pages: VecDeque<Result<Vec<PacketRecord>, Error>>,
}

impl VecSource {
    pub fn new<J>(pages: J) -> Self
    where
        J: IntoIterator<Item = Result<Vec<PacketRecord>, Error>>,
    {
        VecSource {
            pages: pages.into_iter().collect(),
        }
    }

    /// A single page holding `records`.
    pub fn from_records(records: Vec<PacketRecord>) -> Self {
        VecSource::new([Ok(records)])
    }
}

#[async_trait]
impl ShardSource for VecSource {
    async fn next_page(&mut self) -> Option<Result<Vec<PacketRecord>, Error>> {
        self.pages.pop_front()
    }
}
