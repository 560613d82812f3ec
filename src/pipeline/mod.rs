//! Ingestion: a bounded queue in front of a batching store writer, with a
//! detour through local spill files while the store is failing or the queue is
//! full.
//!
//! ```text
//!  submit ──▶ [queue] ──▶ batcher ──▶ Store
//!    │ full      ▲           │ write failed
//!    ▼           │           ▼
//!  (caller)   backfill ◀── spill files
//! ```
//!
//! `submit` never blocks. It rejects once the queue holds `high_water` records
//! and the caller decides what to do with the record; [`IngestionPipeline::ingest`]
//! hands it to the spill stage, which appends queued records in groups with
//! one fsync each, off the async workers. Backfill only feeds the queue up to `high_water - batch_size`, so
//! live traffic always has a batch worth of room that replayed records cannot
//! take.

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    config::{Config, PipelineConfig, SpillConfig},
    packet::PacketRecord,
    partition::PartitionScheme,
    spill::{self, SpillWriter},
    store::Store,
    tracker::PositionTracker,
    Error,
};

mod backfill;
mod batcher;
mod spiller;

use spiller::SpillCmd;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineState {
    /// Records flow from the queue to the store.
    Accepting = 0,
    /// A write failed or the queue overflowed. New work is spilled.
    Degraded = 1,
    /// Spilled records are being replayed into the queue.
    Backfilling = 2,
}

impl From<u8> for PipelineState {
    fn from(value: u8) -> Self {
        match value {
            1 => PipelineState::Degraded,
            2 => PipelineState::Backfilling,
            _ => PipelineState::Accepting,
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PipelineState::Accepting => "ACCEPTING",
            PipelineState::Degraded => "DEGRADED",
            PipelineState::Backfilling => "BACKFILLING",
        };
        f.write_str(s)
    }
}

/// Outcome of [`IngestionPipeline::submit`].
#[must_use]
#[derive(Debug, Clone, PartialEq)]
pub enum Submit {
    Accepted,
    /// The queue is full; the record is handed back.
    Rejected(PacketRecord),
}

impl Submit {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Submit::Accepted)
    }
}

/// Where [`IngestionPipeline::ingest`] put a record.
#[must_use]
#[derive(Debug, Clone, PartialEq)]
pub enum Ingested {
    Queued,
    /// Handed to the spill stage. It is on disk once
    /// [`IngestionPipeline::flush_spill`] returns.
    Spilled,
    /// Both the queue and the spill stage are full; the record is handed
    /// back.
    Rejected(PacketRecord),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineStats {
    pub state: PipelineState,
    pub queue_depth: usize,
    /// Records acknowledged by the store.
    pub processed: u64,
    /// Records appended to spill files.
    pub spilled: u64,
    /// Records read back from spill files into the queue.
    pub replayed: u64,
    /// Records that could neither be written nor spilled.
    pub lost: u64,
    /// Sealed spill files waiting for backfill.
    pub spill_files: usize,
    /// Vessels with a last known position.
    pub tracked_vessels: usize,
}

/// State shared by the pipeline handle and its tasks.
pub(crate) struct Shared {
    config: PipelineConfig,
    spill_config: SpillConfig,
    tx: mpsc::Sender<PacketRecord>,
    spill_tx: mpsc::Sender<SpillCmd>,
    depth: AtomicUsize,
    state: AtomicU8,
    processed: AtomicU64,
    spilled: AtomicU64,
    replayed: AtomicU64,
    lost: AtomicU64,
    spill: Mutex<SpillWriter>,
    scheme: PartitionScheme,
    store: Arc<dyn Store>,
}

impl Shared {
    fn new(
        config: PipelineConfig,
        spill: SpillWriter,
        scheme: PartitionScheme,
        store: Arc<dyn Store>,
    ) -> (
        Shared,
        mpsc::Receiver<PacketRecord>,
        mpsc::Receiver<SpillCmd>,
    ) {
        let spill_config = spill.config().clone();
        let (tx, rx) = mpsc::channel(config.high_water().max(1));
        let (spill_tx, spill_rx) = mpsc::channel(spill_config.queue_capacity.max(1));
        let shared = Shared {
            config,
            spill_config,
            tx,
            spill_tx,
            depth: AtomicUsize::new(0),
            state: AtomicU8::new(PipelineState::Accepting as u8),
            processed: AtomicU64::new(0),
            spilled: AtomicU64::new(0),
            replayed: AtomicU64::new(0),
            lost: AtomicU64::new(0),
            spill: Mutex::new(spill),
            scheme,
            store,
        };
        (shared, rx, spill_rx)
    }

    fn state(&self) -> PipelineState {
        self.state.load(Ordering::Acquire).into()
    }

    fn transition(&self, to: PipelineState, reason: &'static str) {
        let from: PipelineState = self.state.swap(to as u8, Ordering::AcqRel).into();
        if from != to {
            info!(%from, %to, reason, depth = self.depth(), "pipeline state changed");
        }
    }

    /// Moves to `to` only if the pipeline is still in `from`.
    fn transition_from(&self, from: PipelineState, to: PipelineState, reason: &'static str) -> bool {
        let moved = self
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if moved {
            info!(%from, %to, reason, depth = self.depth(), "pipeline state changed");
        }
        moved
    }

    fn depth(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    /// Queues `record` if the queue holds fewer than `limit` records.
    fn try_enqueue(&self, record: PacketRecord, limit: usize) -> Result<(), PacketRecord> {
        let reserved = self
            .depth
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |d| {
                (d < limit).then_some(d + 1)
            })
            .is_ok();
        if !reserved {
            return Err(record);
        }
        match self.tx.try_send(record) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.depth.fetch_sub(1, Ordering::AcqRel);
                Err(e.into_inner())
            }
        }
    }

    /// Called by the batcher for every record it takes off the queue.
    fn dequeued(&self) {
        self.depth.fetch_sub(1, Ordering::AcqRel);
    }

    /// Queues `record` for the spill stage without waiting for the write.
    fn queue_spill(&self, record: PacketRecord) -> Result<(), PacketRecord> {
        let cmd = SpillCmd {
            records: vec![record],
            ack: None,
        };
        match self.spill_tx.try_send(cmd) {
            Ok(()) => Ok(()),
            Err(e) => match e.into_inner().records.pop() {
                Some(record) => Err(record),
                None => Ok(()),
            },
        }
    }

    /// Spills `records` and waits until they, and everything queued for the
    /// spill stage before them, are on disk. Returns whether that worked.
    async fn spill(&self, records: Vec<PacketRecord>) -> bool {
        let count = records.len() as u64;
        let (ack, written) = oneshot::channel();
        let cmd = SpillCmd {
            records,
            ack: Some(ack),
        };
        if self.spill_tx.send(cmd).await.is_err() {
            self.lost.fetch_add(count, Ordering::AcqRel);
            error!(records = count, "spill stage stopped, records lost");
            return false;
        }
        written.await.unwrap_or(false)
    }

    fn submit(&self, record: PacketRecord) -> Submit {
        match self.try_enqueue(record, self.config.high_water()) {
            Ok(()) => Submit::Accepted,
            Err(record) => {
                if self.state() != PipelineState::Degraded {
                    self.transition(PipelineState::Degraded, "queue full");
                }
                Submit::Rejected(record)
            }
        }
    }

    fn stats(&self) -> PipelineStats {
        let dir = &self.spill_config.directory;
        PipelineStats {
            state: self.state(),
            queue_depth: self.depth(),
            processed: self.processed.load(Ordering::Acquire),
            spilled: self.spilled.load(Ordering::Acquire),
            replayed: self.replayed.load(Ordering::Acquire),
            lost: self.lost.load(Ordering::Acquire),
            spill_files: spill::sealed_files(dir).map(|f| f.len()).unwrap_or(0),
            tracked_vessels: self.scheme.tracker().len(),
        }
    }
}

/// Handle to a running pipeline. Dropping it without calling
/// [`IngestionPipeline::shutdown`] stops the tasks without flushing; whatever
/// was spilled is replayed on the next start.
pub struct IngestionPipeline {
    shared: Arc<Shared>,
    stop_backfill: CancellationToken,
    stop_batcher: CancellationToken,
    stop_spiller: CancellationToken,
    backfill: Option<JoinHandle<()>>,
    batcher: Option<JoinHandle<()>>,
    spiller: Option<JoinHandle<()>>,
}

impl IngestionPipeline {
    /// Opens the spill directory and starts the batcher, spill and backfill
    /// tasks on the current tokio runtime. Fails if the spill directory is unusable.
    pub fn start(
        store: Arc<dyn Store>,
        tracker: Arc<PositionTracker>,
        config: &Config,
    ) -> Result<Self, Error> {
        let spill = SpillWriter::open(&config.spill)?;
        let scheme = PartitionScheme::new(tracker);
        let (shared, rx, spill_rx) = Shared::new(config.pipeline.clone(), spill, scheme, store);
        let shared = Arc::new(shared);

        let stop_backfill = CancellationToken::new();
        let stop_batcher = CancellationToken::new();
        let stop_spiller = CancellationToken::new();
        let spiller = tokio::spawn(spiller::run(shared.clone(), spill_rx, stop_spiller.clone()));
        let batcher = tokio::spawn(batcher::run(shared.clone(), rx, stop_batcher.clone()));
        let backfill = tokio::spawn(backfill::Backfill::new(shared.clone()).run(stop_backfill.clone()));
        info!(
            dir = ?config.spill.directory,
            batch_size = config.pipeline.batch_size,
            high_water = config.pipeline.high_water(),
            "ingestion pipeline started"
        );

        Ok(IngestionPipeline {
            shared,
            stop_backfill,
            stop_batcher,
            stop_spiller,
            backfill: Some(backfill),
            batcher: Some(batcher),
            spiller: Some(spiller),
        })
    }

    /// Offers `record` to the queue without blocking.
    pub fn submit(&self, record: PacketRecord) -> Submit {
        self.shared.submit(record)
    }

    /// Queues `record`, or hands it to the spill stage if the queue is full.
    /// Never blocks.
    pub fn ingest(&self, record: PacketRecord) -> Ingested {
        match self.shared.submit(record) {
            Submit::Accepted => Ingested::Queued,
            Submit::Rejected(record) => match self.shared.queue_spill(record) {
                Ok(()) => Ingested::Spilled,
                Err(record) => Ingested::Rejected(record),
            },
        }
    }

    /// Waits until every record handed to the spill stage so far is on disk,
    /// or counted as lost if that failed.
    pub async fn flush_spill(&self) -> Result<(), Error> {
        if self.shared.spill(Vec::new()).await {
            Ok(())
        } else {
            Err(anyhow::anyhow!("spill stage failed to write queued records").into())
        }
    }

    pub fn state(&self) -> PipelineState {
        self.shared.state()
    }

    pub fn queue_depth(&self) -> usize {
        self.shared.depth()
    }

    pub fn processed_count(&self) -> u64 {
        self.shared.processed.load(Ordering::Acquire)
    }

    pub fn spilled_count(&self) -> u64 {
        self.shared.spilled.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> PipelineStats {
        self.shared.stats()
    }

    /// Stops backfill, drains the queue into the store (or the spill files),
    /// drains the spill stage and seals the active spill file.
    pub async fn shutdown(mut self) -> Result<PipelineStats, Error> {
        self.stop_backfill.cancel();
        if let Some(task) = self.backfill.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "backfill task ended abnormally");
            }
        }
        self.stop_batcher.cancel();
        if let Some(task) = self.batcher.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "batcher task ended abnormally");
            }
        }
        self.stop_spiller.cancel();
        if let Some(task) = self.spiller.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "spill stage ended abnormally");
            }
        }
        let shared = self.shared.clone();
        tokio::task::spawn_blocking(move || shared.spill.lock().seal())
            .await
            .map_err(anyhow::Error::from)??;
        let stats = self.shared.stats();
        info!(?stats, "ingestion pipeline stopped");
        Ok(stats)
    }
}

impl Drop for IngestionPipeline {
    fn drop(&mut self) {
        self.stop_backfill.cancel();
        self.stop_batcher.cancel();
        self.stop_spiller.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::{
        config::{PipelineConfig, SpillConfig},
        packet::PacketRecord,
        partition::PartitionScheme,
        spill::SpillWriter,
        store::MemStore,
        tracker::PositionTracker,
    };

    use super::{PipelineState, Shared, Submit};

    fn shared(dir: &std::path::Path) -> (Shared, tokio::sync::mpsc::Receiver<PacketRecord>) {
        let config = PipelineConfig {
            batch_size: 2,
            high_water_batches: 3,
            ..Default::default()
        };
        let (shared, rx, _spill_rx) = Shared::new(
            config,
            SpillWriter::open(&SpillConfig::with_directory(dir)).unwrap(),
            PartitionScheme::new(Arc::new(PositionTracker::new())),
            Arc::new(MemStore::new()),
        );
        (shared, rx)
    }

    #[test]
    fn test_submit_rejects_at_high_water() {
        let dir = tempfile::tempdir().unwrap();
        let (shared, mut rx) = shared(dir.path());
        for i in 0..6 {
            assert_eq!(shared.submit(PacketRecord::new(i, &b"x"[..])), Submit::Accepted);
        }
        assert_eq!(shared.depth(), 6);
        assert_eq!(shared.state(), PipelineState::Accepting);

        let rejected = PacketRecord::new(6, &b"y"[..]);
        assert_eq!(
            shared.submit(rejected.clone()),
            Submit::Rejected(rejected)
        );
        assert_eq!(shared.state(), PipelineState::Degraded);

        rx.try_recv().unwrap();
        shared.dequeued();
        assert!(shared.submit(PacketRecord::new(7, &b"z"[..])).is_accepted());
    }

    #[test]
    fn test_backfill_limit_leaves_room_for_live_traffic() {
        let dir = tempfile::tempdir().unwrap();
        let (shared, _rx) = shared(dir.path());
        let limit = shared.config.high_water() - shared.config.batch_size;
        let mut fed = 0;
        while shared.try_enqueue(PacketRecord::new(fed, &b"r"[..]), limit).is_ok() {
            fed += 1;
        }
        assert_eq!(fed, 4);
        assert!(shared.submit(PacketRecord::new(100, &b"a"[..])).is_accepted());
        assert!(shared.submit(PacketRecord::new(101, &b"b"[..])).is_accepted());
        assert!(!shared.submit(PacketRecord::new(102, &b"c"[..])).is_accepted());
    }

    #[test]
    fn test_state_names() {
        assert_eq!(PipelineState::Backfilling.to_string(), "BACKFILLING");
        assert_eq!(PipelineState::from(1), PipelineState::Degraded);
        assert_eq!(PipelineState::from(9), PipelineState::Accepting);
    }
}
