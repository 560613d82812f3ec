use std::{
    collections::VecDeque,
    fs,
    path::PathBuf,
    sync::{atomic::Ordering, Arc},
};

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    packet::PacketRecord,
    spill::{self, SpillReader},
};

use super::{PipelineState, Shared};

/// Replays spill files into the queue once the pipeline has room again.
///
/// Files are replayed oldest first. A file is deleted once the last of its
/// records has been queued; a crash before that replays it again, which the
/// store's idempotent upserts absorb.
pub(super) struct Backfill {
    shared: Arc<Shared>,
    pending: VecDeque<PacketRecord>,
    current: Option<PathBuf>,
}

impl Backfill {
    pub(super) fn new(shared: Arc<Shared>) -> Self {
        Backfill {
            shared,
            pending: VecDeque::new(),
            current: None,
        }
    }

    pub(super) async fn run(mut self, ct: CancellationToken) {
        let mut ticker = tokio::time::interval(self.shared.config.backfill_poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ct.cancelled() => break,
                _ = ticker.tick() => {}
            }
            // Spill files are read, sealed and removed on the blocking pool.
            let step = tokio::task::spawn_blocking(move || {
                let result = self.step();
                (self, result)
            });
            match step.await {
                Ok((backfill, result)) => {
                    self = backfill;
                    if let Err(e) = result {
                        warn!(error = ?e, "backfill step failed");
                    }
                }
                Err(e) => {
                    error!(error = %e, "backfill step panicked, backfill stopped");
                    return;
                }
            }
        }
        if !self.pending.is_empty() {
            debug!(
                records = self.pending.len(),
                file = ?self.current,
                "backfill stopped with records left, the file stays for the next run"
            );
        }
    }

    fn has_spilled_work(&self) -> anyhow::Result<bool> {
        if !self.pending.is_empty() {
            return Ok(true);
        }
        let writer = self.shared.spill.lock();
        Ok(writer.has_pending() || !spill::sealed_files(writer.dir())?.is_empty())
    }

    fn step(&mut self) -> anyhow::Result<()> {
        self.shared.spill.lock().seal_if_idle()?;

        let shared = self.shared.clone();
        let state = shared.state();
        match state {
            PipelineState::Backfilling => {}
            PipelineState::Degraded | PipelineState::Accepting
                if shared.depth() < shared.config.batch_size =>
            {
                let to = if self.has_spilled_work()? {
                    PipelineState::Backfilling
                } else {
                    PipelineState::Accepting
                };
                if to == state || !shared.transition_from(state, to, "queue drained") {
                    return Ok(());
                }
                if to == PipelineState::Accepting {
                    return Ok(());
                }
            }
            _ => return Ok(()),
        }

        self.feed()
    }

    /// Moves spilled records into the queue until it reaches the backfill
    /// limit or nothing is left.
    fn feed(&mut self) -> anyhow::Result<()> {
        let config = &self.shared.config;
        let limit = config.high_water().saturating_sub(config.batch_size);
        loop {
            if self.pending.is_empty() {
                self.finish_current()?;
                if !self.load_next()? {
                    self.shared.transition_from(
                        PipelineState::Backfilling,
                        PipelineState::Accepting,
                        "backfill complete",
                    );
                    return Ok(());
                }
                continue;
            }

            while let Some(record) = self.pending.pop_front() {
                if let Err(record) = self.shared.try_enqueue(record, limit) {
                    self.pending.push_front(record);
                    return Ok(());
                }
                self.shared.replayed.fetch_add(1, Ordering::AcqRel);
            }
        }
    }

    fn finish_current(&mut self) -> anyhow::Result<()> {
        if let Some(path) = self.current.take() {
            fs::remove_file(&path)?;
            info!(path = ?path, "replayed and removed spill file");
        }
        Ok(())
    }

    /// Loads the oldest sealed file into `pending`. The active file is sealed
    /// first if it is the only thing left. Returns false when there is nothing
    /// to replay.
    fn load_next(&mut self) -> anyhow::Result<bool> {
        let next = {
            let mut writer = self.shared.spill.lock();
            let mut files = spill::sealed_files(writer.dir())?;
            if files.is_empty() && writer.has_pending() {
                writer.seal()?;
                files = spill::sealed_files(writer.dir())?;
            }
            files.into_iter().next()
        };
        let Some(path) = next else {
            return Ok(false);
        };

        for record in SpillReader::open(&path)? {
            match record {
                Ok(record) => self.pending.push_back(record),
                Err(e) => {
                    // The readable prefix is still replayed. The file is kept
                    // for inspection instead of being deleted.
                    warn!(error = ?e, path = ?path, recovered = self.pending.len(), "corrupt spill file");
                    spill::quarantine(&path)?;
                    return Ok(true);
                }
            }
        }
        debug!(path = ?path, records = self.pending.len(), "loaded spill file");
        self.current = Some(path);
        Ok(true)
    }
}
