use std::sync::{atomic::Ordering, Arc};

use tokio::{sync::mpsc, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{packet::PacketRecord, store::StoreError};

use super::{PipelineState, Shared};

/// Takes records off the queue and writes them in batches of up to
/// `batch_size`, or whatever arrived within `flush_interval` of the first
/// record. Exactly one batch write is in flight at a time.
pub(super) async fn run(
    shared: Arc<Shared>,
    mut rx: mpsc::Receiver<PacketRecord>,
    ct: CancellationToken,
) {
    let batch_size = shared.config.batch_size.max(1);
    loop {
        let first = tokio::select! {
            _ = ct.cancelled() => break,
            record = rx.recv() => match record {
                Some(record) => record,
                None => break,
            },
        };
        shared.dequeued();

        let mut batch = Vec::with_capacity(batch_size);
        batch.push(first);
        let deadline = Instant::now() + shared.config.flush_interval();
        while batch.len() < batch_size {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(record)) => {
                    shared.dequeued();
                    batch.push(record);
                }
                Ok(None) | Err(_) => break,
            }
        }

        write_or_spill(&shared, batch).await;
    }

    // Whatever is still queued goes out before the task ends.
    rx.close();
    let mut batch = Vec::with_capacity(batch_size);
    while let Ok(record) = rx.try_recv() {
        shared.dequeued();
        batch.push(record);
        if batch.len() == batch_size {
            write_or_spill(&shared, std::mem::take(&mut batch)).await;
        }
    }
    if !batch.is_empty() {
        write_or_spill(&shared, batch).await;
    }
    debug!("batcher stopped");
}

/// A batch the store did not take goes to the spill stage. The batcher waits
/// for it to be on disk, so a failing store slows intake down to the speed
/// of the spill files instead of piling up batches in memory.
async fn write_or_spill(shared: &Shared, batch: Vec<PacketRecord>) {
    if write(shared, &batch).await {
        return;
    }
    let records = batch.len();
    if shared.spill(batch).await {
        debug!(records, "spilled failed batch");
    }
}

/// Writes every partition entry of `batch` as one store batch, retrying with
/// a fixed backoff. Returns whether the batch was acknowledged.
async fn write(shared: &Shared, batch: &[PacketRecord]) -> bool {
    let mut entries = Vec::with_capacity(batch.len() * 4);
    for record in batch {
        entries.extend(shared.scheme.route(record).entries());
    }

    let config = &shared.config;
    let max_attempts = config.write_max_attempts.max(1);
    for attempt in 1..=max_attempts {
        let result =
            match tokio::time::timeout(config.write_timeout(), shared.store.write_batch(&entries))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(StoreError::Timeout(config.write_timeout())),
            };

        match result {
            Ok(()) => {
                shared
                    .processed
                    .fetch_add(batch.len() as u64, Ordering::AcqRel);
                debug!(records = batch.len(), entries = entries.len(), "wrote batch");
                return true;
            }
            Err(e) => {
                warn!(
                    attempt,
                    max_attempts,
                    records = batch.len(),
                    transient = e.is_transient(),
                    error = %e,
                    "batch write failed"
                );
                shared.transition(PipelineState::Degraded, "batch write failed");
                if attempt < max_attempts {
                    tokio::time::sleep(config.write_retry_backoff()).await;
                }
            }
        }
    }
    false
}
