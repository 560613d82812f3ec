use std::sync::{atomic::Ordering, Arc};

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::packet::PacketRecord;

use super::Shared;

/// A request to the spill stage. `ack` is told whether the records, and
/// everything queued before them, are on disk.
pub(super) struct SpillCmd {
    pub records: Vec<PacketRecord>,
    pub ack: Option<oneshot::Sender<bool>>,
}

/// Appends spilled records in groups: whatever queued up while the previous
/// group was being written goes out with a single fsync. File I/O runs on
/// the blocking pool.
pub(super) async fn run(
    shared: Arc<Shared>,
    mut rx: mpsc::Receiver<SpillCmd>,
    ct: CancellationToken,
) {
    let group_max = shared.spill_config.group_max_records.max(1);
    let mut group = Vec::new();
    let mut acks = Vec::new();
    loop {
        let first = tokio::select! {
            _ = ct.cancelled() => break,
            cmd = rx.recv() => match cmd {
                Some(cmd) => cmd,
                None => break,
            },
        };
        take(first, &mut group, &mut acks);
        while group.len() < group_max {
            match rx.try_recv() {
                Ok(cmd) => take(cmd, &mut group, &mut acks),
                Err(_) => break,
            }
        }
        write_group(&shared, std::mem::take(&mut group), std::mem::take(&mut acks)).await;
    }

    rx.close();
    while let Some(cmd) = rx.recv().await {
        take(cmd, &mut group, &mut acks);
        if group.len() >= group_max {
            write_group(&shared, std::mem::take(&mut group), std::mem::take(&mut acks)).await;
        }
    }
    write_group(&shared, group, acks).await;
    debug!("spill stage stopped");
}

fn take(cmd: SpillCmd, group: &mut Vec<PacketRecord>, acks: &mut Vec<oneshot::Sender<bool>>) {
    group.extend(cmd.records);
    if let Some(ack) = cmd.ack {
        acks.push(ack);
    }
}

async fn write_group(shared: &Arc<Shared>, group: Vec<PacketRecord>, acks: Vec<oneshot::Sender<bool>>) {
    let written = if group.is_empty() {
        true
    } else {
        let records = group.len() as u64;
        let writer = shared.clone();
        let appended =
            tokio::task::spawn_blocking(move || writer.spill.lock().append(&group)).await;
        match appended {
            Ok(Ok(())) => {
                shared.spilled.fetch_add(records, Ordering::AcqRel);
                debug!(records, "spilled record group");
                true
            }
            Ok(Err(e)) => {
                shared.lost.fetch_add(records, Ordering::AcqRel);
                error!(error = ?e, records, "could not spill records, records lost");
                false
            }
            Err(e) => {
                shared.lost.fetch_add(records, Ordering::AcqRel);
                error!(error = %e, records, "spill append panicked, records lost");
                false
            }
        }
    };
    for ack in acks {
        let _ = ack.send(written);
    }
}
