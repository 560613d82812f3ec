use std::{
    collections::BTreeSet,
    path::Path,
    sync::Arc,
    time::{Duration, Instant},
};

use trackstore::{
    config::{Config, PipelineConfig, QueryConfig, SpillConfig},
    partition::CellResolution,
    pipeline::{Ingested, IngestionPipeline, PipelineState},
    spill::{self, SpillWriter},
    MemStore, PacketRecord, PartitionKey, Position, PositionTracker, QueryEngine,
};

fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn config(dir: &Path) -> Config {
    Config {
        pipeline: PipelineConfig {
            batch_size: 10,
            high_water_batches: 4,
            flush_interval_ms: 10,
            write_timeout_ms: 200,
            write_retry_backoff_ms: 10,
            write_max_attempts: 2,
            backfill_poll_interval_ms: 20,
        },
        spill: SpillConfig {
            idle_seal_ms: 50,
            ..SpillConfig::with_directory(dir)
        },
        query: QueryConfig::default(),
    }
}

async fn wait_for<F>(what: &str, mut done: F)
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(10);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn time_block_rows(store: &MemStore) -> Vec<i64> {
    store
        .partition_keys()
        .into_iter()
        .filter(|k| matches!(k, PartitionKey::TimeBlock(_)))
        .flat_map(|k| store.partition_rows(&k))
        .map(|row| row.sort_key.timestamp_millis)
        .collect()
}

fn numbered(n: i64) -> Vec<PacketRecord> {
    (0..n)
        .map(|i| PacketRecord::new(i * 1000, format!("packet {}", i).into_bytes()))
        .collect()
}

/// Ingests every record and returns how many went straight to spill files.
fn ingest_all(pipeline: &IngestionPipeline, records: &[PacketRecord]) -> u64 {
    let mut spilled = 0;
    for record in records {
        match pipeline.ingest(record.clone()) {
            Ingested::Queued => {}
            Ingested::Spilled => spilled += 1,
            Ingested::Rejected(r) => panic!("record at {} rejected", r.timestamp_millis()),
        }
    }
    spilled
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_outage_is_backfilled() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemStore::new());
    store.set_available(false);

    let pipeline = IngestionPipeline::start(
        store.clone(),
        Arc::new(PositionTracker::new()),
        &config(dir.path()),
    )
    .unwrap();

    let records = numbered(120);
    ingest_all(&pipeline, &records);
    wait_for("records to be spilled", || pipeline.spilled_count() > 0).await;
    assert_ne!(pipeline.state(), PipelineState::Accepting);
    assert_eq!(store.row_count(), 0);

    store.set_available(true);
    wait_for("every record to land", || {
        time_block_rows(&store).len() == records.len()
    })
    .await;
    wait_for("backfill to finish", || {
        let stats = pipeline.stats();
        stats.state == PipelineState::Accepting && stats.spill_files == 0 && stats.queue_depth == 0
    })
    .await;

    let stats = pipeline.shutdown().await.unwrap();
    assert_eq!(stats.lost, 0);
    assert!(stats.replayed > 0);
    assert!(spill::sealed_files(dir.path()).unwrap().is_empty());

    // Each record is in its time block exactly once.
    let got: BTreeSet<_> = time_block_rows(&store).into_iter().collect();
    let want: BTreeSet<_> = records.iter().map(|r| r.timestamp_millis()).collect();
    assert_eq!(got, want);
    assert_eq!(time_block_rows(&store).len(), records.len());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_spill_files_replay_after_restart() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemStore::new());
    store.set_available(false);
    let config = config(dir.path());

    let pipeline =
        IngestionPipeline::start(store.clone(), Arc::new(PositionTracker::new()), &config)
            .unwrap();
    let records = numbered(35);
    ingest_all(&pipeline, &records);
    let stats = pipeline.shutdown().await.unwrap();
    assert_eq!(stats.processed, 0);
    assert_eq!(stats.lost, 0);
    assert!(!spill::sealed_files(dir.path()).unwrap().is_empty());

    store.set_available(true);
    let pipeline =
        IngestionPipeline::start(store.clone(), Arc::new(PositionTracker::new()), &config)
            .unwrap();
    wait_for("spilled records to replay", || {
        time_block_rows(&store).len() == records.len()
    })
    .await;
    wait_for("backfill to finish", || pipeline.stats().spill_files == 0).await;
    let stats = pipeline.shutdown().await.unwrap();
    assert_eq!(stats.lost, 0);
    assert!(spill::sealed_files(dir.path()).unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_full_queue_spills() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemStore::new());
    store.set_write_delay(Some(Duration::from_millis(100)));

    let pipeline = IngestionPipeline::start(
        store.clone(),
        Arc::new(PositionTracker::new()),
        &config(dir.path()),
    )
    .unwrap();

    let records = numbered(200);
    let spilled = ingest_all(&pipeline, &records);
    assert!(spilled > 0);
    pipeline.flush_spill().await.unwrap();
    assert_eq!(pipeline.spilled_count(), spilled);

    store.set_write_delay(None);
    wait_for("every record to land", || {
        time_block_rows(&store).len() == records.len()
    })
    .await;
    let stats = pipeline.shutdown().await.unwrap();
    assert_eq!(stats.lost, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_corrupt_spill_file_is_quarantined() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());

    // Two spill files from an earlier run; the last frame of the first one
    // is damaged.
    let mut writer = SpillWriter::open(&config.spill).unwrap();
    let records = numbered(8);
    writer.append(&records[..5]).unwrap();
    let damaged = writer.seal().unwrap().unwrap();
    writer.append(&records[5..]).unwrap();
    writer.seal().unwrap().unwrap();
    drop(writer);

    let mut bytes = std::fs::read(&damaged).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xff;
    std::fs::write(&damaged, bytes).unwrap();

    let store = Arc::new(MemStore::new());
    let pipeline =
        IngestionPipeline::start(store.clone(), Arc::new(PositionTracker::new()), &config)
            .unwrap();
    wait_for("backfill to finish", || {
        let stats = pipeline.stats();
        stats.spill_files == 0 && stats.processed == 7
    })
    .await;

    let mut want: Vec<_> = records[..4]
        .iter()
        .chain(&records[5..])
        .map(|r| r.timestamp_millis())
        .collect();
    want.sort();
    let mut got = time_block_rows(&store);
    got.sort();
    assert_eq!(got, want);

    let corrupt = spill::corrupt_files(dir.path()).unwrap();
    assert_eq!(corrupt, vec![damaged.with_extension("corrupt")]);

    let stats = pipeline.shutdown().await.unwrap();
    assert_eq!(stats.replayed, 7);
    assert_eq!(stats.lost, 0);
    assert!(spill::sealed_files(dir.path()).unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_write_retry_succeeds_without_spilling() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemStore::new());
    store.fail_next_writes(1);

    let pipeline = IngestionPipeline::start(
        store.clone(),
        Arc::new(PositionTracker::new()),
        &config(dir.path()),
    )
    .unwrap();

    let records = numbered(10);
    assert_eq!(ingest_all(&pipeline, &records), 0);
    wait_for("the batch to be written", || pipeline.processed_count() == 10).await;
    // The failed attempt degrades the pipeline until the queue drains.
    wait_for("the pipeline to recover", || {
        pipeline.state() == PipelineState::Accepting
    })
    .await;

    let stats = pipeline.shutdown().await.unwrap();
    assert_eq!(stats.spilled, 0);
    assert_eq!(stats.lost, 0);
    assert_eq!(time_block_rows(&store).len(), records.len());
    assert!(spill::sealed_files(dir.path()).unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_ingest_then_query() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemStore::new());
    let config = config(dir.path());
    let pipeline =
        IngestionPipeline::start(store.clone(), Arc::new(PositionTracker::new()), &config)
            .unwrap();

    let positioned = PacketRecord::new(1000, &b"!AIVDM,1,1,,A,13u?etPv2;0n:dDPwUM1U1Cb069D,0*24"[..])
        .with_vessel(123456789)
        .with_position(Position::new(56.0, 10.0));
    assert_eq!(pipeline.ingest(positioned.clone()), Ingested::Queued);
    wait_for("the packet to be written", || store.row_count() == 4).await;
    assert_eq!(
        store.partition_keys(),
        vec![
            PartitionKey::TimeBlock(0),
            PartitionKey::Vessel(123456789),
            PartitionKey::Cell(CellResolution::One, 52750),
            PartitionKey::Cell(CellResolution::Ten, 523),
        ]
    );

    // A duplicate lands on the same rows.
    assert_eq!(pipeline.ingest(positioned.clone()), Ingested::Queued);
    wait_for("the duplicate to be written", || pipeline.processed_count() == 2).await;
    assert_eq!(store.row_count(), 4);

    let rest: Vec<_> = [599_000, 600_500, 1_199_999, 1_200_000]
        .iter()
        .map(|ts| PacketRecord::new(*ts, format!("t{}", ts).into_bytes()))
        .collect();
    assert_eq!(ingest_all(&pipeline, &rest), 0);
    wait_for("the rest to be written", || pipeline.processed_count() == 6).await;
    let stats = pipeline.shutdown().await.unwrap();
    assert_eq!(stats.tracked_vessels, 1);

    let engine = QueryEngine::new(store.clone(), config.query.clone());
    let got: Vec<_> = engine
        .query_by_time(0..1_200_000)
        .unwrap()
        .collect()
        .await
        .unwrap()
        .iter()
        .map(|r| r.timestamp_millis())
        .collect();
    assert_eq!(got, vec![1000, 599_000, 600_500, 1_199_999]);

    let by_vessel = engine
        .query_by_vessel(&[123456789], 0..10_000)
        .unwrap()
        .collect()
        .await
        .unwrap();
    assert_eq!(by_vessel, vec![positioned]);
}
