//! Tunables for ingestion, spilling and querying.
//!
//! Every field has a default, so a JSON config file only needs to name what
//! it changes:
//!
//! ```json
//! { "spill": { "directory": "/var/lib/ais/backup" }, "pipeline": { "batch_size": 200 } }
//! ```

use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub spill: SpillConfig,
    #[serde(default)]
    pub query: QueryConfig,
}

impl Config {
    pub fn load<P>(path: P) -> anyhow::Result<Self>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config = serde_json::from_str(&contents)
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok(config)
    }

    /// Writes the config next to `path` and renames it into place.
    pub fn save<P>(&self, path: P) -> anyhow::Result<()>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let tmp_path = path.with_extension("tmp");
        let mut file = OpenOptions::new()
            .write(true)
            .truncate(true)
            .create(true)
            .open(&tmp_path)?;
        let encoded = serde_json::to_string_pretty(self)?;
        file.write_all(encoded.as_bytes())?;
        file.sync_all()?;
        fs::rename(tmp_path, path)?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Maximum records per store write (default: 500)
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Queue capacity, in batches. `submit` rejects once the queue holds this
    /// many batches worth of records (default: 10)
    #[serde(default = "default_high_water_batches")]
    pub high_water_batches: usize,

    /// Maximum time a partial batch waits before being written (default: 1s)
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// Bound on a single batch write (default: 30s)
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,

    /// Fixed delay between attempts of a failed batch write (default: 5s)
    #[serde(default = "default_write_retry_backoff_ms")]
    pub write_retry_backoff_ms: u64,

    /// Attempts per batch before it is spilled (default: 2)
    #[serde(default = "default_write_max_attempts")]
    pub write_max_attempts: u32,

    /// How often the backfill task checks pressure and spill files (default: 1s)
    #[serde(default = "default_backfill_poll_interval_ms")]
    pub backfill_poll_interval_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            high_water_batches: default_high_water_batches(),
            flush_interval_ms: default_flush_interval_ms(),
            write_timeout_ms: default_write_timeout_ms(),
            write_retry_backoff_ms: default_write_retry_backoff_ms(),
            write_max_attempts: default_write_max_attempts(),
            backfill_poll_interval_ms: default_backfill_poll_interval_ms(),
        }
    }
}

impl PipelineConfig {
    /// Queue depth above which `submit` rejects.
    pub fn high_water(&self) -> usize {
        self.batch_size * self.high_water_batches
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn write_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.write_retry_backoff_ms)
    }

    pub fn backfill_poll_interval(&self) -> Duration {
        Duration::from_millis(self.backfill_poll_interval_ms)
    }
}

fn default_batch_size() -> usize {
    500
}

fn default_high_water_batches() -> usize {
    10
}

fn default_flush_interval_ms() -> u64 {
    1000
}

fn default_write_timeout_ms() -> u64 {
    30_000
}

fn default_write_retry_backoff_ms() -> u64 {
    5000
}

fn default_write_max_attempts() -> u32 {
    2
}

fn default_backfill_poll_interval_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpillConfig {
    /// Directory holding spill files (default: ./aisbackup)
    #[serde(default = "default_spill_directory")]
    pub directory: PathBuf,

    /// A new file is started for every window of this length (default: 1 min)
    #[serde(default = "default_rotation_window_ms")]
    pub rotation_window_ms: u64,

    /// A new file is started once the active one reaches this size (default: 64MB)
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,

    /// The active file is sealed after this long without appends (default: 10s)
    #[serde(default = "default_idle_seal_ms")]
    pub idle_seal_ms: u64,

    /// Spill requests waiting for the spill writer. `ingest` hands records
    /// back once this many are waiting (default: 16384)
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Records appended with a single fsync (default: 1000)
    #[serde(default = "default_group_max_records")]
    pub group_max_records: usize,
}

impl Default for SpillConfig {
    fn default() -> Self {
        Self {
            directory: default_spill_directory(),
            rotation_window_ms: default_rotation_window_ms(),
            max_file_bytes: default_max_file_bytes(),
            idle_seal_ms: default_idle_seal_ms(),
            queue_capacity: default_queue_capacity(),
            group_max_records: default_group_max_records(),
        }
    }
}

impl SpillConfig {
    pub fn with_directory(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            ..Default::default()
        }
    }

    pub fn idle_seal(&self) -> Duration {
        Duration::from_millis(self.idle_seal_ms)
    }
}

fn default_spill_directory() -> PathBuf {
    PathBuf::from("./aisbackup")
}

fn default_rotation_window_ms() -> u64 {
    60_000
}

fn default_max_file_bytes() -> u64 {
    64 * 1024 * 1024
}

fn default_queue_capacity() -> usize {
    16_384
}

fn default_group_max_records() -> usize {
    1000
}

fn default_idle_seal_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryConfig {
    /// Rows per page fetched from a partition (default: 3000)
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Area queries use the one degree grid while it needs fewer than this
    /// many times the ten degree cells (default: 10)
    #[serde(default = "default_oversampling_factor")]
    pub oversampling_factor: usize,

    /// Page fetches in flight across all queries of an engine (default: 32)
    #[serde(default = "default_max_inflight_fetches")]
    pub max_inflight_fetches: usize,

    /// Bound on a single page fetch (default: 30s)
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,

    /// Fixed delay between attempts of a failed page fetch (default: 500ms)
    #[serde(default = "default_fetch_retry_backoff_ms")]
    pub fetch_retry_backoff_ms: u64,

    /// Attempts per page before the query fails (default: 3)
    #[serde(default = "default_fetch_max_attempts")]
    pub fetch_max_attempts: u32,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            oversampling_factor: default_oversampling_factor(),
            max_inflight_fetches: default_max_inflight_fetches(),
            fetch_timeout_ms: default_fetch_timeout_ms(),
            fetch_retry_backoff_ms: default_fetch_retry_backoff_ms(),
            fetch_max_attempts: default_fetch_max_attempts(),
        }
    }
}

impl QueryConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn fetch_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.fetch_retry_backoff_ms)
    }
}

fn default_page_size() -> usize {
    3000
}

fn default_oversampling_factor() -> usize {
    10
}

fn default_max_inflight_fetches() -> usize {
    32
}

fn default_fetch_timeout_ms() -> u64 {
    30_000
}

fn default_fetch_retry_backoff_ms() -> u64 {
    500
}

fn default_fetch_max_attempts() -> u32 {
    3
}
