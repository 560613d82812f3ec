use std::{
    fs::{self, File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    time::{Instant, SystemTime, UNIX_EPOCH},
};

use anyhow::bail;
use tracing::{debug, info, warn};

use crate::{config::SpillConfig, packet::PacketRecord, Error};

use super::{file_name, frame, parse_file_name, OPEN_EXT, SEALED_EXT};

#[derive(Debug)]
struct ActiveFile {
    file: File,
    path: PathBuf,
    window_start: u64,
    bytes: u64,
    records: usize,
    last_append: Instant,
}

/// Appends records to the active spill file, rotating it per time window and
/// by size.
#[derive(Debug)]
pub struct SpillWriter {
    config: SpillConfig,
    active: Option<ActiveFile>,
    next_seq: u64,
    records_written: u64,
    buf: Vec<u8>,
    /// Makes the next append write only this many bytes and fail.
    #[cfg(test)]
    torn_write: Option<usize>,
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl SpillWriter {
    /// Opens the spill directory, creating it if needed. Files left `.open` by
    /// a previous process are sealed so they get replayed.
    ///
    /// Fails if the directory cannot be created or written to.
    pub fn open(config: &SpillConfig) -> Result<Self, Error> {
        let dir = config.directory.as_path();
        let unavailable = |source: io::Error| Error::SpillDirUnavailable {
            path: dir.to_path_buf(),
            source,
        };

        fs::create_dir_all(dir).map_err(unavailable)?;
        let check = dir.join(".writable");
        File::create(&check)
            .and_then(|mut f| {
                f.write_all(b"ok")?;
                f.sync_all()
            })
            .map_err(unavailable)?;
        fs::remove_file(&check).map_err(unavailable)?;

        let mut next_seq = 0;
        for entry in fs::read_dir(dir).map_err(unavailable)? {
            let path = entry.map_err(unavailable)?.path();
            let Some((seq, ext)) = parse_file_name(&path) else {
                continue;
            };
            next_seq = next_seq.max(seq + 1);
            if ext == OPEN_EXT {
                let sealed = path.with_extension(SEALED_EXT);
                fs::rename(&path, &sealed).map_err(unavailable)?;
                info!(path = ?sealed, "sealed spill file left open by a previous run");
            }
        }

        Ok(SpillWriter {
            config: config.clone(),
            active: None,
            next_seq,
            records_written: 0,
            buf: Vec::new(),
            #[cfg(test)]
            torn_write: None,
        })
    }

    pub fn config(&self) -> &SpillConfig {
        &self.config
    }

    pub fn dir(&self) -> &Path {
        &self.config.directory
    }

    /// Total number of records appended by this writer.
    pub fn records_written(&self) -> u64 {
        self.records_written
    }

    /// Whether the active file holds records that are not sealed yet.
    pub fn has_pending(&self) -> bool {
        self.active.as_ref().map_or(false, |a| a.records > 0)
    }

    fn window_start(&self, now: u64) -> u64 {
        let window = self.config.rotation_window_ms.max(1);
        now - now % window
    }

    fn create_active(&mut self, window_start: u64) -> anyhow::Result<()> {
        let path = self
            .config
            .directory
            .join(file_name(self.next_seq, window_start, OPEN_EXT));
        let file = OpenOptions::new().create_new(true).append(true).open(&path)?;
        self.next_seq += 1;
        debug!(path = ?path, "started spill file");
        self.active = Some(ActiveFile {
            file,
            path,
            window_start,
            bytes: 0,
            records: 0,
            last_append: Instant::now(),
        });
        Ok(())
    }

    /// Durably appends `records`. When this returns Ok the records survive a
    /// crash.
    pub fn append(&mut self, records: &[PacketRecord]) -> anyhow::Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let window_start = self.window_start(now_millis());
        let rotate = self.active.as_ref().map_or(false, |a| {
            a.window_start != window_start || a.bytes >= self.config.max_file_bytes
        });
        if rotate {
            self.seal()?;
        }
        if self.active.is_none() {
            self.create_active(window_start)?;
        }

        self.buf.clear();
        for record in records {
            frame(&record.to_bytes(), &mut self.buf);
        }

        if let Err(e) = self.write_buf() {
            self.discard_torn_tail();
            return Err(e);
        }
        let Some(active) = self.active.as_mut() else {
            bail!("no active spill file");
        };
        active.bytes += self.buf.len() as u64;
        active.records += records.len();
        active.last_append = Instant::now();
        self.records_written += records.len() as u64;
        debug!(path = ?active.path, records = records.len(), "spilled records");
        Ok(())
    }

    fn write_buf(&mut self) -> anyhow::Result<()> {
        let Some(active) = self.active.as_mut() else {
            bail!("no active spill file");
        };
        #[cfg(test)]
        if let Some(keep) = self.torn_write.take() {
            active.file.write_all(&self.buf[..keep.min(self.buf.len())])?;
            bail!("injected torn write");
        }
        active.file.write_all(&self.buf)?;
        active.file.sync_data()?;
        Ok(())
    }

    /// Cuts a partially written append off the active file, so later appends
    /// follow the last complete frame. If the file cannot be cut, it is
    /// sealed as is and the next append starts a new one; its intact prefix
    /// is still replayed.
    fn discard_torn_tail(&mut self) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        let truncated = active
            .file
            .set_len(active.bytes)
            .and_then(|()| active.file.sync_data());
        let Err(e) = truncated else {
            return;
        };
        warn!(path = ?active.path, error = %e, "could not cut torn spill frame, retiring file");
        if let Some(active) = self.active.take() {
            drop(active.file);
            let sealed = active.path.with_extension(SEALED_EXT);
            if let Err(e) = fs::rename(&active.path, &sealed) {
                warn!(path = ?active.path, error = %e, "could not seal torn spill file");
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn tear_next_append(&mut self, keep_bytes: usize) {
        self.torn_write = Some(keep_bytes);
    }

    /// Closes the active file and makes it visible to backfill. An active file
    /// without records is removed instead. Returns the sealed file, if any.
    pub fn seal(&mut self) -> anyhow::Result<Option<PathBuf>> {
        let Some(active) = self.active.take() else {
            return Ok(None);
        };
        if active.records == 0 {
            drop(active.file);
            fs::remove_file(&active.path)?;
            return Ok(None);
        }

        active.file.sync_all()?;
        drop(active.file);
        let sealed = active.path.with_extension(SEALED_EXT);
        fs::rename(&active.path, &sealed)?;
        info!(path = ?sealed, records = active.records, bytes = active.bytes, "sealed spill file");
        Ok(Some(sealed))
    }

    /// Seals the active file if nothing was appended to it for the configured
    /// idle time.
    pub fn seal_if_idle(&mut self) -> anyhow::Result<Option<PathBuf>> {
        let idle = self
            .active
            .as_ref()
            .map_or(false, |a| a.last_append.elapsed() >= self.config.idle_seal());
        if idle {
            self.seal()
        } else {
            Ok(None)
        }
    }
}
