//! Local spill files: where packets go while the store cannot take them.
//!
//! A spill directory holds append-only files of framed records:
//!
//! ```text
//! [len: u32 LE][crc32 of record: u32 LE][record: len bytes] ...
//! ```
//!
//! A file is named `spill-<seq>-<window start millis>` and carries the
//! `.open` extension while it is being appended to. Sealing renames it to
//! `.spill`; only sealed files are replayed. A file that fails to read back is
//! renamed to `.corrupt` and left alone.

use std::{
    fs,
    path::{Path, PathBuf},
};

use tracing::warn;

mod reader;
mod writer;

pub use reader::SpillReader;
pub use writer::SpillWriter;

pub(crate) const OPEN_EXT: &str = "open";
pub(crate) const SEALED_EXT: &str = "spill";
pub(crate) const CORRUPT_EXT: &str = "corrupt";

const FRAME_HEADER_LEN: usize = 8;

pub(crate) fn file_name(seq: u64, window_start_millis: u64, ext: &str) -> String {
    format!("spill-{:010}-{:013}.{}", seq, window_start_millis, ext)
}

/// Sequence number and extension of a spill file name, or None for anything
/// else that lives in the directory.
pub(crate) fn parse_file_name(path: &Path) -> Option<(u64, &str)> {
    let ext = path.extension()?.to_str()?;
    let stem = path.file_stem()?.to_str()?;
    let mut parts = stem.strip_prefix("spill-")?.splitn(2, '-');
    let seq = parts.next()?.parse().ok()?;
    parts.next()?.parse::<u64>().ok()?;
    Some((seq, ext))
}

fn files_with_ext(dir: &Path, wanted: &str) -> anyhow::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if let Some((seq, ext)) = parse_file_name(&path) {
            if ext == wanted {
                files.push((seq, path));
            }
        }
    }
    files.sort();
    Ok(files.into_iter().map(|(_, path)| path).collect())
}

/// Sealed spill files in `dir`, oldest first.
pub fn sealed_files(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    files_with_ext(dir, SEALED_EXT)
}

pub fn corrupt_files(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    files_with_ext(dir, CORRUPT_EXT)
}

/// Moves a spill file that could not be read out of the replay path.
pub fn quarantine(path: &Path) -> anyhow::Result<PathBuf> {
    let target = path.with_extension(CORRUPT_EXT);
    fs::rename(path, &target)?;
    warn!(from = ?path, to = ?target, "quarantined spill file");
    Ok(target)
}

pub(crate) fn frame(record: &[u8], out: &mut Vec<u8>) {
    out.extend((record.len() as u32).to_le_bytes());
    out.extend(crc32fast::hash(record).to_le_bytes());
    out.extend(record);
}

#[cfg(test)]
mod tests {
    use std::{fs, path::Path};

    use crate::{
        config::SpillConfig,
        packet::{PacketRecord, Position},
        Error,
    };

    use super::{
        corrupt_files, file_name, parse_file_name, quarantine, sealed_files, SpillReader,
        SpillWriter,
    };

    fn config(dir: &Path) -> SpillConfig {
        SpillConfig {
            // One window for the whole test run.
            rotation_window_ms: 1 << 50,
            ..SpillConfig::with_directory(dir)
        }
    }

    fn records(range: std::ops::Range<i64>) -> Vec<PacketRecord> {
        range
            .map(|i| {
                PacketRecord::new(i * 1000, format!("!AIVDM,{}", i).into_bytes())
                    .with_vessel(i as u32)
                    .with_position(Position::new(i as f64 / 10.0, 0.5))
            })
            .collect()
    }

    #[test]
    fn test_file_names() {
        let name = file_name(12, 1_369_000_000_000, "spill");
        assert_eq!(name, "spill-0000000012-1369000000000.spill");
        assert_eq!(parse_file_name(Path::new(&name)), Some((12, "spill")));
        assert_eq!(parse_file_name(Path::new("spill-x-1.spill")), None);
        assert_eq!(parse_file_name(Path::new("notes.txt")), None);
    }

    #[test]
    fn test_append_seal_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = SpillWriter::open(&config(dir.path())).unwrap();
        w.append(&records(0..5)).unwrap();
        w.append(&records(5..8)).unwrap();
        assert!(w.has_pending());
        assert!(sealed_files(dir.path()).unwrap().is_empty());

        let sealed = w.seal().unwrap().unwrap();
        assert!(!w.has_pending());
        assert_eq!(sealed_files(dir.path()).unwrap(), vec![sealed.clone()]);
        assert_eq!(SpillReader::read_all(&sealed).unwrap(), records(0..8));
        assert_eq!(w.records_written(), 8);
    }

    #[test]
    fn test_rotation_by_size() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = SpillConfig {
            max_file_bytes: 1,
            ..config(dir.path())
        };
        let mut w = SpillWriter::open(&cfg).unwrap();
        for i in 0..3 {
            w.append(&records(i..i + 1)).unwrap();
        }
        w.seal().unwrap();

        let files = sealed_files(dir.path()).unwrap();
        assert_eq!(files.len(), 3);
        let replayed: Vec<_> = files
            .iter()
            .flat_map(|f| SpillReader::read_all(f).unwrap())
            .collect();
        assert_eq!(replayed, records(0..3));
    }

    #[test]
    fn test_sealing_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = SpillWriter::open(&config(dir.path())).unwrap();
        assert_eq!(w.seal().unwrap(), None);
        w.append(&[]).unwrap();
        assert_eq!(w.seal().unwrap(), None);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_reopen_seals_leftover_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = SpillWriter::open(&config(dir.path())).unwrap();
        w.append(&records(0..2)).unwrap();
        // Dropped without sealing, as after a crash.
        drop(w);
        assert!(sealed_files(dir.path()).unwrap().is_empty());

        let mut w = SpillWriter::open(&config(dir.path())).unwrap();
        assert_eq!(sealed_files(dir.path()).unwrap().len(), 1);
        w.append(&records(2..4)).unwrap();
        w.seal().unwrap();

        let files = sealed_files(dir.path()).unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(SpillReader::read_all(&files[0]).unwrap(), records(0..2));
        assert_eq!(SpillReader::read_all(&files[1]).unwrap(), records(2..4));
    }

    #[test]
    fn test_corruption_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = SpillWriter::open(&config(dir.path())).unwrap();
        w.append(&records(0..3)).unwrap();
        let path = w.seal().unwrap().unwrap();

        let mut data = fs::read(&path).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xff;
        fs::write(&path, &data).unwrap();

        let results: Vec<_> = SpillReader::open(&path).unwrap().collect();
        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok() && results[1].is_ok());
        assert!(results[2].is_err());
        assert!(SpillReader::read_all(&path).is_err());

        let moved = quarantine(&path).unwrap();
        assert!(sealed_files(dir.path()).unwrap().is_empty());
        assert_eq!(corrupt_files(dir.path()).unwrap(), vec![moved]);
    }

    #[test]
    fn test_failed_append_leaves_no_torn_frame() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = SpillWriter::open(&config(dir.path())).unwrap();
        w.append(&records(0..2)).unwrap();
        w.tear_next_append(5);
        assert!(w.append(&records(9..10)).is_err());
        assert_eq!(w.records_written(), 2);

        w.append(&records(2..4)).unwrap();
        let path = w.seal().unwrap().unwrap();
        assert_eq!(SpillReader::read_all(&path).unwrap(), records(0..4));
    }

    #[test]
    fn test_truncated_tail_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = SpillWriter::open(&config(dir.path())).unwrap();
        w.append(&records(0..2)).unwrap();
        let path = w.seal().unwrap().unwrap();

        let data = fs::read(&path).unwrap();
        fs::write(&path, &data[..data.len() - 3]).unwrap();
        let results: Vec<_> = SpillReader::open(&path).unwrap().collect();
        assert_eq!(results.len(), 2);
        assert!(results[1].is_err());
    }

    #[test]
    fn test_unusable_directory() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, b"not a directory").unwrap();
        match SpillWriter::open(&SpillConfig::with_directory(blocker.join("spill"))) {
            Err(Error::SpillDirUnavailable { path, .. }) => {
                assert_eq!(path, blocker.join("spill"))
            }
            other => panic!("expected SpillDirUnavailable, got {:?}", other.map(|_| ())),
        }
    }
}
