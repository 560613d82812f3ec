use std::{
    fs::File,
    io::{BufReader, ErrorKind, Read},
    path::{Path, PathBuf},
};

use anyhow::{bail, Context};

use crate::packet::PacketRecord;

use super::FRAME_HEADER_LEN;

const MAX_RECORD_LEN: usize = 16 << 20;

/// Reads the records of one spill file in append order. Iteration stops after
/// the first error.
pub struct SpillReader {
    file: BufReader<File>,
    path: PathBuf,
    buf: Vec<u8>,
    offset: u64,
    done: bool,
}

impl SpillReader {
    pub fn open<P>(path: P) -> anyhow::Result<Self>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).with_context(|| format!("opening {}", path.display()))?;
        Ok(SpillReader {
            file: BufReader::new(file),
            path,
            buf: Vec::new(),
            offset: 0,
            done: false,
        })
    }

    /// Every record of the file, or the first error.
    pub fn read_all<P>(path: P) -> anyhow::Result<Vec<PacketRecord>>
    where
        P: AsRef<Path>,
    {
        SpillReader::open(path)?.collect()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_record(&mut self) -> anyhow::Result<Option<PacketRecord>> {
        let mut header = [0_u8; FRAME_HEADER_LEN];
        let mut filled = 0;
        while filled < header.len() {
            match self.file.read(&mut header[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        if filled == 0 {
            return Ok(None);
        }
        if filled < header.len() {
            bail!("truncated frame header at offset {}", self.offset);
        }

        let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        if len > MAX_RECORD_LEN {
            bail!("implausible record length {} at offset {}", len, self.offset);
        }
        self.buf.resize(len, 0);
        self.file
            .read_exact(&mut self.buf)
            .with_context(|| format!("truncated record at offset {}", self.offset))?;
        if crc32fast::hash(&self.buf) != crc {
            bail!("checksum mismatch at offset {}", self.offset);
        }
        let record = PacketRecord::from_bytes(&self.buf)
            .with_context(|| format!("undecodable record at offset {}", self.offset))?;
        self.offset += (FRAME_HEADER_LEN + len) as u64;
        Ok(Some(record))
    }
}

impl Iterator for SpillReader {
    type Item = anyhow::Result<PacketRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_record() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e.context(format!("reading {}", self.path.display()))))
            }
        }
    }
}
