// Physical layout of the archive.
//
// Every packet is denormalized into several partitions, one per access
// pattern: by ten-minute time block, by vessel, and by geographic cell at two
// resolutions. Packets of vessels whose position cannot be determined go into
// a per-vessel "position unknown" partition instead of the cell partitions.
// Inside a partition rows are ordered by `SortKey`.

use std::fmt;

use crate::packet::{ContentHash, VesselId};

pub mod grid;
pub mod scheme;

pub use grid::{Area, CellResolution};
pub use scheme::{PartitionScheme, Route};

/// Width of one time block, ten minutes.
pub const TIME_BLOCK_MS: i64 = 600_000;

pub fn time_block(timestamp_millis: i64) -> i64 {
    timestamp_millis.div_euclid(TIME_BLOCK_MS)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PartitionKey {
    TimeBlock(i64),
    Vessel(VesselId),
    Cell(CellResolution, u32),
    PositionUnknown(VesselId),
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionKey::TimeBlock(block) => write!(f, "time/{}", block),
            PartitionKey::Vessel(vessel) => write!(f, "vessel/{}", vessel),
            PartitionKey::Cell(res, cell) => write!(f, "cell{}/{}", res.degrees(), cell),
            PartitionKey::PositionUnknown(vessel) => write!(f, "unknown/{}", vessel),
        }
    }
}

/// Ordering key of a row within its partition: timestamp first, then content
/// hash. Two rows with the same sort key are the same row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SortKey {
    pub timestamp_millis: i64,
    pub hash: ContentHash,
}

impl SortKey {
    pub fn new(timestamp_millis: i64, hash: ContentHash) -> Self {
        SortKey {
            timestamp_millis,
            hash,
        }
    }

    /// The smallest sort key carrying `timestamp_millis`.
    pub fn lowest_at(timestamp_millis: i64) -> Self {
        SortKey::new(timestamp_millis, ContentHash::MIN)
    }
}
