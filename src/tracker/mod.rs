//! Last known position per vessel.
//!
//! Entries are never evicted on their own; staleness is decided when reading,
//! against the timestamp of the packet asking. The map holds one entry per
//! vessel ever seen.

use dashmap::{mapref::entry::Entry, DashMap};

use crate::packet::{Position, VesselId};

/// How long an observed position may be used for packets without one.
pub const POSITION_TTL_MS: i64 = 1_200_000;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionEstimate {
    pub position: Position,
    pub observed_at_millis: i64,
}

#[derive(Debug)]
pub struct PositionTracker {
    entries: DashMap<VesselId, PositionEstimate>,
    ttl_millis: i64,
}

impl Default for PositionTracker {
    fn default() -> Self {
        PositionTracker::new()
    }
}

impl PositionTracker {
    pub fn new() -> Self {
        PositionTracker::with_ttl(POSITION_TTL_MS)
    }

    pub fn with_ttl(ttl_millis: i64) -> Self {
        PositionTracker {
            entries: DashMap::new(),
            ttl_millis,
        }
    }

    pub fn ttl_millis(&self) -> i64 {
        self.ttl_millis
    }

    /// Overwrites the entry for `vessel`.
    pub fn update(&self, vessel: VesselId, position: Position, observed_at_millis: i64) {
        self.entries.insert(
            vessel,
            PositionEstimate {
                position,
                observed_at_millis,
            },
        );
    }

    /// Replaces the entry for `vessel` unless it holds a strictly later
    /// observation. Returns whether the entry was written.
    pub fn update_if_newer(
        &self,
        vessel: VesselId,
        position: Position,
        observed_at_millis: i64,
    ) -> bool {
        let estimate = PositionEstimate {
            position,
            observed_at_millis,
        };
        match self.entries.entry(vessel) {
            Entry::Occupied(mut entry) => {
                if entry.get().observed_at_millis > observed_at_millis {
                    return false;
                }
                entry.insert(estimate);
                true
            }
            Entry::Vacant(entry) => {
                entry.insert(estimate);
                true
            }
        }
    }

    pub fn get(&self, vessel: VesselId) -> Option<PositionEstimate> {
        self.entries.get(&vessel).map(|e| *e)
    }

    /// The position of `vessel` if it was observed less than the TTL before
    /// `now_millis`.
    pub fn get_if_fresh(&self, vessel: VesselId, now_millis: i64) -> Option<Position> {
        let estimate = self.get(vessel)?;
        if now_millis - estimate.observed_at_millis < self.ttl_millis {
            Some(estimate.position)
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
