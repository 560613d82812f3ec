use std::sync::Arc;

use bytes::Bytes;

use crate::{
    packet::{PacketRecord, Position},
    store::WriteEntry,
    tracker::PositionTracker,
};

use super::{time_block, CellResolution, PartitionKey, SortKey};

/// The partitions a single packet is written to. All of them share the same
/// sort key and payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    pub sort_key: SortKey,
    pub payload: Bytes,
    pub partitions: Vec<PartitionKey>,
    /// Whether the cell partitions were chosen from an estimated position.
    pub estimated: bool,
}

impl Route {
    pub fn entries(&self) -> impl Iterator<Item = WriteEntry> + '_ {
        self.partitions.iter().map(|partition| WriteEntry {
            partition: *partition,
            sort_key: self.sort_key,
            payload: self.payload.clone(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct PartitionScheme {
    tracker: Arc<PositionTracker>,
}

impl PartitionScheme {
    pub fn new(tracker: Arc<PositionTracker>) -> Self {
        PartitionScheme { tracker }
    }

    pub fn tracker(&self) -> &Arc<PositionTracker> {
        &self.tracker
    }

    /// Decides where `packet` is stored.
    ///
    /// The only side effect is feeding an observed position into the tracker.
    /// Estimated positions are never fed back, so estimates cannot chain.
    pub fn route(&self, packet: &PacketRecord) -> Route {
        let ts = packet.timestamp_millis();
        let mut partitions = Vec::with_capacity(4);
        partitions.push(PartitionKey::TimeBlock(time_block(ts)));

        let mut estimated = false;
        // Packets that could not be attributed to a vessel are only kept by time.
        if let Some(vessel) = packet.vessel_id() {
            let position = match packet.position() {
                Some(p) => {
                    self.tracker.update_if_newer(vessel, p, ts);
                    Some(p)
                }
                None => {
                    let p = self.tracker.get_if_fresh(vessel, ts);
                    estimated = p.is_some();
                    p
                }
            };

            match position {
                Some(p) => {
                    partitions.push(PartitionKey::Vessel(vessel));
                    partitions.extend(cell_partitions(p));
                }
                None => partitions.push(PartitionKey::PositionUnknown(vessel)),
            }
        }

        Route {
            sort_key: packet.sort_key(),
            payload: packet.to_bytes(),
            partitions,
            estimated,
        }
    }
}

fn cell_partitions(p: Position) -> [PartitionKey; 2] {
    [
        PartitionKey::Cell(CellResolution::One, CellResolution::One.cell_id(p)),
        PartitionKey::Cell(CellResolution::Ten, CellResolution::Ten.cell_id(p)),
    ]
}

#[cfg(test)]
mod tests {
    use std::{fmt::Write, sync::Arc};

    use crate::{
        packet::{PacketRecord, Position},
        partition::{CellResolution, PartitionKey},
        tracker::{PositionTracker, POSITION_TTL_MS},
    };

    use super::PartitionScheme;

    fn parse_packet(line: &str) -> PacketRecord {
        let mut ts = None;
        let mut payload = String::new();
        let mut vessel = None;
        let mut position = None;
        for field in line.split_whitespace() {
            let (name, value) = field.split_once('=').unwrap();
            match name {
                "ts" => ts = Some(value.parse::<i64>().unwrap()),
                "payload" => payload = value.to_owned(),
                "vessel" => vessel = Some(value.parse::<u32>().unwrap()),
                "pos" => {
                    let (lat, lon) = value.split_once(',').unwrap();
                    position = Some(Position::new(lat.parse().unwrap(), lon.parse().unwrap()));
                }
                _ => panic!("unknown packet field {}", name),
            }
        }
        let mut packet = PacketRecord::new(ts.expect("packet needs ts"), payload.into_bytes());
        if let Some(v) = vessel {
            packet = packet.with_vessel(v);
        }
        if let Some(p) = position {
            packet = packet.with_position(p);
        }
        packet
    }

    #[test]
    fn test_routing() {
        datadriven::walk("src/partition/testdata/", |f| {
            let mut scheme = PartitionScheme::new(Arc::new(PositionTracker::new()));
            f.run(|test_case| match test_case.directive.as_str() {
                "reset" => {
                    scheme = PartitionScheme::new(Arc::new(PositionTracker::new()));
                    "ok\n".into()
                }
                "route" => {
                    let mut out = String::new();
                    for line in test_case.input.lines() {
                        let route = scheme.route(&parse_packet(line));
                        let keys: Vec<String> =
                            route.partitions.iter().map(|k| k.to_string()).collect();
                        let suffix = if route.estimated { " (estimated)" } else { "" };
                        writeln!(
                            &mut out,
                            "{} @{}{}",
                            keys.join(" "),
                            route.sort_key.timestamp_millis,
                            suffix
                        )
                        .unwrap();
                    }
                    out
                }
                "tracker" => {
                    let vessel = test_case.input.trim().parse::<u32>().unwrap();
                    match scheme.tracker().get(vessel) {
                        None => "none\n".into(),
                        Some(e) => format!(
                            "{},{} @{}\n",
                            e.position.lat, e.position.lon, e.observed_at_millis
                        ),
                    }
                }
                _ => panic!("unhandled"),
            })
        })
    }

    #[test]
    fn test_denormalizes_positioned_packet() {
        let scheme = PartitionScheme::new(Arc::new(PositionTracker::new()));
        let packet = PacketRecord::new(1000, &b"H1"[..])
            .with_vessel(123_456_789)
            .with_position(Position::new(56.0, 10.0));
        let route = scheme.route(&packet);
        let p = Position::new(56.0, 10.0);
        assert_eq!(
            route.partitions,
            vec![
                PartitionKey::TimeBlock(0),
                PartitionKey::Vessel(123_456_789),
                PartitionKey::Cell(CellResolution::One, CellResolution::One.cell_id(p)),
                PartitionKey::Cell(CellResolution::Ten, CellResolution::Ten.cell_id(p)),
            ]
        );
        let entries: Vec<_> = route.entries().collect();
        assert_eq!(entries.len(), 4);
        assert!(entries
            .iter()
            .all(|e| e.sort_key == packet.sort_key() && e.payload == packet.to_bytes()));
    }

    #[test]
    fn test_estimate_expires_after_ttl() {
        let scheme = PartitionScheme::new(Arc::new(PositionTracker::new()));
        let t0 = 5_000_000;
        scheme.route(
            &PacketRecord::new(t0, &b"fix"[..])
                .with_vessel(9)
                .with_position(Position::new(1.0, 2.0)),
        );

        let inside = scheme.route(&PacketRecord::new(t0 + POSITION_TTL_MS - 1, &b"a"[..]).with_vessel(9));
        assert!(inside.estimated);
        assert!(inside.partitions.contains(&PartitionKey::Vessel(9)));

        let outside = scheme.route(&PacketRecord::new(t0 + POSITION_TTL_MS + 1, &b"b"[..]).with_vessel(9));
        assert!(!outside.estimated);
        assert_eq!(outside.partitions.len(), 2);
        assert_eq!(outside.partitions[1], PartitionKey::PositionUnknown(9));
    }
}
