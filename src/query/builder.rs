use std::{fmt, ops::Range};

use crate::{
    packet::VesselId,
    partition::{time_block, Area, CellResolution, PartitionKey},
    Error,
};

/// Which partition family a query reads.
#[derive(Debug, Clone, PartialEq)]
pub enum Selector {
    Time,
    Vessels(Vec<VesselId>),
    Area(Area),
}

/// The partitions one shard reads, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShardSpan {
    Partition(PartitionKey),
    /// Consecutive time blocks `first..=last`.
    TimeBlocks { first: i64, last: i64 },
}

impl fmt::Display for ShardSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardSpan::Partition(key) => write!(f, "{}", key),
            ShardSpan::TimeBlocks { first, last } => write!(f, "time/{}..={}", first, last),
        }
    }
}

/// The resolved form of a [`QueryBuilder`]: every shard the query fans out
/// to, bound to the same `[start, stop)` interval.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryPlan {
    pub shards: Vec<ShardSpan>,
    pub start_millis: i64,
    pub stop_millis: i64,
    pub page_size: Option<usize>,
    /// Grid used by an area query.
    pub resolution: Option<CellResolution>,
}

/// Describes a range query: one selector and a start-inclusive,
/// stop-exclusive interval in epoch millis.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryBuilder {
    selector: Selector,
    start_millis: i64,
    stop_millis: i64,
    page_size: Option<usize>,
}

impl QueryBuilder {
    fn new(selector: Selector, interval: Range<i64>) -> Self {
        QueryBuilder {
            selector,
            start_millis: interval.start,
            stop_millis: interval.end,
            page_size: None,
        }
    }

    /// Everything received in `interval`. Reads every time block the interval
    /// touches, so it is meant for short intervals.
    pub fn for_time(interval: Range<i64>) -> Self {
        QueryBuilder::new(Selector::Time, interval)
    }

    pub fn for_vessels<I>(vessels: I, interval: Range<i64>) -> Self
    where
        I: IntoIterator<Item = VesselId>,
    {
        QueryBuilder::new(Selector::Vessels(vessels.into_iter().collect()), interval)
    }

    pub fn for_area(area: Area, interval: Range<i64>) -> Self {
        QueryBuilder::new(Selector::Area(area), interval)
    }

    /// Rows fetched per page, overriding the engine default.
    pub fn page_size(mut self, rows: usize) -> Self {
        self.page_size = Some(rows);
        self
    }

    pub fn selector(&self) -> &Selector {
        &self.selector
    }

    /// Resolves the shards of the query. `oversampling` decides between the
    /// grids of an area query: the one degree grid is used while the area
    /// needs fewer than `oversampling` times as many one degree cells as ten
    /// degree cells.
    pub fn plan(&self, oversampling: usize) -> Result<QueryPlan, Error> {
        if self.start_millis > self.stop_millis {
            return Err(Error::InvalidQuery(format!(
                "interval start {} is after stop {}",
                self.start_millis, self.stop_millis
            )));
        }
        if self.page_size == Some(0) {
            return Err(Error::InvalidQuery("page size must be positive".into()));
        }

        let empty = self.start_millis == self.stop_millis;
        let mut resolution = None;
        let shards = match &self.selector {
            Selector::Vessels(vessels) if vessels.is_empty() => {
                return Err(Error::InvalidQuery(
                    "at least one vessel id is required".into(),
                ));
            }
            _ if empty => Vec::new(),
            Selector::Time => vec![ShardSpan::TimeBlocks {
                first: time_block(self.start_millis),
                last: time_block(self.stop_millis - 1),
            }],
            Selector::Vessels(vessels) => {
                let mut vessels = vessels.clone();
                vessels.sort_unstable();
                vessels.dedup();
                // A vessel's packets live in one of these two, never both.
                vessels
                    .into_iter()
                    .flat_map(|v| {
                        [
                            ShardSpan::Partition(PartitionKey::Vessel(v)),
                            ShardSpan::Partition(PartitionKey::PositionUnknown(v)),
                        ]
                    })
                    .collect()
            }
            Selector::Area(area) => {
                let ones = CellResolution::One.cells(area);
                let tens = CellResolution::Ten.cells(area);
                let (res, cells) = if tens.len() * oversampling > ones.len() {
                    (CellResolution::One, ones)
                } else {
                    (CellResolution::Ten, tens)
                };
                resolution = Some(res);
                cells
                    .into_iter()
                    .map(|cell| ShardSpan::Partition(PartitionKey::Cell(res, cell)))
                    .collect()
            }
        };

        Ok(QueryPlan {
            shards,
            start_millis: self.start_millis,
            stop_millis: self.stop_millis,
            page_size: self.page_size,
            resolution,
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        packet::Position,
        partition::{Area, CellResolution, PartitionKey},
        Error,
    };

    use super::{QueryBuilder, ShardSpan};

    #[test]
    fn test_time_plan_spans_blocks() {
        let plan = QueryBuilder::for_time(0..1_200_000).plan(10).unwrap();
        assert_eq!(plan.shards, vec![ShardSpan::TimeBlocks { first: 0, last: 1 }]);

        // The stop is exclusive, so a query ending on a block boundary does not
        // touch the next block.
        let plan = QueryBuilder::for_time(599_999..600_000).plan(10).unwrap();
        assert_eq!(plan.shards, vec![ShardSpan::TimeBlocks { first: 0, last: 0 }]);
        assert_eq!(plan.shards[0].to_string(), "time/0..=0");
    }

    #[test]
    fn test_vessel_plan() {
        let plan = QueryBuilder::for_vessels([7, 3, 7], 0..10).plan(10).unwrap();
        assert_eq!(
            plan.shards,
            vec![
                ShardSpan::Partition(PartitionKey::Vessel(3)),
                ShardSpan::Partition(PartitionKey::PositionUnknown(3)),
                ShardSpan::Partition(PartitionKey::Vessel(7)),
                ShardSpan::Partition(PartitionKey::PositionUnknown(7)),
            ]
        );
    }

    #[test]
    fn test_area_resolution_choice() {
        let small = Area::bounding_box(54.5, 9.5, 56.5, 12.5);
        let plan = QueryBuilder::for_area(small, 0..10).plan(10).unwrap();
        assert_eq!(plan.resolution, Some(CellResolution::One));
        assert_eq!(plan.shards.len(), 12);

        let large = Area::bounding_box(20.0, -40.0, 59.9, 19.9);
        let plan = QueryBuilder::for_area(large, 0..10).plan(10).unwrap();
        assert_eq!(plan.resolution, Some(CellResolution::Ten));
        assert_eq!(plan.shards.len(), 4 * 6);

        let circle = Area::circle(Position::new(56.5, 10.5), 5000.0);
        let plan = QueryBuilder::for_area(circle, 0..10).plan(10).unwrap();
        assert_eq!(plan.resolution, Some(CellResolution::One));
        assert_eq!(
            plan.shards,
            vec![ShardSpan::Partition(PartitionKey::Cell(
                CellResolution::One,
                CellResolution::One.cell_id(Position::new(56.5, 10.5))
            ))]
        );
    }

    #[test]
    fn test_invalid_queries() {
        assert!(matches!(
            QueryBuilder::for_vessels([], 0..10).plan(10),
            Err(Error::InvalidQuery(_))
        ));
        assert!(matches!(
            QueryBuilder::for_time(10..0).plan(10),
            Err(Error::InvalidQuery(_))
        ));
        assert!(matches!(
            QueryBuilder::for_time(0..10).page_size(0).plan(10),
            Err(Error::InvalidQuery(_))
        ));
        let empty = QueryBuilder::for_time(5..5).plan(10).unwrap();
        assert!(empty.shards.is_empty());
    }
}
