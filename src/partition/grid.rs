// Fixed geographic grids used by the cell partitions.
//
// A cell is a square of `degrees` side. Cells are numbered row by row from
// the south-west corner (-90, -180): the id of the cell at latitude row `r`
// and longitude column `c` is `r * (360 / degrees) + c`.

use std::collections::BTreeSet;

use crate::packet::Position;

const METERS_PER_DEGREE_LAT: f64 = 111_320.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CellResolution {
    One,
    Ten,
}

impl CellResolution {
    pub fn degrees(self) -> u32 {
        match self {
            CellResolution::One => 1,
            CellResolution::Ten => 10,
        }
    }

    fn rows(self) -> u32 {
        180 / self.degrees()
    }

    fn columns(self) -> u32 {
        360 / self.degrees()
    }

    fn row(self, lat: f64) -> u32 {
        let idx = ((lat + 90.0) / self.degrees() as f64).floor();
        idx.clamp(0.0, (self.rows() - 1) as f64) as u32
    }

    fn column(self, lon: f64) -> u32 {
        let idx = ((lon + 180.0) / self.degrees() as f64).floor();
        idx.clamp(0.0, (self.columns() - 1) as f64) as u32
    }

    pub fn cell_id(self, position: Position) -> u32 {
        self.row(position.lat) * self.columns() + self.column(position.lon)
    }

    /// All cells of this grid intersecting `area`.
    pub fn cells(self, area: &Area) -> BTreeSet<u32> {
        let (min, max) = area.bounds();
        let mut cells = BTreeSet::new();
        for row in self.row(min.lat)..=self.row(max.lat) {
            for column in self.column(min.lon)..=self.column(max.lon) {
                cells.insert(row * self.columns() + column);
            }
        }
        cells
    }
}

/// A query area. Longitude ranges do not wrap around the antimeridian.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Area {
    BoundingBox { south_west: Position, north_east: Position },
    Circle { center: Position, radius_meters: f64 },
}

impl Area {
    pub fn bounding_box(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> Self {
        Area::BoundingBox {
            south_west: Position::new(lat1.min(lat2), lon1.min(lon2)),
            north_east: Position::new(lat1.max(lat2), lon1.max(lon2)),
        }
    }

    pub fn circle(center: Position, radius_meters: f64) -> Self {
        Area::Circle {
            center,
            radius_meters: radius_meters.abs(),
        }
    }

    /// South-west and north-east corners of the smallest box enclosing the
    /// area, clamped to valid coordinates.
    pub fn bounds(&self) -> (Position, Position) {
        match *self {
            Area::BoundingBox {
                south_west,
                north_east,
            } => (south_west, north_east),
            Area::Circle {
                center,
                radius_meters,
            } => {
                let dlat = radius_meters / METERS_PER_DEGREE_LAT;
                let cos = center.lat.to_radians().cos().max(1e-6);
                let dlon = (radius_meters / (METERS_PER_DEGREE_LAT * cos)).min(180.0);
                (
                    Position::new((center.lat - dlat).max(-90.0), (center.lon - dlon).max(-180.0)),
                    Position::new((center.lat + dlat).min(90.0), (center.lon + dlon).min(180.0)),
                )
            }
        }
    }
}
