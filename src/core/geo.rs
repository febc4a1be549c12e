//! Geodesic helpers: great-circle distance, bounding boxes and a local
//! planar projection for spatial indexing

#[allow(deprecated)]
use geo::HaversineDistance;
use geo::Point;
use serde::Serialize;

use crate::core::model::Coordinate;

/// Metres per degree of latitude on the mean earth sphere
const METRES_PER_DEGREE: f64 = 111_320.0;

/// Great-circle distance between two positions in metres
#[allow(deprecated)]
pub fn haversine_distance(a: Coordinate, b: Coordinate) -> f64 {
    let p1 = Point::new(a.longitude, a.latitude);
    let p2 = Point::new(b.longitude, b.latitude);
    p1.haversine_distance(&p2)
}

/// Axis-aligned box in degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BoundingBox {
    pub south: f64,
    pub west: f64,
    pub north: f64,
    pub east: f64,
}

impl BoundingBox {
    /// Smallest box containing all positions, grown by `padding_m` on each side
    pub fn around(positions: &[Coordinate], padding_m: f64) -> Option<Self> {
        let first = positions.first()?;
        let mut bbox = BoundingBox {
            south: first.latitude,
            west: first.longitude,
            north: first.latitude,
            east: first.longitude,
        };
        for p in &positions[1..] {
            bbox.south = bbox.south.min(p.latitude);
            bbox.north = bbox.north.max(p.latitude);
            bbox.west = bbox.west.min(p.longitude);
            bbox.east = bbox.east.max(p.longitude);
        }

        let dlat = padding_m / METRES_PER_DEGREE;
        let mid_lat = ((bbox.south + bbox.north) / 2.0).to_radians();
        let dlon = padding_m / (METRES_PER_DEGREE * mid_lat.cos().max(0.01));
        Some(BoundingBox {
            south: (bbox.south - dlat).max(-90.0),
            west: (bbox.west - dlon).max(-180.0),
            north: (bbox.north + dlat).min(90.0),
            east: (bbox.east + dlon).min(180.0),
        })
    }

    pub fn contains(&self, c: Coordinate) -> bool {
        (self.south..=self.north).contains(&c.latitude) && (self.west..=self.east).contains(&c.longitude)
    }
}

/// Equirectangular projection around a reference point
///
/// Accurate to well under a metre over the few kilometres a single route
/// box spans, which is all nearest-feature lookups need.
#[derive(Debug, Clone, Copy)]
pub struct LocalProjection {
    origin: Coordinate,
    lon_scale: f64,
}

impl LocalProjection {
    pub fn new(origin: Coordinate) -> Self {
        Self {
            origin,
            lon_scale: origin.latitude.to_radians().cos() * METRES_PER_DEGREE,
        }
    }

    /// Project to `[x, y]` metres east/north of the origin
    pub fn project(&self, c: Coordinate) -> [f64; 2] {
        [
            (c.longitude - self.origin.longitude) * self.lon_scale,
            (c.latitude - self.origin.latitude) * METRES_PER_DEGREE,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_haversine_sanity() {
        // Brussels -> Antwerp, ~41 km
        let d = haversine_distance(Coordinate::new(50.8503, 4.3517), Coordinate::new(51.2194, 4.4025));
        assert!((40_000.0..42_500.0).contains(&d), "got {d}");
        let zero = haversine_distance(Coordinate::new(50.0, 4.0), Coordinate::new(50.0, 4.0));
        assert_eq!(zero, 0.0);
    }

    #[test]
    fn test_bbox_padding() {
        let positions = [Coordinate::new(50.0, 4.0), Coordinate::new(50.01, 4.02)];
        let bbox = BoundingBox::around(&positions, 100.0).unwrap();
        assert!(bbox.south < 50.0 && bbox.north > 50.01);
        assert!(bbox.west < 4.0 && bbox.east > 4.02);
        assert!(bbox.contains(Coordinate::new(50.005, 4.01)));
        assert!(BoundingBox::around(&[], 10.0).is_none());
    }

    #[test]
    fn test_local_projection_matches_haversine() {
        let origin = Coordinate::new(50.0, 4.0);
        let other = Coordinate::new(50.001, 4.001);
        let projection = LocalProjection::new(origin);
        let [x, y] = projection.project(other);
        let planar = (x * x + y * y).sqrt();
        let geodesic = haversine_distance(origin, other);
        assert!((planar - geodesic).abs() < 0.5, "planar {planar} vs {geodesic}");
    }
}
