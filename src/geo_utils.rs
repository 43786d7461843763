//! # Geographic Utilities
//!
//! Small geometry helpers shared by the normalizer, the aggregator and the
//! HTTP layer.
//!
//! ## Overview
//!
//! | Function | Description |
//! |----------|-------------|
//! | [`value_bounds`] | Bounding box of a raw GeoJSON geometry value |
//! | [`geojson_bounds`] | Bounding box of a Geometry, Feature or FeatureCollection |
//! | [`compute_bounds`] | Bounding box of a set of points |
//! | [`is_valid_point`] | Finite WGS84 coordinate check |
//! | [`is_ring_closed`] | First coordinate equals last |
//! | [`close_ring`] | Append the first coordinate when a ring is open |
//! | [`polygon_to_geojson`] | `geo` polygon into a GeoJSON geometry |
//!
//! ## Example
//!
//! ```rust
//! use fair_task_insights::geo_utils;
//! use geojson::Value;
//!
//! let multi = Value::MultiPolygon(vec![
//!     vec![vec![vec![0.0, 0.0], vec![1.0, 0.0], vec![1.0, 1.0], vec![0.0, 0.0]]],
//!     vec![vec![vec![3.0, 3.0], vec![4.0, 3.0], vec![4.0, 4.0], vec![3.0, 3.0]]],
//! ]);
//!
//! let bounds = geo_utils::value_bounds(&multi).unwrap();
//! assert_eq!(bounds.to_array(), [0.0, 0.0, 4.0, 4.0]);
//! ```
//!
//! ## Raw positions
//!
//! The bounding-box helpers read positions straight from the GeoJSON value
//! rather than converting to `geo` types first. A geometry that `geo` refuses
//! (unclosed rings, too few positions) still has a usable extent, which is
//! what the normalizer falls back to when a union cannot be computed.
//!
//! ### Coordinate System
//!
//! All functions expect WGS84 coordinates in `[longitude, latitude]` order,
//! the GeoJSON convention.

use geo::{Coord, Point, Polygon};
use geojson::{GeoJson, Position, Value};
use crate::Bounds;

// =============================================================================
// Bounding Box Functions
// =============================================================================

/// Extend-as-you-go bounding box accumulator.
#[derive(Debug, Clone, Copy)]
struct BoundsBuilder {
    min_lat: f64,
    max_lat: f64,
    min_lng: f64,
    max_lng: f64,
    seen: bool,
}

impl BoundsBuilder {
    fn new() -> Self {
        Self {
            min_lat: f64::INFINITY,
            max_lat: f64::NEG_INFINITY,
            min_lng: f64::INFINITY,
            max_lng: f64::NEG_INFINITY,
            seen: false,
        }
    }

    fn add(&mut self, lng: f64, lat: f64) {
        if !lng.is_finite() || !lat.is_finite() {
            return;
        }
        self.min_lat = self.min_lat.min(lat);
        self.max_lat = self.max_lat.max(lat);
        self.min_lng = self.min_lng.min(lng);
        self.max_lng = self.max_lng.max(lng);
        self.seen = true;
    }

    fn add_position(&mut self, position: &Position) {
        if position.len() >= 2 {
            self.add(position[0], position[1]);
        }
    }

    fn add_value(&mut self, value: &Value) {
        match value {
            Value::Point(p) => self.add_position(p),
            Value::MultiPoint(ps) | Value::LineString(ps) => {
                ps.iter().for_each(|p| self.add_position(p));
            }
            Value::MultiLineString(lines) | Value::Polygon(lines) => {
                lines.iter().flatten().for_each(|p| self.add_position(p));
            }
            Value::MultiPolygon(polygons) => {
                polygons.iter().flatten().flatten().for_each(|p| self.add_position(p));
            }
            Value::GeometryCollection(geometries) => {
                geometries.iter().for_each(|g| self.add_value(&g.value));
            }
        }
    }

    fn build(self) -> Option<Bounds> {
        self.seen.then_some(Bounds {
            min_lat: self.min_lat,
            max_lat: self.max_lat,
            min_lng: self.min_lng,
            max_lng: self.max_lng,
        })
    }
}

/// Bounding box of a raw GeoJSON geometry value.
///
/// Positions with fewer than two ordinates or non-finite values are ignored.
/// Returns `None` when no usable position remains.
pub fn value_bounds(value: &Value) -> Option<Bounds> {
    let mut builder = BoundsBuilder::new();
    builder.add_value(value);
    builder.build()
}

/// Bounding box of any GeoJSON object.
///
/// Features without geometry contribute nothing; a FeatureCollection's box
/// covers every member geometry.
pub fn geojson_bounds(geojson: &GeoJson) -> Option<Bounds> {
    let mut builder = BoundsBuilder::new();
    match geojson {
        GeoJson::Geometry(g) => builder.add_value(&g.value),
        GeoJson::Feature(f) => {
            if let Some(g) = &f.geometry {
                builder.add_value(&g.value);
            }
        }
        GeoJson::FeatureCollection(fc) => {
            for g in fc.features.iter().filter_map(|f| f.geometry.as_ref()) {
                builder.add_value(&g.value);
            }
        }
    }
    builder.build()
}

/// Compute the bounding box of a set of points.
///
/// Returns `None` for empty input or when every point is non-finite.
///
/// # Example
///
/// ```rust
/// use fair_task_insights::geo_utils;
/// use geo::point;
///
/// let points = vec![point!(x: -0.13, y: 51.50), point!(x: -0.12, y: 51.51)];
/// let bounds = geo_utils::compute_bounds(&points).unwrap();
/// assert_eq!(bounds.min_lat, 51.50);
/// assert_eq!(bounds.max_lng, -0.12);
/// ```
pub fn compute_bounds(points: &[Point<f64>]) -> Option<Bounds> {
    let mut builder = BoundsBuilder::new();
    for p in points {
        builder.add(p.x(), p.y());
    }
    builder.build()
}

// =============================================================================
// Validation
// =============================================================================

/// Check that a point has finite WGS84 coordinates.
#[inline]
pub fn is_valid_point(point: &Point<f64>) -> bool {
    let (lng, lat) = (point.x(), point.y());
    lng.is_finite()
        && lat.is_finite()
        && (-90.0..=90.0).contains(&lat)
        && (-180.0..=180.0).contains(&lng)
}

/// A ring is closed when its first coordinate equals its last.
///
/// Empty rings are not closed.
pub fn is_ring_closed(ring: &[Coord<f64>]) -> bool {
    match (ring.first(), ring.last()) {
        (Some(first), Some(last)) => first == last,
        _ => false,
    }
}

/// Append the first coordinate to an open ring. No-op for closed or empty rings.
pub fn close_ring(ring: &mut Vec<Coord<f64>>) {
    if let Some(&first) = ring.first() {
        if !is_ring_closed(ring) {
            ring.push(first);
        }
    }
}

// =============================================================================
// Conversion
// =============================================================================

/// Convert a `geo` polygon into a GeoJSON geometry object.
pub fn polygon_to_geojson(polygon: &Polygon<f64>) -> geojson::Geometry {
    geojson::Geometry::new(Value::from(polygon))
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use geo::point;
    use geojson::{Feature, FeatureCollection};

    fn square_value(x: f64, y: f64) -> Value {
        Value::Polygon(vec![vec![
            vec![x, y],
            vec![x + 1.0, y],
            vec![x + 1.0, y + 1.0],
            vec![x, y + 1.0],
            vec![x, y],
        ]])
    }

    #[test]
    fn test_value_bounds_polygon() {
        let bounds = value_bounds(&square_value(2.0, 3.0)).unwrap();
        assert_eq!(bounds.to_array(), [2.0, 3.0, 3.0, 4.0]);
    }

    #[test]
    fn test_value_bounds_skips_short_positions() {
        let value = Value::LineString(vec![vec![1.0], vec![2.0, 5.0], vec![f64::NAN, 1.0]]);
        let bounds = value_bounds(&value).unwrap();
        assert_eq!(bounds.to_array(), [2.0, 5.0, 2.0, 5.0]);
    }

    #[test]
    fn test_value_bounds_empty() {
        assert!(value_bounds(&Value::MultiPolygon(vec![])).is_none());
    }

    #[test]
    fn test_geojson_bounds_feature_collection() {
        let fc = FeatureCollection {
            bbox: None,
            features: vec![
                Feature::from(geojson::Geometry::new(square_value(0.0, 0.0))),
                Feature::from(geojson::Geometry::new(square_value(5.0, -2.0))),
            ],
            foreign_members: None,
        };
        let bounds = geojson_bounds(&GeoJson::FeatureCollection(fc)).unwrap();
        assert_eq!(bounds.to_array(), [0.0, -2.0, 6.0, 1.0]);
    }

    #[test]
    fn test_compute_bounds_empty() {
        assert!(compute_bounds(&[]).is_none());
    }

    #[test]
    fn test_is_valid_point() {
        assert!(is_valid_point(&point!(x: -0.1278, y: 51.5074)));
        assert!(!is_valid_point(&point!(x: 0.0, y: 91.0)));
        assert!(!is_valid_point(&point!(x: 181.0, y: 0.0)));
        assert!(!is_valid_point(&point!(x: f64::NAN, y: 0.0)));
    }

    #[test]
    fn test_close_ring() {
        let mut ring = vec![
            Coord { x: 0.0, y: 0.0 },
            Coord { x: 1.0, y: 0.0 },
            Coord { x: 1.0, y: 1.0 },
        ];
        assert!(!is_ring_closed(&ring));
        close_ring(&mut ring);
        assert!(is_ring_closed(&ring));
        assert_eq!(ring.len(), 4);

        close_ring(&mut ring);
        assert_eq!(ring.len(), 4);
    }

    #[test]
    fn test_polygon_to_geojson_is_closed() {
        let polygon = Bounds { min_lat: 0.0, max_lat: 1.0, min_lng: 0.0, max_lng: 1.0 }.to_polygon();
        let geometry = polygon_to_geojson(&polygon);
        match geometry.value {
            Value::Polygon(rings) => {
                assert_eq!(rings[0].first(), rings[0].last());
            }
            other => panic!("expected polygon, got {:?}", other),
        }
    }
}
