//! Project boundary normalization.
//!
//! The prediction service accepts exactly one Polygon as its region of
//! interest, while Tasking Manager boundaries are often MultiPolygons (and
//! user uploads can be whole FeatureCollections). [`normalize_geometry`]
//! reduces any of these to a single Polygon:
//!
//! - Polygon: returned unchanged
//! - MultiPolygon: members folded left-to-right with a geometric union
//! - FeatureCollection: Polygon/MultiPolygon members folded the same way,
//!   everything else dropped
//! - any other geometry: its bounding box
//!
//! A union that fails, or that leaves more than one disjoint part, falls back
//! to the bounding box of the input. Nothing here returns an error; the only
//! failure mode is `None` ("no usable geometry").

use geo::{BooleanOps, Coord, LineString, Polygon};
use geojson::{GeoJson, Position, Value};
use log::{debug, info, warn};
use std::panic::{catch_unwind, AssertUnwindSafe};

use crate::geo_utils::{close_ring, value_bounds};
use crate::{Bounds, Error, Result};

/// Outcome of normalization, recording which path produced the polygon.
#[derive(Debug, Clone, PartialEq)]
pub enum Normalized {
    /// Input was already a Polygon
    Unchanged(Polygon<f64>),
    /// Members were merged into one Polygon
    Unioned(Polygon<f64>),
    /// Union was not possible; the input's bounding box stands in
    BoundingBox(Polygon<f64>),
}

impl Normalized {
    pub fn polygon(&self) -> &Polygon<f64> {
        match self {
            Normalized::Unchanged(p) | Normalized::Unioned(p) | Normalized::BoundingBox(p) => p,
        }
    }

    pub fn into_polygon(self) -> Polygon<f64> {
        match self {
            Normalized::Unchanged(p) | Normalized::Unioned(p) | Normalized::BoundingBox(p) => p,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, Normalized::BoundingBox(_))
    }
}

/// Pairwise polygon union used when folding multi-part boundaries.
///
/// An implementation must return exactly one Polygon or an error; a result
/// with several disjoint parts counts as a failure.
pub trait PolygonUnion {
    fn union(&self, a: &Polygon<f64>, b: &Polygon<f64>) -> Result<Polygon<f64>>;
}

/// [`PolygonUnion`] backed by `geo`'s boolean operations.
#[derive(Debug, Clone, Copy, Default)]
pub struct BooleanUnion;

impl PolygonUnion for BooleanUnion {
    fn union(&self, a: &Polygon<f64>, b: &Polygon<f64>) -> Result<Polygon<f64>> {
        let merged = catch_unwind(AssertUnwindSafe(|| BooleanOps::union(a, b)))
            .map_err(|_| Error::Union("boolean operation panicked".to_string()))?;

        let mut parts = merged.0;
        match parts.len() {
            1 => Ok(parts.remove(0)),
            0 => Err(Error::Union("union produced an empty geometry".to_string())),
            n => Err(Error::Union(format!("union produced {} disjoint parts", n))),
        }
    }
}

/// Normalize with the default [`BooleanUnion`].
///
/// # Example
///
/// ```rust
/// use fair_task_insights::{normalize_geometry, Normalized};
/// use geojson::{GeoJson, Geometry, Value};
///
/// let square = |x: f64| vec![vec![
///     vec![x, 0.0], vec![x + 1.0, 0.0], vec![x + 1.0, 1.0], vec![x, 1.0], vec![x, 0.0],
/// ]];
///
/// // Two touching squares merge into one polygon
/// let multi = GeoJson::Geometry(Geometry::new(Value::MultiPolygon(vec![square(0.0), square(1.0)])));
/// let result = normalize_geometry(&multi).unwrap();
/// assert!(matches!(result, Normalized::Unioned(_)));
/// ```
pub fn normalize_geometry(geojson: &GeoJson) -> Option<Normalized> {
    normalize_with(geojson, &BooleanUnion)
}

/// Normalize with a caller-supplied union implementation.
pub fn normalize_with<U: PolygonUnion>(geojson: &GeoJson, unioner: &U) -> Option<Normalized> {
    match geojson {
        GeoJson::Geometry(g) => normalize_value(&g.value, unioner),
        GeoJson::Feature(f) => f.geometry.as_ref().and_then(|g| normalize_value(&g.value, unioner)),
        GeoJson::FeatureCollection(fc) => {
            let members: Vec<&Value> = fc
                .features
                .iter()
                .filter_map(|f| f.geometry.as_ref())
                .map(|g| &g.value)
                .filter(|v| matches!(v, Value::Polygon(_) | Value::MultiPolygon(_)))
                .collect();

            if members.is_empty() {
                warn!("[Normalize] FeatureCollection has no Polygon/MultiPolygon members");
                return None;
            }

            debug!(
                "[Normalize] FeatureCollection: {} of {} features are polygonal",
                members.len(),
                fc.features.len()
            );

            let collection = Value::GeometryCollection(
                members.iter().map(|v| geojson::Geometry::new((*v).clone())).collect(),
            );
            let polygons = members
                .iter()
                .map(|v| value_polygons(v))
                .collect::<Option<Vec<Vec<Polygon<f64>>>>>()
                .map(|nested| nested.into_iter().flatten().collect::<Vec<_>>());

            fold_or_bbox(polygons, &collection, unioner)
        }
    }
}

fn normalize_value<U: PolygonUnion>(value: &Value, unioner: &U) -> Option<Normalized> {
    match value {
        Value::Polygon(rings) => match rings_to_polygon(rings) {
            Some(polygon) => Some(Normalized::Unchanged(polygon)),
            None => {
                warn!("[Normalize] Polygon has malformed rings, using bounding box");
                bbox_fallback(value)
            }
        },
        Value::MultiPolygon(_) => {
            info!("[Normalize] Converting MultiPolygon to Polygon using union");
            fold_or_bbox(value_polygons(value), value, unioner)
        }
        other => {
            warn!("[Normalize] Unsupported geometry type {}, using bounding box", value_kind(other));
            bbox_fallback(other)
        }
    }
}

/// Fold `polygons` with `unioner`, seeded with the first one. Any failure
/// (malformed input, union error) falls back to the bounding box of `original`.
fn fold_or_bbox<U: PolygonUnion>(
    polygons: Option<Vec<Polygon<f64>>>,
    original: &Value,
    unioner: &U,
) -> Option<Normalized> {
    let Some(polygons) = polygons else {
        warn!("[Normalize] Malformed coordinates, using bounding box");
        return bbox_fallback(original);
    };

    let mut iter = polygons.into_iter();
    let Some(seed) = iter.next() else {
        warn!("[Normalize] No member polygons to union");
        return bbox_fallback(original);
    };

    let mut merged = seed;
    for (i, next) in iter.enumerate() {
        match unioner.union(&merged, &next) {
            Ok(polygon) => merged = polygon,
            Err(e) => {
                warn!("[Normalize] Union with member {} failed ({}), using bounding box", i + 1, e);
                return bbox_fallback(original);
            }
        }
    }

    Some(Normalized::Unioned(merged))
}

fn bbox_fallback(value: &Value) -> Option<Normalized> {
    value_bounds(value)
        .and_then(|b| bbox_polygon(&b))
        .map(Normalized::BoundingBox)
}

/// Box polygon, or `None` for a degenerate (zero-width or zero-height) box.
fn bbox_polygon(bounds: &Bounds) -> Option<Polygon<f64>> {
    if bounds.max_lat > bounds.min_lat && bounds.max_lng > bounds.min_lng {
        Some(bounds.to_polygon())
    } else {
        warn!("[Normalize] Bounding box {:?} has no area", bounds.to_array());
        None
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Point(_) => "Point",
        Value::MultiPoint(_) => "MultiPoint",
        Value::LineString(_) => "LineString",
        Value::MultiLineString(_) => "MultiLineString",
        Value::Polygon(_) => "Polygon",
        Value::MultiPolygon(_) => "MultiPolygon",
        Value::GeometryCollection(_) => "GeometryCollection",
    }
}

fn value_polygons(value: &Value) -> Option<Vec<Polygon<f64>>> {
    match value {
        Value::Polygon(rings) => rings_to_polygon(rings).map(|p| vec![p]),
        Value::MultiPolygon(polygons) => polygons.iter().map(|rings| rings_to_polygon(rings)).collect(),
        _ => None,
    }
}

/// Convert GeoJSON rings into a polygon with closed rings.
///
/// `None` when a position is short or non-finite, or the exterior ring has
/// fewer than three distinct positions.
pub(crate) fn rings_to_polygon(rings: &[Vec<Position>]) -> Option<Polygon<f64>> {
    let mut converted = rings
        .iter()
        .map(|ring| {
            let mut coords = ring
                .iter()
                .map(|p| match p.as_slice() {
                    [x, y, ..] if x.is_finite() && y.is_finite() => Some(Coord { x: *x, y: *y }),
                    _ => None,
                })
                .collect::<Option<Vec<_>>>()?;
            close_ring(&mut coords);
            Some(LineString::new(coords))
        })
        .collect::<Option<Vec<_>>>()?
        .into_iter();

    let exterior = converted.next()?;
    if exterior.0.len() < 4 {
        return None;
    }
    Some(Polygon::new(exterior, converted.collect()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::{Area, BoundingRect};
    use geojson::{Feature, FeatureCollection, Geometry};

    fn square(x: f64, y: f64, size: f64) -> Vec<Vec<Position>> {
        vec![vec![
            vec![x, y],
            vec![x + size, y],
            vec![x + size, y + size],
            vec![x, y + size],
            vec![x, y],
        ]]
    }

    fn geometry(value: Value) -> GeoJson {
        GeoJson::Geometry(Geometry::new(value))
    }

    /// Union that always fails, to drive the fallback path.
    struct FailingUnion;

    impl PolygonUnion for FailingUnion {
        fn union(&self, _a: &Polygon<f64>, _b: &Polygon<f64>) -> Result<Polygon<f64>> {
            Err(Error::Union("simulated".to_string()))
        }
    }

    fn bbox_array(polygon: &Polygon<f64>) -> [f64; 4] {
        Bounds::from_rect(&polygon.bounding_rect().unwrap()).to_array()
    }

    #[test]
    fn test_polygon_unchanged() {
        let result = normalize_geometry(&geometry(Value::Polygon(square(0.0, 0.0, 1.0)))).unwrap();
        assert!(matches!(result, Normalized::Unchanged(_)));
        assert_eq!(bbox_array(result.polygon()), [0.0, 0.0, 1.0, 1.0]);
    }

    #[test]
    fn test_polygon_idempotent() {
        let once = normalize_geometry(&geometry(Value::Polygon(square(2.0, 3.0, 0.5))))
            .unwrap()
            .into_polygon();
        let again = normalize_geometry(&GeoJson::Geometry(crate::geo_utils::polygon_to_geojson(&once)))
            .unwrap()
            .into_polygon();
        assert_eq!(once, again);
    }

    #[test]
    fn test_open_ring_is_closed() {
        let open = vec![vec![vec![0.0, 0.0], vec![1.0, 0.0], vec![1.0, 1.0], vec![0.0, 1.0]]];
        let result = normalize_geometry(&geometry(Value::Polygon(open))).unwrap();
        let ring = &result.polygon().exterior().0;
        assert_eq!(ring.first(), ring.last());
    }

    #[test]
    fn test_multipolygon_overlapping_union() {
        let multi = Value::MultiPolygon(vec![square(0.0, 0.0, 2.0), square(1.0, 1.0, 2.0)]);
        let result = normalize_geometry(&geometry(multi)).unwrap();
        assert!(matches!(result, Normalized::Unioned(_)));
        // Two 2x2 squares overlapping on a 1x1 patch
        assert!((result.polygon().unsigned_area() - 7.0).abs() < 1e-9);
    }

    #[test]
    fn test_multipolygon_single_member() {
        let multi = Value::MultiPolygon(vec![square(0.0, 0.0, 1.0)]);
        let result = normalize_geometry(&geometry(multi)).unwrap();
        assert!(matches!(result, Normalized::Unioned(_)));
    }

    #[test]
    fn test_multipolygon_union_failure_uses_bbox() {
        let multi = Value::MultiPolygon(vec![square(0.0, 0.0, 1.0), square(5.0, 5.0, 1.0)]);
        let result = normalize_with(&geometry(multi), &FailingUnion).unwrap();
        assert!(result.is_fallback());
        assert_eq!(bbox_array(result.polygon()), [0.0, 0.0, 6.0, 6.0]);
    }

    #[test]
    fn test_disjoint_squares_fall_back_to_bbox() {
        let multi = Value::MultiPolygon(vec![square(0.0, 0.0, 1.0), square(5.0, 5.0, 1.0)]);
        let result = normalize_geometry(&geometry(multi)).unwrap();
        assert!(result.is_fallback());
        assert_eq!(bbox_array(result.polygon()), [0.0, 0.0, 6.0, 6.0]);
    }

    #[test]
    fn test_malformed_multipolygon_never_panics() {
        let malformed = Value::MultiPolygon(vec![
            vec![vec![vec![0.0, 0.0], vec![1.0], vec![2.0, 2.0]]],
            vec![vec![vec![3.0, 1.0], vec![4.0, 3.0]]],
        ]);
        let result = normalize_geometry(&geometry(malformed)).unwrap();
        assert!(result.is_fallback());
        assert_eq!(bbox_array(result.polygon()), [0.0, 0.0, 4.0, 3.0]);

        assert!(normalize_geometry(&geometry(Value::MultiPolygon(vec![]))).is_none());
    }

    #[test]
    fn test_feature_collection_filters_members() {
        let fc = FeatureCollection {
            bbox: None,
            features: vec![
                Feature::from(Geometry::new(Value::Point(vec![50.0, 50.0]))),
                Feature::from(Geometry::new(Value::Polygon(square(0.0, 0.0, 2.0)))),
                Feature::from(Geometry::new(Value::MultiPolygon(vec![square(1.0, 0.0, 2.0)]))),
            ],
            foreign_members: None,
        };
        let result = normalize_geometry(&GeoJson::FeatureCollection(fc)).unwrap();
        assert!(matches!(result, Normalized::Unioned(_)));
        // The point is ignored, so the extent stays within the squares
        assert_eq!(bbox_array(result.polygon()), [0.0, 0.0, 3.0, 2.0]);
    }

    #[test]
    fn test_feature_collection_without_polygons() {
        let fc = FeatureCollection {
            bbox: None,
            features: vec![Feature::from(Geometry::new(Value::Point(vec![1.0, 1.0])))],
            foreign_members: None,
        };
        assert!(normalize_geometry(&GeoJson::FeatureCollection(fc)).is_none());
    }

    #[test]
    fn test_other_geometry_uses_bbox() {
        let line = Value::LineString(vec![vec![0.0, 0.0], vec![2.0, 1.0]]);
        let result = normalize_geometry(&geometry(line)).unwrap();
        assert!(result.is_fallback());
        assert_eq!(bbox_array(result.polygon()), [0.0, 0.0, 2.0, 1.0]);

        // A point has no area, so there is nothing to send
        assert!(normalize_geometry(&geometry(Value::Point(vec![1.0, 1.0]))).is_none());
    }
}
