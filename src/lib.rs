//! # fAIr Task Insights
//!
//! Building-prediction aggregation and choropleth styling for Tasking Manager
//! projects.
//!
//! This library provides:
//! - Normalization of project boundaries (Polygon, MultiPolygon, FeatureCollection)
//!   into the single Polygon a prediction request needs
//! - Loading of prediction results with an ordered fallback over three artifacts
//!   (precomputed statistics, FlatGeobuf index, GeoJSON points)
//! - Per-task point counting, in-memory or streamed per task bounding box,
//!   with cooperative yields and cancellation
//! - Choropleth colour ramps, legend buckets and summary figures as plain data
//!
//! ## Features
//!
//! - **`http`** (default) - REST clients for the Tasking Manager and fAIr APIs
//!
//! ## Quick Start
//!
//! ```rust
//! use fair_task_insights::{Task, TaskStatus, count_points, summarize};
//! use geo::{point, polygon, MultiPolygon};
//!
//! let square = polygon![
//!     (x: 0.0, y: 0.0), (x: 1.0, y: 0.0), (x: 1.0, y: 1.0), (x: 0.0, y: 1.0), (x: 0.0, y: 0.0)
//! ];
//! let tasks = vec![Task::new(1, TaskStatus::Ready, MultiPolygon::new(vec![square]))];
//! let points = vec![point!(x: 0.5, y: 0.5), point!(x: 5.0, y: 5.0)];
//!
//! let result = count_points(&tasks, &points);
//! assert_eq!(result.total_predictions, 1);
//! assert_eq!(summarize(&result).average_per_active_task, 1);
//! ```

use geo::{BoundingRect, Coord, Intersects, MultiPolygon, Point, Polygon, Rect};
use rstar::{RTreeObject, AABB};
use serde::{Deserialize, Serialize};

pub mod error;
pub use error::{Error, Result};

pub mod config;
pub use config::{AggregationConfig, ClientConfig, Environment};

pub mod geo_utils;

pub mod normalize;
pub use normalize::{normalize_geometry, BooleanUnion, Normalized, PolygonUnion};

pub mod project;
pub use project::{task_status_breakdown, Project, ProjectInfo, ProjectSummary};

pub mod aggregate;
pub use aggregate::{
    aggregate_points, aggregate_streaming, count_points, AggregateResult, BboxPointSource,
    PointIndex,
};

pub mod sources;
pub use sources::{load_predictions, PredictionData, PredictionService, SourceStrategy};

pub mod choropleth;
pub use choropleth::{annotate_tasks, build_legend, build_ramp, Choropleth, LegendEntry, RampStop};

pub mod stats;
pub use stats::{summarize, StatsSummary};

pub mod generation;
pub use generation::{GenerationConfig, GenerationRequest, JobHandle, JobStatus};

pub mod session;
pub use session::{
    AuthService, FileTokenStore, MemoryTokenStore, PredictionState, Session, TokenStore, UserProfile,
};

#[cfg(feature = "http")]
pub mod http;

#[cfg(feature = "http")]
pub use http::{FairClient, FgbPointIndex, TaskingManagerClient};

// ============================================================================
// Core Types
// ============================================================================

/// Tasking Manager task identifier (unique within a project).
pub type TaskId = u64;

/// Workflow state of a task, as reported by the project service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Ready,
    LockedForMapping,
    Mapped,
    LockedForValidation,
    Validated,
    Invalidated,
    #[serde(rename = "BADIMAGERY")]
    BadImagery,
    Split,
    #[serde(other)]
    Unknown,
}

impl TaskStatus {
    /// Wire name, e.g. `LOCKED_FOR_MAPPING`.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Ready => "READY",
            TaskStatus::LockedForMapping => "LOCKED_FOR_MAPPING",
            TaskStatus::Mapped => "MAPPED",
            TaskStatus::LockedForValidation => "LOCKED_FOR_VALIDATION",
            TaskStatus::Validated => "VALIDATED",
            TaskStatus::Invalidated => "INVALIDATED",
            TaskStatus::BadImagery => "BADIMAGERY",
            TaskStatus::Split => "SPLIT",
            TaskStatus::Unknown => "UNKNOWN",
        }
    }

    /// Human label, e.g. `locked for mapping`.
    pub fn label(&self) -> String {
        self.as_str().to_lowercase().replace('_', " ")
    }
}

/// Axis-aligned bounding box in WGS84 degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lng: f64,
    pub max_lng: f64,
}

impl Bounds {
    pub fn from_rect(rect: &Rect<f64>) -> Self {
        Self {
            min_lat: rect.min().y,
            max_lat: rect.max().y,
            min_lng: rect.min().x,
            max_lng: rect.max().x,
        }
    }

    pub fn to_rect(&self) -> Rect<f64> {
        Rect::new(
            Coord { x: self.min_lng, y: self.min_lat },
            Coord { x: self.max_lng, y: self.max_lat },
        )
    }

    /// Closed, counter-clockwise polygon covering the box.
    pub fn to_polygon(&self) -> Polygon<f64> {
        self.to_rect().to_polygon()
    }

    /// Inclusive on every edge.
    pub fn contains(&self, point: &Point<f64>) -> bool {
        point.y() >= self.min_lat
            && point.y() <= self.max_lat
            && point.x() >= self.min_lng
            && point.x() <= self.max_lng
    }

    /// Smallest box covering both.
    pub fn union(&self, other: &Bounds) -> Bounds {
        Bounds {
            min_lat: self.min_lat.min(other.min_lat),
            max_lat: self.max_lat.max(other.max_lat),
            min_lng: self.min_lng.min(other.min_lng),
            max_lng: self.max_lng.max(other.max_lng),
        }
    }

    /// `[min_lng, min_lat, max_lng, max_lat]`, the order map libraries expect.
    pub fn to_array(&self) -> [f64; 4] {
        [self.min_lng, self.min_lat, self.max_lng, self.max_lat]
    }
}

/// One cell of a project's task grid.
///
/// Tasks are read-only source data; aggregation derives counts keyed by
/// [`Task::task_id`] and never touches identifiers or geometry.
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub geometry: MultiPolygon<f64>,
    /// Pre-computed bounding box, `None` when the geometry is empty
    pub bounds: Option<Bounds>,
}

impl Task {
    pub fn new(task_id: TaskId, status: TaskStatus, geometry: MultiPolygon<f64>) -> Self {
        let bounds = geometry.bounding_rect().map(|r| Bounds::from_rect(&r));
        Self { task_id, status, geometry, bounds }
    }

    /// Point-in-polygon test; points on the boundary count as inside.
    pub fn contains(&self, point: &Point<f64>) -> bool {
        match &self.bounds {
            Some(bounds) if bounds.contains(point) => {
                self.geometry.0.iter().any(|polygon| polygon.intersects(point))
            }
            _ => false,
        }
    }
}

/// R-tree entry for a task's bounding box. `order` is the task's position in
/// the project's task list, used to keep first-match semantics.
#[derive(Debug, Clone)]
pub(crate) struct TaskEnvelope {
    pub order: usize,
    pub bounds: Bounds,
}

impl RTreeObject for TaskEnvelope {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_corners(
            [self.bounds.min_lng, self.bounds.min_lat],
            [self.bounds.max_lng, self.bounds.max_lat],
        )
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use geo::{point, polygon};

    fn unit_task(id: TaskId) -> Task {
        let square = polygon![
            (x: 0.0, y: 0.0),
            (x: 1.0, y: 0.0),
            (x: 1.0, y: 1.0),
            (x: 0.0, y: 1.0),
            (x: 0.0, y: 0.0)
        ];
        Task::new(id, TaskStatus::Ready, MultiPolygon::new(vec![square]))
    }

    #[test]
    fn test_task_bounds_precomputed() {
        let task = unit_task(7);
        let bounds = task.bounds.unwrap();
        assert_eq!(bounds.to_array(), [0.0, 0.0, 1.0, 1.0]);
    }

    #[test]
    fn test_task_contains() {
        let task = unit_task(1);
        assert!(task.contains(&point!(x: 0.5, y: 0.5)));
        assert!(task.contains(&point!(x: 1.0, y: 0.5)));
        assert!(!task.contains(&point!(x: 1.5, y: 0.5)));
    }

    #[test]
    fn test_empty_task_contains_nothing() {
        let task = Task::new(1, TaskStatus::Ready, MultiPolygon::new(vec![]));
        assert!(task.bounds.is_none());
        assert!(!task.contains(&point!(x: 0.0, y: 0.0)));
    }

    #[test]
    fn test_task_status_wire_names() {
        let status: TaskStatus = serde_json::from_str("\"LOCKED_FOR_MAPPING\"").unwrap();
        assert_eq!(status, TaskStatus::LockedForMapping);
        let status: TaskStatus = serde_json::from_str("\"BADIMAGERY\"").unwrap();
        assert_eq!(status, TaskStatus::BadImagery);
        let status: TaskStatus = serde_json::from_str("\"SOMETHING_NEW\"").unwrap();
        assert_eq!(status, TaskStatus::Unknown);
        assert_eq!(TaskStatus::LockedForValidation.label(), "locked for validation");
    }

    #[test]
    fn test_bounds_union_and_polygon() {
        let a = Bounds { min_lat: 0.0, max_lat: 1.0, min_lng: 0.0, max_lng: 1.0 };
        let b = Bounds { min_lat: -1.0, max_lat: 0.5, min_lng: 2.0, max_lng: 3.0 };
        let u = a.union(&b);
        assert_eq!(u.to_array(), [0.0, -1.0, 3.0, 1.0]);

        let poly = u.to_polygon();
        let ring = &poly.exterior().0;
        assert_eq!(ring.first(), ring.last());
        assert_eq!(ring.len(), 5);
    }
}
