//! Prediction loading with ordered fallback.
//!
//! A finished prediction job leaves up to three artifacts in the project's
//! workspace folder. [`load_predictions`] tries them in order and stops at the
//! first one that works:
//!
//! 1. [`SourceStrategy::Statistics`]: per-task counts computed server-side;
//!    no aggregation needed
//! 2. [`SourceStrategy::StreamedIndex`]: a FlatGeobuf file queried once per
//!    task bounding box (streaming aggregation, the full point set is never
//!    held in memory)
//! 3. [`SourceStrategy::PointCollection`]: the whole GeoJSON point file
//!    (batch aggregation)
//!
//! When every strategy fails the result is [`PredictionData::Unavailable`],
//! which callers show as "no predictions yet", not as an error. Cancellation
//! is the one failure that is not absorbed: it ends the chain immediately.

use geo::Point;
use geojson::{GeoJson, Value};
use log::{debug, info, warn};
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::aggregate::{aggregate_points, aggregate_streaming, AggregateResult, BboxPointSource};
use crate::{AggregationConfig, Error, Result, Task};

/// One way of obtaining prediction counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceStrategy {
    Statistics,
    StreamedIndex,
    PointCollection,
}

impl SourceStrategy {
    /// Cheapest first.
    pub const DEFAULT_ORDER: [SourceStrategy; 3] = [
        SourceStrategy::Statistics,
        SourceStrategy::StreamedIndex,
        SourceStrategy::PointCollection,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            SourceStrategy::Statistics => "statistics",
            SourceStrategy::StreamedIndex => "flatgeobuf",
            SourceStrategy::PointCollection => "geojson",
        }
    }
}

/// Outcome of [`load_predictions`].
#[derive(Debug, Clone, PartialEq)]
pub enum PredictionData {
    Ready {
        result: AggregateResult,
        source: SourceStrategy,
    },
    Unavailable,
}

impl PredictionData {
    pub fn result(&self) -> Option<&AggregateResult> {
        match self {
            PredictionData::Ready { result, .. } => Some(result),
            PredictionData::Unavailable => None,
        }
    }
}

/// Read access to a project's prediction artifacts.
#[allow(async_fn_in_trait)]
pub trait PredictionService {
    type Index: BboxPointSource;

    /// Precomputed per-task statistics.
    async fn task_statistics(&self, project_id: u64) -> Result<AggregateResult>;

    /// Bounding-box-queryable point index.
    async fn open_point_index(&self, project_id: u64) -> Result<Self::Index>;

    /// Every prediction point at once.
    async fn point_collection(&self, project_id: u64) -> Result<Vec<Point<f64>>>;
}

/// Try each strategy in order; the first success wins.
pub async fn load_predictions<S: PredictionService>(
    service: &S,
    project_id: u64,
    tasks: &[Task],
    strategies: &[SourceStrategy],
    config: &AggregationConfig,
    cancel: &CancellationToken,
) -> Result<PredictionData> {
    for &strategy in strategies {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let start = Instant::now();
        match run_strategy(service, strategy, project_id, tasks, config, cancel).await {
            Ok(result) => {
                info!(
                    "[SourceLoader] Project {}: {} predictions from {} in {:?}",
                    project_id,
                    result.total_predictions,
                    strategy.name(),
                    start.elapsed()
                );
                return Ok(PredictionData::Ready { result, source: strategy });
            }
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(e) => {
                warn!(
                    "[SourceLoader] Project {}: {} unavailable ({}), trying next",
                    project_id,
                    strategy.name(),
                    e
                );
            }
        }
    }

    info!("[SourceLoader] Project {}: no predictions available", project_id);
    Ok(PredictionData::Unavailable)
}

async fn run_strategy<S: PredictionService>(
    service: &S,
    strategy: SourceStrategy,
    project_id: u64,
    tasks: &[Task],
    config: &AggregationConfig,
    cancel: &CancellationToken,
) -> Result<AggregateResult> {
    match strategy {
        SourceStrategy::Statistics => {
            let stats = service.task_statistics(project_id).await?;
            if !stats.is_consistent() {
                debug!("[SourceLoader] Statistics totals disagree with taskCounts, recomputing");
            }
            let total_tasks = if stats.total_tasks == 0 { tasks.len() } else { stats.total_tasks };
            Ok(AggregateResult::from_counts(stats.task_counts, total_tasks))
        }
        SourceStrategy::StreamedIndex => {
            let mut index = service.open_point_index(project_id).await?;
            aggregate_streaming(tasks, &mut index, config, cancel).await
        }
        SourceStrategy::PointCollection => {
            let points = service.point_collection(project_id).await?;
            aggregate_points(tasks, points, config, cancel).await
        }
    }
}

/// Extract prediction points from a GeoJSON document.
///
/// Point and MultiPoint geometries are taken as-is; anything else is skipped.
pub fn points_from_geojson(geojson: &GeoJson) -> Vec<Point<f64>> {
    let mut points = Vec::new();
    let mut skipped = 0usize;

    let mut push_value = |value: &Value| match value {
        Value::Point(p) if p.len() >= 2 => points.push(Point::new(p[0], p[1])),
        Value::MultiPoint(ps) => points.extend(
            ps.iter().filter(|p| p.len() >= 2).map(|p| Point::new(p[0], p[1])),
        ),
        _ => skipped += 1,
    };

    match geojson {
        GeoJson::Geometry(g) => push_value(&g.value),
        GeoJson::Feature(f) => {
            if let Some(g) = &f.geometry {
                push_value(&g.value);
            }
        }
        GeoJson::FeatureCollection(fc) => {
            for g in fc.features.iter().filter_map(|f| f.geometry.as_ref()) {
                push_value(&g.value);
            }
        }
    }

    if skipped > 0 {
        debug!("[SourceLoader] Skipped {} non-point geometries", skipped);
    }
    points
}
