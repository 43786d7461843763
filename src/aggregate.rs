//! Per-task prediction counting.
//!
//! Turns a set of prediction points (one per detected building) into an
//! [`AggregateResult`]: how many buildings fall inside each task of the grid.
//!
//! Two execution modes:
//! - **Batch** ([`aggregate_points`], [`count_points`]): every point is tested
//!   against the task grid and credited to the *first* task (in task-list
//!   order) that contains it. An R-tree over task envelopes narrows the
//!   candidates; the lowest task index among containing candidates wins, which
//!   is the same answer as a linear scan.
//! - **Streaming** ([`aggregate_streaming`]): tasks are visited in order, each
//!   one queries a [`BboxPointSource`] for the points in its bounding box and
//!   keeps those actually inside the polygon. A point inside two overlapping
//!   tasks is counted by both; task grids are not expected to overlap.
//!
//! The async variants work in fixed-size chunks, yield to the runtime between
//! chunks, and check a [`CancellationToken`] at every chunk boundary. A
//! cancelled scan returns [`Error::Cancelled`] and no partial result.

use geo::Point;
use log::{debug, info};
use rstar::{RTree, AABB};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::geo_utils::is_valid_point;
use crate::{AggregationConfig, Bounds, Error, Result, Task, TaskEnvelope, TaskId};

/// Per-task prediction counts plus derived totals.
///
/// Only tasks with at least one prediction appear in `task_counts`. The
/// derived fields always agree with `task_counts`:
/// - `total_predictions` is the sum of all counts
/// - `max_count` is the largest count, or 0 when there are none
/// - `tasks_with_predictions` is the number of entries, never above `total_tasks`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateResult {
    /// Required on the wire; a payload without it is not statistics
    pub task_counts: BTreeMap<TaskId, u32>,
    #[serde(default)]
    pub total_predictions: u64,
    #[serde(default)]
    pub max_count: u32,
    #[serde(default)]
    pub tasks_with_predictions: usize,
    #[serde(default)]
    pub total_tasks: usize,
}

impl AggregateResult {
    pub fn empty(total_tasks: usize) -> Self {
        Self { total_tasks, ..Self::default() }
    }

    /// Build from raw counts, dropping zero entries and recomputing every
    /// derived field. `total_tasks` is raised if fewer tasks were claimed than
    /// carry predictions.
    pub fn from_counts(counts: impl IntoIterator<Item = (TaskId, u32)>, total_tasks: usize) -> Self {
        let mut task_counts = BTreeMap::new();
        for (task_id, count) in counts.into_iter().filter(|(_, c)| *c > 0) {
            *task_counts.entry(task_id).or_insert(0u32) += count;
        }

        let total_predictions = task_counts.values().map(|&c| c as u64).sum();
        let max_count = task_counts.values().copied().max().unwrap_or(0);
        let tasks_with_predictions = task_counts.len();

        Self {
            task_counts,
            total_predictions,
            max_count,
            tasks_with_predictions,
            total_tasks: total_tasks.max(tasks_with_predictions),
        }
    }

    /// Count for one task, 0 when absent.
    pub fn count_for(&self, task_id: TaskId) -> u32 {
        self.task_counts.get(&task_id).copied().unwrap_or(0)
    }

    /// True when the derived fields match `task_counts`.
    pub fn is_consistent(&self) -> bool {
        let sum: u64 = self.task_counts.values().map(|&c| c as u64).sum();
        let max = self.task_counts.values().copied().max().unwrap_or(0);
        let active = self.task_counts.values().filter(|&&c| c > 0).count();

        sum == self.total_predictions
            && max == self.max_count
            && active == self.tasks_with_predictions
            && self.tasks_with_predictions <= self.total_tasks
    }

    /// Recompute derived fields from `task_counts` (used on precomputed
    /// statistics that arrive over the wire).
    pub fn normalized(self) -> Self {
        let total_tasks = self.total_tasks;
        Self::from_counts(self.task_counts, total_tasks)
    }
}

// Internal counter during a scan
#[derive(Debug, Default)]
struct CountBuilder {
    counts: HashMap<TaskId, u32>,
    skipped_points: usize,
}

impl CountBuilder {
    fn add(&mut self, task_id: TaskId, n: u32) {
        *self.counts.entry(task_id).or_insert(0) += n;
    }

    fn build(self, total_tasks: usize) -> AggregateResult {
        AggregateResult::from_counts(self.counts, total_tasks)
    }
}

/// R-tree over task envelopes, answering "first task containing this point".
struct TaskIndex<'a> {
    tasks: &'a [Task],
    tree: RTree<TaskEnvelope>,
}

impl<'a> TaskIndex<'a> {
    fn new(tasks: &'a [Task]) -> Self {
        let envelopes: Vec<TaskEnvelope> = tasks
            .iter()
            .enumerate()
            .filter_map(|(order, task)| task.bounds.map(|bounds| TaskEnvelope { order, bounds }))
            .collect();

        Self { tasks, tree: RTree::bulk_load(envelopes) }
    }

    fn first_containing(&self, point: &Point<f64>) -> Option<&'a Task> {
        let tasks = self.tasks;
        self.tree
            .locate_in_envelope_intersecting(&AABB::from_point([point.x(), point.y()]))
            .filter(|env| tasks[env.order].contains(point))
            .map(|env| env.order)
            .min()
            .map(|order| &tasks[order])
    }
}

/// Batch-count points per task without yielding.
///
/// Suitable for small inputs or callers that are not on a UI loop. Invalid
/// (non-finite or out-of-range) points are skipped.
pub fn count_points(tasks: &[Task], points: &[Point<f64>]) -> AggregateResult {
    let index = TaskIndex::new(tasks);
    let mut builder = CountBuilder::default();

    for point in points {
        credit_point(&index, &mut builder, point);
    }

    if builder.skipped_points > 0 {
        debug!("[Aggregator] Skipped {} invalid points", builder.skipped_points);
    }
    builder.build(tasks.len())
}

fn credit_point(index: &TaskIndex<'_>, builder: &mut CountBuilder, point: &Point<f64>) {
    if !is_valid_point(point) {
        builder.skipped_points += 1;
        return;
    }
    if let Some(task) = index.first_containing(point) {
        builder.add(task.task_id, 1);
    }
}

/// Batch mode over an in-memory point sequence, yielding every
/// `config.point_chunk_size` points.
pub async fn aggregate_points<I>(
    tasks: &[Task],
    points: I,
    config: &AggregationConfig,
    cancel: &CancellationToken,
) -> Result<AggregateResult>
where
    I: IntoIterator<Item = Point<f64>>,
{
    let start = Instant::now();
    let chunk = config.point_chunk_size.max(1);
    let index = TaskIndex::new(tasks);
    let mut builder = CountBuilder::default();
    let mut processed = 0usize;

    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }

    for point in points {
        credit_point(&index, &mut builder, &point);
        processed += 1;

        if processed % chunk == 0 {
            if cancel.is_cancelled() {
                info!("[Aggregator] Batch scan cancelled after {} points", processed);
                return Err(Error::Cancelled);
            }
            tokio::task::yield_now().await;
        }
    }

    if builder.skipped_points > 0 {
        debug!("[Aggregator] Skipped {} invalid points", builder.skipped_points);
    }

    let result = builder.build(tasks.len());
    info!(
        "[Aggregator] Batch: {} points over {} tasks -> {} predictions in {} tasks ({:?})",
        processed,
        tasks.len(),
        result.total_predictions,
        result.tasks_with_predictions,
        start.elapsed()
    );
    Ok(result)
}

/// A point store that can be queried by bounding box.
///
/// Results may include points outside the box's polygon (the box is a
/// superset filter); the aggregator confirms containment itself.
#[allow(async_fn_in_trait)]
pub trait BboxPointSource {
    async fn query_bbox(&mut self, bounds: &Bounds) -> Result<Vec<Point<f64>>>;
}

/// In-memory [`BboxPointSource`] over an R-tree of points.
#[derive(Debug, Default)]
pub struct PointIndex {
    tree: RTree<[f64; 2]>,
}

impl PointIndex {
    pub fn from_points(points: &[Point<f64>]) -> Self {
        let coords = points
            .iter()
            .filter(|p| is_valid_point(p))
            .map(|p| [p.x(), p.y()])
            .collect();
        Self { tree: RTree::bulk_load(coords) }
    }

    pub fn len(&self) -> usize {
        self.tree.size()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.size() == 0
    }
}

impl BboxPointSource for PointIndex {
    async fn query_bbox(&mut self, bounds: &Bounds) -> Result<Vec<Point<f64>>> {
        let envelope = AABB::from_corners(
            [bounds.min_lng, bounds.min_lat],
            [bounds.max_lng, bounds.max_lat],
        );
        Ok(self
            .tree
            .locate_in_envelope(&envelope)
            .map(|c| Point::new(c[0], c[1]))
            .collect())
    }
}

/// Streaming mode: one bounding-box query per task, yielding every
/// `config.task_chunk_size` tasks.
///
/// A failed query aborts the scan with that error.
pub async fn aggregate_streaming<S: BboxPointSource>(
    tasks: &[Task],
    source: &mut S,
    config: &AggregationConfig,
    cancel: &CancellationToken,
) -> Result<AggregateResult> {
    let start = Instant::now();
    let chunk = config.task_chunk_size.max(1);
    let mut builder = CountBuilder::default();
    let mut candidates_seen = 0usize;

    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }

    for (i, task) in tasks.iter().enumerate() {
        match &task.bounds {
            Some(bounds) => {
                let candidates = source.query_bbox(bounds).await?;
                candidates_seen += candidates.len();

                let inside = candidates
                    .iter()
                    .filter(|p| {
                        if is_valid_point(p) {
                            true
                        } else {
                            builder.skipped_points += 1;
                            false
                        }
                    })
                    .filter(|p| task.contains(p))
                    .count() as u32;

                if inside > 0 {
                    builder.add(task.task_id, inside);
                }
            }
            None => debug!("[Aggregator] Task {} has no geometry, skipping", task.task_id),
        }

        if (i + 1) % chunk == 0 {
            if cancel.is_cancelled() {
                info!("[Aggregator] Streaming scan cancelled after {} tasks", i + 1);
                return Err(Error::Cancelled);
            }
            tokio::task::yield_now().await;
        }
    }

    if builder.skipped_points > 0 {
        debug!("[Aggregator] Skipped {} invalid points", builder.skipped_points);
    }

    let result = builder.build(tasks.len());
    info!(
        "[Aggregator] Streaming: {} tasks, {} bbox candidates -> {} predictions in {} tasks ({:?})",
        tasks.len(),
        candidates_seen,
        result.total_predictions,
        result.tasks_with_predictions,
        start.elapsed()
    );
    Ok(result)
}
