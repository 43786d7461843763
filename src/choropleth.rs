//! Choropleth styling as plain data.
//!
//! Counts from an [`AggregateResult`] are turned into:
//! - a colour ramp, one breakpoint per integer count from 0 to `max_count`
//! - a coarser legend of at most five buckets
//! - MapLibre paint expressions and a task FeatureCollection annotated with
//!   `predictionCount`, for whatever map widget binds them
//!
//! Nothing here touches a renderer.

use geojson::FeatureCollection;
use serde::Serialize;
use serde_json::{json, Value as JsonValue};

use crate::aggregate::AggregateResult;
use crate::project::feature_task_id;
use crate::TaskStatus;

/// Ramp palette, lightest first.
pub const RAMP_PALETTE: [&str; 8] = [
    "#f3f4f6", "#fef3c7", "#fde68a", "#fbbf24", "#f59e0b", "#d97706", "#b45309", "#78350f",
];

/// Legend palette, lightest first.
pub const LEGEND_PALETTE: [&str; 5] = ["#f3f4f6", "#fef3c7", "#fbbf24", "#f59e0b", "#d97706"];

const MAX_LEGEND_STEPS: u32 = 5;

/// One ramp breakpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RampStop {
    pub value: u32,
    pub palette_index: usize,
    pub color: &'static str,
}

/// One legend swatch covering `from..=to` predictions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LegendEntry {
    pub from: u32,
    pub to: u32,
    pub color: &'static str,
}

impl LegendEntry {
    pub fn label(&self) -> String {
        if self.from == self.to {
            self.from.to_string()
        } else {
            format!("{}-{}", self.from, self.to)
        }
    }
}

/// Colour ramp from 0 to `max_count`.
///
/// Step `s` takes palette entry `floor(s / max_count * 7)`. A zero maximum
/// collapses to a single stop at the lightest colour.
///
/// # Example
///
/// ```rust
/// use fair_task_insights::build_ramp;
///
/// let ramp = build_ramp(4);
/// assert_eq!(ramp.len(), 5);
/// assert_eq!(ramp[0].palette_index, 0);
/// assert_eq!(ramp[4].palette_index, 7);
/// ```
pub fn build_ramp(max_count: u32) -> Vec<RampStop> {
    if max_count == 0 {
        return vec![RampStop { value: 0, palette_index: 0, color: RAMP_PALETTE[0] }];
    }

    let last = RAMP_PALETTE.len() - 1;
    (0..=max_count)
        .map(|step| {
            let ratio = step as f64 / max_count as f64;
            let palette_index = ((ratio * last as f64).floor() as usize).min(last);
            RampStop { value: step, palette_index, color: RAMP_PALETTE[palette_index] }
        })
        .collect()
}

/// Legend buckets for `max_count`; empty when there is nothing to show.
///
/// Uses `min(5, max_count)` steps of `ceil(max_count / steps)` each. The last
/// bucket is clipped at `max_count`, and buckets starting at or past it are
/// dropped.
pub fn build_legend(max_count: u32) -> Vec<LegendEntry> {
    if max_count == 0 {
        return Vec::new();
    }

    let steps = max_count.min(MAX_LEGEND_STEPS);
    let step_size = max_count.div_ceil(steps);

    let mut entries = Vec::with_capacity(steps as usize);
    for i in 0..steps {
        let from = i * step_size;
        if from >= max_count {
            break;
        }
        let to = ((i + 1) * step_size).min(max_count);
        entries.push(LegendEntry { from, to, color: LEGEND_PALETTE[i as usize] });
    }
    entries
}

/// Ramp plus legend for one aggregate result.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Choropleth {
    pub max_count: u32,
    pub ramp: Vec<RampStop>,
    pub legend: Vec<LegendEntry>,
}

impl Choropleth {
    pub fn new(max_count: u32) -> Self {
        Self { max_count, ramp: build_ramp(max_count), legend: build_legend(max_count) }
    }

    pub fn from_result(result: &AggregateResult) -> Self {
        Self::new(result.max_count)
    }

    /// Ramp colour for a task count. Counts above the maximum take the darkest stop.
    pub fn color_for(&self, count: u32) -> &'static str {
        let idx = (count as usize).min(self.ramp.len().saturating_sub(1));
        self.ramp.get(idx).map(|s| s.color).unwrap_or(RAMP_PALETTE[0])
    }

    /// MapLibre `fill-color` expression over the `predictionCount` property.
    ///
    /// A single-stop ramp is a literal colour: `interpolate` needs two stops.
    pub fn paint_expression(&self) -> JsonValue {
        if self.ramp.len() < 2 {
            return json!(self.color_for(0));
        }

        let mut expr = vec![json!("interpolate"), json!(["linear"]), json!(["get", "predictionCount"])];
        for stop in &self.ramp {
            expr.push(json!(stop.value));
            expr.push(json!(stop.color));
        }
        JsonValue::Array(expr)
    }
}

// =============================================================================
// Task status styling
// =============================================================================

/// Fill colour for a task status in the status view.
pub fn status_color(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Validated => "#10b981",
        TaskStatus::Mapped => "#3b82f6",
        TaskStatus::Ready => "#f3f4f6",
        TaskStatus::Invalidated => "#ef4444",
        _ => "#9ca3af",
    }
}

/// MapLibre `match` expression on `taskStatus`.
pub fn status_match_expression() -> JsonValue {
    let mut expr = vec![json!("match"), json!(["get", "taskStatus"])];
    for status in [
        TaskStatus::Validated,
        TaskStatus::Mapped,
        TaskStatus::Ready,
        TaskStatus::Invalidated,
    ] {
        expr.push(json!(status.as_str()));
        expr.push(json!(status_color(status)));
    }
    expr.push(json!(status_color(TaskStatus::Unknown)));
    JsonValue::Array(expr)
}

// =============================================================================
// Export
// =============================================================================

/// Copy of the task collection with `predictionCount` set on every feature.
///
/// Tasks absent from the result get 0. Identifiers and geometry are untouched.
pub fn annotate_tasks(tasks: &FeatureCollection, result: &AggregateResult) -> FeatureCollection {
    let mut annotated = tasks.clone();
    for feature in &mut annotated.features {
        let count = feature_task_id(feature).map(|id| result.count_for(id)).unwrap_or(0);
        feature.set_property("predictionCount", count);
    }
    annotated
}

#[cfg(test)]
mod tests {
    use super::*;
    use geojson::Feature;

    #[test]
    fn test_ramp_zero_max() {
        let ramp = build_ramp(0);
        assert_eq!(ramp, vec![RampStop { value: 0, palette_index: 0, color: "#f3f4f6" }]);
    }

    #[test]
    fn test_ramp_is_monotonic() {
        for max in [1, 2, 3, 6, 7, 8, 13, 100, 257] {
            let ramp = build_ramp(max);
            assert_eq!(ramp.len(), max as usize + 1);
            assert_eq!(ramp[0].palette_index, 0);
            assert_eq!(ramp.last().unwrap().palette_index, RAMP_PALETTE.len() - 1);
            for pair in ramp.windows(2) {
                assert!(pair[0].palette_index <= pair[1].palette_index, "max {}", max);
                assert_eq!(pair[0].value + 1, pair[1].value);
            }
        }
    }

    #[test]
    fn test_ramp_six() {
        // floor(s/6 * 7) for s = 0..=6
        let indices: Vec<usize> = build_ramp(6).iter().map(|s| s.palette_index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4, 5, 7]);
    }

    #[test]
    fn test_legend_zero_max_is_empty() {
        assert!(build_legend(0).is_empty());
    }

    #[test]
    fn test_legend_small_max() {
        let legend = build_legend(3);
        let ranges: Vec<(u32, u32)> = legend.iter().map(|e| (e.from, e.to)).collect();
        assert_eq!(ranges, vec![(0, 1), (1, 2), (2, 3)]);
    }

    #[test]
    fn test_legend_large_max() {
        let legend = build_legend(12);
        // step size ceil(12 / 5) = 3
        let ranges: Vec<(u32, u32)> = legend.iter().map(|e| (e.from, e.to)).collect();
        assert_eq!(ranges, vec![(0, 3), (3, 6), (6, 9), (9, 12)]);
        assert_eq!(legend[0].label(), "0-3");
        assert_eq!(legend[0].color, LEGEND_PALETTE[0]);
    }

    #[test]
    fn test_legend_drops_empty_tail() {
        // step size ceil(6 / 5) = 2, buckets from 0, 2, 4; 6 is past the end
        let legend = build_legend(6);
        assert_eq!(legend.len(), 3);
        assert_eq!(legend.last().unwrap().to, 6);
    }

    #[test]
    fn test_paint_expression() {
        assert_eq!(Choropleth::new(0).paint_expression(), json!("#f3f4f6"));

        let expr = Choropleth::new(1).paint_expression();
        assert_eq!(
            expr,
            json!(["interpolate", ["linear"], ["get", "predictionCount"], 0, "#f3f4f6", 1, "#78350f"])
        );
    }

    #[test]
    fn test_color_for_clamps() {
        let choropleth = Choropleth::new(2);
        assert_eq!(choropleth.color_for(0), "#f3f4f6");
        assert_eq!(choropleth.color_for(50), "#78350f");
        assert_eq!(Choropleth::new(0).color_for(3), "#f3f4f6");
    }

    #[test]
    fn test_status_expression() {
        let expr = status_match_expression();
        assert_eq!(expr[0], "match");
        assert_eq!(expr[2], "VALIDATED");
        assert_eq!(expr[3], "#10b981");
        assert_eq!(expr.as_array().unwrap().last().unwrap(), "#9ca3af");
        assert_eq!(status_color(TaskStatus::Split), "#9ca3af");
    }

    #[test]
    fn test_annotate_tasks() {
        let feature = |id: Option<u64>| {
            let mut f = Feature {
                bbox: None,
                geometry: None,
                id: None,
                properties: None,
                foreign_members: None,
            };
            if let Some(id) = id {
                f.set_property("taskId", id);
            }
            f
        };
        let tasks = FeatureCollection {
            bbox: None,
            features: vec![feature(Some(1)), feature(Some(2)), feature(None)],
            foreign_members: None,
        };
        let result = AggregateResult::from_counts(vec![(2, 5)], 2);

        let annotated = annotate_tasks(&tasks, &result);
        let counts: Vec<_> = annotated
            .features
            .iter()
            .map(|f| f.property("predictionCount").and_then(|v| v.as_u64()))
            .collect();
        assert_eq!(counts, vec![Some(0), Some(5), Some(0)]);
        assert_eq!(annotated.features[1].property("taskId"), Some(&json!(2)));
        assert!(tasks.features[0].property("predictionCount").is_none());
    }
}
