//! Summary figures for the prediction panel.

use serde::Serialize;

use crate::aggregate::AggregateResult;

/// Display-ready figures derived from an [`AggregateResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSummary {
    pub total_predictions: u64,
    pub tasks_with_predictions: usize,
    pub total_tasks: usize,
    /// Highest count in any single task
    pub peak: u32,
    /// `round(total / active)`, 0 when no task has predictions
    pub average_per_active_task: u64,
}

impl StatsSummary {
    /// Share of tasks with at least one prediction, 0.0 to 100.0.
    pub fn coverage_percent(&self) -> f64 {
        if self.total_tasks == 0 {
            return 0.0;
        }
        self.tasks_with_predictions as f64 / self.total_tasks as f64 * 100.0
    }

    /// One-line status text, e.g. `Total: 10 predictions in 2 tasks`.
    pub fn headline(&self) -> String {
        format!(
            "Total: {} predictions in {} tasks",
            self.total_predictions, self.tasks_with_predictions
        )
    }
}

/// Derive summary figures. Pure; the division is guarded.
pub fn summarize(result: &AggregateResult) -> StatsSummary {
    let average_per_active_task = if result.tasks_with_predictions > 0 {
        (result.total_predictions as f64 / result.tasks_with_predictions as f64).round() as u64
    } else {
        0
    };

    StatsSummary {
        total_predictions: result.total_predictions,
        tasks_with_predictions: result.tasks_with_predictions,
        total_tasks: result.total_tasks,
        peak: result.max_count,
        average_per_active_task,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_three_task_scenario() {
        let result = AggregateResult::from_counts(vec![(1, 4), (2, 6)], 3);
        let summary = summarize(&result);

        assert_eq!(summary.total_predictions, 10);
        assert_eq!(summary.tasks_with_predictions, 2);
        assert_eq!(summary.total_tasks, 3);
        assert_eq!(summary.peak, 6);
        assert_eq!(summary.average_per_active_task, 5);
        assert_eq!(summary.headline(), "Total: 10 predictions in 2 tasks");
    }

    #[test]
    fn test_empty_result() {
        let summary = summarize(&AggregateResult::empty(4));
        assert_eq!(summary.average_per_active_task, 0);
        assert_eq!(summary.peak, 0);
        assert_eq!(summary.coverage_percent(), 0.0);
        assert_eq!(summarize(&AggregateResult::empty(0)).coverage_percent(), 0.0);
    }

    #[test]
    fn test_average_rounds_half_up() {
        // 7 / 2 = 3.5
        let result = AggregateResult::from_counts(vec![(1, 3), (2, 4)], 2);
        assert_eq!(summarize(&result).average_per_active_task, 4);

        // 7 / 3 = 2.33
        let result = AggregateResult::from_counts(vec![(1, 3), (2, 2), (3, 2)], 3);
        assert_eq!(summarize(&result).average_per_active_task, 2);
    }

    #[test]
    fn test_coverage_percent() {
        let result = AggregateResult::from_counts(vec![(1, 1)], 4);
        assert!((summarize(&result).coverage_percent() - 25.0).abs() < 1e-9);
    }
}
