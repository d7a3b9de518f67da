//! Result aggregation from multiple workers

use std::time::Duration;

use serde::Serialize;

use crate::worker::WorkerStats;

/// Aggregated statistics from all workers
#[derive(Debug, Clone, Default, Serialize)]
pub struct AggregatedStats {
    /// Number of workers that finished
    pub total_workers: usize,

    /// Iterations that reached DONE
    pub completed: usize,

    /// Iterations that aborted at some stage
    pub failed: usize,

    /// Successful iterations whose row count did not match
    pub validation_mismatches: usize,

    /// Results thrown away because the run had stopped
    pub discarded: usize,

    /// Actors removed from the run
    pub retired: usize,

    /// Longest worker lifetime
    pub total_duration: Duration,

    /// Overall iterations per second
    pub iterations_per_second: f64,
}

impl AggregatedStats {
    /// Completed plus failed
    pub fn total_iterations(&self) -> usize {
        self.completed + self.failed
    }

    /// Get the success rate (0.0 - 1.0)
    pub fn success_rate(&self) -> f64 {
        let total = self.total_iterations();
        if total > 0 {
            self.completed as f64 / total as f64
        } else {
            0.0
        }
    }
}

/// Aggregate statistics from multiple workers
pub fn aggregate_worker_stats(stats: &[WorkerStats]) -> AggregatedStats {
    if stats.is_empty() {
        return AggregatedStats::default();
    }

    let mut total = WorkerStats::new();
    for worker in stats {
        total.merge(worker);
    }

    // Use the maximum elapsed time across all workers
    let total_duration = stats
        .iter()
        .filter_map(|s| s.elapsed())
        .max()
        .unwrap_or(Duration::ZERO);

    let secs = total_duration.as_secs_f64();
    let iterations_per_second = if secs > 0.0 {
        total.total_iterations() as f64 / secs
    } else {
        0.0
    };

    AggregatedStats {
        total_workers: stats.len(),
        completed: total.completed,
        failed: total.failed,
        validation_mismatches: total.validation_mismatches,
        discarded: total.discarded,
        retired: total.retired,
        total_duration,
        iterations_per_second,
    }
}
