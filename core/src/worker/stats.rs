//! Worker statistics tracking

use std::time::{Duration, Instant};

use crate::pipeline::{IterationRecord, ValidationOutcome};

/// Statistics tracked by each worker
#[derive(Debug, Default, Clone)]
pub struct WorkerStats {
    /// Iterations that reached DONE
    pub completed: usize,

    /// Iterations that aborted at some stage
    pub failed: usize,

    /// Successful iterations whose row count did not match
    pub validation_mismatches: usize,

    /// Iterations finished after the run stopped and thrown away
    pub discarded: usize,

    /// Workers removed from the run (authentication or startup failure)
    pub retired: usize,

    /// Worker start time
    pub started_at: Option<Instant>,

    /// Worker end time
    pub ended_at: Option<Instant>,
}

impl WorkerStats {
    /// Create new empty stats
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking (records start time)
    pub fn start(&mut self) {
        self.started_at = Some(Instant::now());
    }

    /// Stop tracking (records end time)
    pub fn stop(&mut self) {
        self.ended_at = Some(Instant::now());
    }

    /// Count one recorded iteration
    pub fn record(&mut self, record: &IterationRecord) {
        if record.success {
            self.completed += 1;
        } else {
            self.failed += 1;
        }
        if matches!(record.validation, Some(ValidationOutcome::Mismatch { .. })) {
            self.validation_mismatches += 1;
        }
    }

    /// Completed plus failed
    pub fn total_iterations(&self) -> usize {
        self.completed + self.failed
    }

    /// Share of iterations that succeeded (0.0 - 1.0)
    pub fn success_rate(&self) -> f64 {
        if self.total_iterations() == 0 {
            0.0
        } else {
            self.completed as f64 / self.total_iterations() as f64
        }
    }

    /// Time between start and stop, or since start while running
    pub fn elapsed(&self) -> Option<Duration> {
        self.started_at.map(|start| {
            self.ended_at
                .map(|end| end.duration_since(start))
                .unwrap_or_else(|| start.elapsed())
        })
    }

    /// Recorded iterations per second
    pub fn iterations_per_second(&self) -> f64 {
        self.elapsed()
            .map(|d| {
                let secs = d.as_secs_f64();
                if secs > 0.0 {
                    self.total_iterations() as f64 / secs
                } else {
                    0.0
                }
            })
            .unwrap_or(0.0)
    }

    /// Fold another worker's stats into these
    ///
    /// Keeps the earliest start and the latest end.
    pub fn merge(&mut self, other: &WorkerStats) {
        self.completed += other.completed;
        self.failed += other.failed;
        self.validation_mismatches += other.validation_mismatches;
        self.discarded += other.discarded;
        self.retired += other.retired;

        self.started_at = match (self.started_at, other.started_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.ended_at = match (self.ended_at, other.ended_at) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
    }
}
