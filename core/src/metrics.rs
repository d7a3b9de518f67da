//! Metrics sink and run summary
//!
//! Components report through the [`MetricsSink`] trait so the export backend
//! stays pluggable. [`InMemoryMetrics`] keeps every series in process and is
//! what the binary and the tests use.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{LoadError, LoadResult};
use crate::model::ActorRole;
use crate::pipeline::{IterationRecord, ValidationOutcome};

/// Metric names emitted by the engine
pub mod names {
    /// Counter: every request attempt, labelled method/endpoint/status
    pub const REQUESTS_TOTAL: &str = "requests_total";
    /// Histogram: request attempt latency, labelled method/endpoint
    pub const REQUEST_DURATION: &str = "request_duration_seconds";
    /// Counter: job creations, labelled status
    pub const JOB_CREATIONS: &str = "job_creations_total";
    /// Counter: chunk transfers, labelled status
    pub const CHUNK_UPLOADS: &str = "chunk_uploads_total";
    /// Gauge: chunks currently being transferred
    pub const CHUNKS_IN_PROGRESS: &str = "chunks_in_progress";
    /// Gauge: upload progress per job
    pub const UPLOAD_PROGRESS: &str = "upload_progress_percent";
    /// Histogram: chunk transfer latency including chunk-level retries
    pub const CHUNK_UPLOAD_DURATION: &str = "chunk_upload_duration_seconds";
    /// Histogram: time from processing start to terminal status
    pub const PROCESSING_DURATION: &str = "processing_duration_seconds";
    /// Gauge: rows counted in the produced table
    pub const ROW_COUNT: &str = "db_row_count";
    /// Gauge: 1 when the row count matched, 0 otherwise
    pub const VALIDATION_RESULT: &str = "count_validation_result";
    /// Gauge: rows expected from the input
    pub const EXPECTED_ROWS: &str = "expected_rows";
    /// Counter: finished iterations, labelled role/outcome
    pub const ITERATIONS: &str = "iterations_total";
    /// Gauge: actors currently running
    pub const ACTIVE_ACTORS: &str = "active_actors";
    /// Counter: login attempts, labelled outcome
    pub const AUTH_ATTEMPTS: &str = "auth_attempts_total";
}

/// Label set attached to an observation
pub type Labels<'a> = &'a [(&'static str, String)];

/// Destination for counters, gauges and histograms
pub trait MetricsSink: Send + Sync {
    /// Add one to a counter
    fn increment_counter(&self, name: &'static str, labels: Labels<'_>);

    /// Set a gauge
    fn set_gauge(&self, name: &'static str, labels: Labels<'_>, value: f64);

    /// Move a gauge by `delta`
    fn add_gauge(&self, name: &'static str, labels: Labels<'_>, delta: f64);

    /// Record a duration into a histogram
    fn observe(&self, name: &'static str, labels: Labels<'_>, value: Duration);
}

/// Sink that drops everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn increment_counter(&self, _name: &'static str, _labels: Labels<'_>) {}
    fn set_gauge(&self, _name: &'static str, _labels: Labels<'_>, _value: f64) {}
    fn add_gauge(&self, _name: &'static str, _labels: Labels<'_>, _delta: f64) {}
    fn observe(&self, _name: &'static str, _labels: Labels<'_>, _value: Duration) {}
}

type SeriesKey = (&'static str, Vec<(&'static str, String)>);

fn series_key(name: &'static str, labels: Labels<'_>) -> SeriesKey {
    let mut labels = labels.to_vec();
    labels.sort();
    (name, labels)
}

/// Process-local sink
#[derive(Default)]
pub struct InMemoryMetrics {
    counters: Mutex<HashMap<SeriesKey, u64>>,
    gauges: Mutex<HashMap<SeriesKey, f64>>,
    histograms: Mutex<HashMap<SeriesKey, LatencyHistogram>>,
}

impl InMemoryMetrics {
    /// Create an empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Value of one counter series
    pub fn counter(&self, name: &'static str, labels: Labels<'_>) -> u64 {
        self.counters
            .lock()
            .get(&series_key(name, labels))
            .copied()
            .unwrap_or(0)
    }

    /// Sum of a counter across all label sets
    pub fn counter_total(&self, name: &str) -> u64 {
        self.counters
            .lock()
            .iter()
            .filter(|((n, _), _)| *n == name)
            .map(|(_, v)| *v)
            .sum()
    }

    /// Value of one gauge series
    pub fn gauge(&self, name: &'static str, labels: Labels<'_>) -> Option<f64> {
        self.gauges.lock().get(&series_key(name, labels)).copied()
    }

    /// Number of observations across all label sets of a histogram
    pub fn histogram_count(&self, name: &str) -> u64 {
        self.histograms
            .lock()
            .iter()
            .filter(|((n, _), _)| *n == name)
            .map(|(_, h)| h.len())
            .sum()
    }

    /// Percentiles of one histogram series
    pub fn histogram(&self, name: &'static str, labels: Labels<'_>) -> Option<LatencyPercentiles> {
        self.histograms
            .lock()
            .get(&series_key(name, labels))
            .map(LatencyHistogram::percentiles)
    }
}

impl MetricsSink for InMemoryMetrics {
    fn increment_counter(&self, name: &'static str, labels: Labels<'_>) {
        *self.counters.lock().entry(series_key(name, labels)).or_insert(0) += 1;
    }

    fn set_gauge(&self, name: &'static str, labels: Labels<'_>, value: f64) {
        self.gauges.lock().insert(series_key(name, labels), value);
    }

    fn add_gauge(&self, name: &'static str, labels: Labels<'_>, delta: f64) {
        *self.gauges.lock().entry(series_key(name, labels)).or_insert(0.0) += delta;
    }

    fn observe(&self, name: &'static str, labels: Labels<'_>, value: Duration) {
        let mut histograms = self.histograms.lock();
        let key = series_key(name, labels);
        if let Some(histogram) = histograms.get_mut(&key) {
            histogram.record(value);
            return;
        }
        match LatencyHistogram::try_new() {
            Ok(mut histogram) => {
                histogram.record(value);
                histograms.insert(key, histogram);
            }
            Err(e) => tracing::warn!(metric = name, error = %e, "Histogram unavailable"),
        }
    }
}

impl std::fmt::Debug for InMemoryMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryMetrics")
            .field("counters", &self.counters.lock().len())
            .field("gauges", &self.gauges.lock().len())
            .field("histograms", &self.histograms.lock().len())
            .finish()
    }
}

// ============================================================================
// Percentiles
// ============================================================================

/// Latency percentiles (all values in milliseconds)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq)]
pub struct LatencyPercentiles {
    /// Minimum value
    pub min: f64,
    /// 50th percentile (median)
    pub p50: f64,
    /// 90th percentile
    pub p90: f64,
    /// 95th percentile
    pub p95: f64,
    /// 99th percentile
    pub p99: f64,
    /// Maximum value
    pub max: f64,
    /// Mean value
    pub mean: f64,
}

impl LatencyPercentiles {
    /// Calculate percentiles from a slice of values
    pub fn from_values(values: &[f64]) -> Self {
        if values.is_empty() {
            return Self::default();
        }

        let mut sorted: Vec<f64> = values.to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let len = sorted.len();
        Self {
            min: sorted[0],
            p50: percentile(&sorted, 0.50),
            p90: percentile(&sorted, 0.90),
            p95: percentile(&sorted, 0.95),
            p99: percentile(&sorted, 0.99),
            max: sorted[len - 1],
            mean: sorted.iter().sum::<f64>() / len as f64,
        }
    }
}

/// Percentile of sorted values using linear interpolation
fn percentile(sorted: &[f64], p: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0],
        len => {
            let idx = p * (len - 1) as f64;
            let lower = idx.floor() as usize;
            let upper = (idx.ceil() as usize).min(len - 1);
            let frac = idx - lower as f64;
            sorted[lower] * (1.0 - frac) + sorted[upper] * frac
        }
    }
}

/// HdrHistogram-backed duration histogram, microsecond precision up to one hour
pub struct LatencyHistogram {
    histogram: hdrhistogram::Histogram<u64>,
}

impl LatencyHistogram {
    const MAX_MICROS: u64 = 3_600_000_000;

    /// Create a histogram
    pub fn try_new() -> LoadResult<Self> {
        let histogram = hdrhistogram::Histogram::new_with_bounds(1, Self::MAX_MICROS, 3)
            .map_err(|e| LoadError::orchestration(format!("histogram: {e}")))?;
        Ok(Self { histogram })
    }

    /// Record a duration; values beyond the range are clamped
    pub fn record(&mut self, duration: Duration) {
        let micros = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX).max(1);
        self.histogram.saturating_record(micros);
    }

    /// Number of recorded values
    pub fn len(&self) -> u64 {
        self.histogram.len()
    }

    /// Whether nothing was recorded
    pub fn is_empty(&self) -> bool {
        self.histogram.is_empty()
    }

    /// Percentiles in milliseconds
    pub fn percentiles(&self) -> LatencyPercentiles {
        if self.histogram.is_empty() {
            return LatencyPercentiles::default();
        }

        LatencyPercentiles {
            min: self.histogram.min() as f64 / 1000.0,
            p50: self.histogram.value_at_quantile(0.50) as f64 / 1000.0,
            p90: self.histogram.value_at_quantile(0.90) as f64 / 1000.0,
            p95: self.histogram.value_at_quantile(0.95) as f64 / 1000.0,
            p99: self.histogram.value_at_quantile(0.99) as f64 / 1000.0,
            max: self.histogram.max() as f64 / 1000.0,
            mean: self.histogram.mean() / 1000.0,
        }
    }
}

// ============================================================================
// Run Summary
// ============================================================================

/// Aggregate view of a run built from its iteration records
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunSummary {
    /// Producer iterations recorded
    pub producer_iterations: usize,
    /// Producer iterations that reached DONE
    pub successful: usize,
    /// Producer iterations that aborted
    pub failed: usize,
    /// Successful iterations whose row count did not match
    pub validation_mismatches: usize,
    /// Iterations whose row count query failed
    pub validation_unavailable: usize,
    /// Artifacts published by producers
    pub artifacts_published: usize,
    /// Consumer iterations recorded
    pub consumer_iterations: usize,
    /// Consumer iterations that failed
    pub consumer_failures: usize,
    /// Failed iterations per stage
    pub failures_by_stage: BTreeMap<String, usize>,
    /// Whole-iteration latency of successful producer iterations (ms)
    pub iteration_latency: LatencyPercentiles,
    /// Latency per stage across all iterations (ms)
    pub stage_latency: BTreeMap<String, LatencyPercentiles>,
    /// Wall-clock run duration
    pub total_duration_secs: f64,
    /// Producer iterations per second
    pub iterations_per_second: f64,
}

impl RunSummary {
    /// Summarize `records` collected over `duration`
    pub fn from_records(records: &[IterationRecord], duration: Duration) -> Self {
        let mut summary = Self {
            total_duration_secs: duration.as_secs_f64(),
            ..Default::default()
        };
        let mut iteration_ms = Vec::new();
        let mut stage_ms: BTreeMap<String, Vec<f64>> = BTreeMap::new();

        for record in records {
            for timing in &record.stages {
                stage_ms
                    .entry(timing.stage.as_str().to_string())
                    .or_default()
                    .push(timing.duration_ms);
            }

            if record.role == ActorRole::Consumer {
                summary.consumer_iterations += 1;
                if !record.success {
                    summary.consumer_failures += 1;
                }
                continue;
            }

            summary.producer_iterations += 1;
            if record.success {
                summary.successful += 1;
                iteration_ms.push(record.duration_ms);
            } else {
                summary.failed += 1;
                *summary
                    .failures_by_stage
                    .entry(record.stage_reached.as_str().to_string())
                    .or_default() += 1;
            }
            match &record.validation {
                Some(ValidationOutcome::Mismatch { .. }) => summary.validation_mismatches += 1,
                Some(ValidationOutcome::QueryFailed { .. }) => summary.validation_unavailable += 1,
                _ => {}
            }
            if record.artifact.is_some() {
                summary.artifacts_published += 1;
            }
        }

        summary.iteration_latency = LatencyPercentiles::from_values(&iteration_ms);
        summary.stage_latency = stage_ms
            .into_iter()
            .map(|(stage, values)| (stage, LatencyPercentiles::from_values(&values)))
            .collect();
        if summary.total_duration_secs > 0.0 {
            summary.iterations_per_second =
                summary.producer_iterations as f64 / summary.total_duration_secs;
        }
        summary
    }
}
