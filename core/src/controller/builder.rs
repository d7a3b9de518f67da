//! Builder pattern for RunController construction

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::chunk::ChunkSource;
use crate::config::LoadConfig;
use crate::context::RunContext;
use crate::error::{LoadError, LoadResult};
use crate::metrics::{MetricsSink, NoopMetrics};
use crate::pipeline::IterationRecord;
use crate::rate_limiter::RequestRateLimiter;
use crate::traits::FlowServiceFactory;

use super::executor::RunController;

/// Default capacity of the record channel (workers -> collector)
const DEFAULT_RECORDS_BUFFER: usize = 10_000;

/// Builder for creating a RunController with proper configuration
///
/// # Example
///
/// ```ignore
/// let (controller, records_rx) = RunControllerBuilder::new()
///     .config(config)
///     .factory(Arc::new(HttpServiceFactory::new(api)?))
///     .source(Arc::new(LineChunkSource::from_path(path, chunk_size)?))
///     .metrics(metrics.clone())
///     .build()?;
/// ```
pub struct RunControllerBuilder {
    config: LoadConfig,
    factory: Option<Arc<dyn FlowServiceFactory>>,
    source: Option<Arc<dyn ChunkSource>>,
    metrics: Option<Arc<dyn MetricsSink>>,
    run_id: Option<String>,
    records_buffer: usize,
}

impl RunControllerBuilder {
    /// Create a new builder with default configuration
    pub fn new() -> Self {
        Self {
            config: LoadConfig::default(),
            factory: None,
            source: None,
            metrics: None,
            run_id: None,
            records_buffer: DEFAULT_RECORDS_BUFFER,
        }
    }

    /// Set the full load configuration
    pub fn config(mut self, config: LoadConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the factory that opens one service session per actor
    pub fn factory(mut self, factory: Arc<dyn FlowServiceFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Set the input every producer uploads
    pub fn source(mut self, source: Arc<dyn ChunkSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Set the metrics sink (defaults to discarding everything)
    pub fn metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Override the generated run id
    pub fn run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    /// Set the record channel capacity
    pub fn records_buffer(mut self, size: usize) -> Self {
        self.records_buffer = size.max(1);
        self
    }

    /// Build the controller and return it along with the record receiver
    ///
    /// The receiver closes once the controller finished its run and was
    /// dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the factory or source are not set, or if
    /// configuration validation fails.
    pub fn build(self) -> LoadResult<(RunController, mpsc::Receiver<IterationRecord>)> {
        let factory = self
            .factory
            .ok_or_else(|| LoadError::missing_config("factory"))?;

        let source = self
            .source
            .ok_or_else(|| LoadError::missing_config("source"))?;

        self.config
            .validate()
            .map_err(|e| LoadError::config(e.to_string()))?;

        let run_id = self
            .run_id
            .unwrap_or_else(|| format!("run-{}", chrono::Utc::now().format("%Y%m%dT%H%M%S")));
        let metrics = self.metrics.unwrap_or_else(|| Arc::new(NoopMetrics));
        let ctx = RunContext::new(
            run_id,
            self.config.run.iterations_per_actor,
            metrics,
            RequestRateLimiter::new(self.config.run.requests_per_second),
        );

        let (records_tx, records_rx) = mpsc::channel(self.records_buffer);
        let controller = RunController::new(self.config, factory, source, ctx, records_tx);

        Ok((controller, records_rx))
    }
}

impl Default for RunControllerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
