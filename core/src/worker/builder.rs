//! Builder pattern for Worker construction

use crate::context::RunContext;
use crate::error::{LoadError, LoadResult};
use crate::pipeline::IterationRecord;

use super::actor::Actor;
use super::executor::Worker;

use std::time::Duration;
use tokio::sync::mpsc;

/// Builder for creating Worker instances
///
/// # Example
/// ```ignore
/// let worker = WorkerBuilder::new()
///     .actor(Box::new(producer))
///     .context(ctx.clone())
///     .records_tx(tx)
///     .think_time(Duration::from_secs(1), Duration::from_secs(5))
///     .build()?;
/// ```
#[derive(Default)]
pub struct WorkerBuilder {
    actor: Option<Box<dyn Actor>>,
    ctx: Option<RunContext>,
    records_tx: Option<mpsc::Sender<IterationRecord>>,
    think_time: Option<(Duration, Duration)>,
}

impl WorkerBuilder {
    /// Create an empty builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the actor to drive
    pub fn actor(mut self, actor: Box<dyn Actor>) -> Self {
        self.actor = Some(actor);
        self
    }

    /// Set the run context
    pub fn context(mut self, ctx: RunContext) -> Self {
        self.ctx = Some(ctx);
        self
    }

    /// Set the record channel sender
    pub fn records_tx(mut self, tx: mpsc::Sender<IterationRecord>) -> Self {
        self.records_tx = Some(tx);
        self
    }

    /// Set the pause bounds between iterations (defaults to none)
    pub fn think_time(mut self, min: Duration, max: Duration) -> Self {
        self.think_time = Some((min, max));
        self
    }

    /// Build the Worker
    ///
    /// # Errors
    /// Returns an error if any required field is missing or the think time
    /// bounds are inverted.
    pub fn build(self) -> LoadResult<Worker> {
        let actor = self.actor.ok_or(LoadError::missing_config("actor"))?;
        let ctx = self.ctx.ok_or(LoadError::missing_config("context"))?;
        let records_tx = self
            .records_tx
            .ok_or(LoadError::missing_config("records_tx"))?;
        let think_time = self.think_time.unwrap_or((Duration::ZERO, Duration::ZERO));
        if think_time.0 > think_time.1 {
            return Err(LoadError::config("think time minimum exceeds maximum"));
        }

        Ok(Worker::new(actor, ctx, records_tx, think_time))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::NoopMetrics;
    use crate::rate_limiter::RequestRateLimiter;
    use std::sync::Arc;

    fn context() -> RunContext {
        RunContext::new("test", 1, Arc::new(NoopMetrics), RequestRateLimiter::unlimited())
    }

    #[test]
    fn test_builder_missing_actor() {
        let (tx, _rx) = mpsc::channel(1);
        let result = WorkerBuilder::new().context(context()).records_tx(tx).build();

        let err = result.unwrap_err();
        assert!(err.message.contains("actor"));
    }

    #[test]
    fn test_builder_missing_context() {
        let (tx, _rx) = mpsc::channel(1);
        let result = WorkerBuilder::new().records_tx(tx).build();

        assert!(result.is_err());
    }

    #[test]
    fn test_builder_missing_records_tx() {
        let result = WorkerBuilder::new().context(context()).build();

        assert!(result.is_err());
    }
}
