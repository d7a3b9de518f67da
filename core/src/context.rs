//! Run-scoped shared state

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::coordination::{ArtifactHandoffPool, StopCoordinator};
use crate::metrics::MetricsSink;
use crate::rate_limiter::RequestRateLimiter;

/// Everything actors of one run share
///
/// Built once by the run controller and cloned into every actor; clones
/// share the same underlying state.
#[derive(Clone)]
pub struct RunContext {
    /// Run identifier used in logs
    pub run_id: String,
    /// Quota tracking
    pub coordinator: Arc<StopCoordinator>,
    /// Producer to consumer handoff
    pub artifacts: Arc<ArtifactHandoffPool>,
    /// Metrics destination
    pub metrics: Arc<dyn MetricsSink>,
    /// Outbound request cap
    pub rate_limiter: Arc<RequestRateLimiter>,
    stop: CancellationToken,
}

impl RunContext {
    /// Assemble a context; the artifact pool is bound to the run's stop signal
    pub fn new(
        run_id: impl Into<String>,
        default_quota: u32,
        metrics: Arc<dyn MetricsSink>,
        rate_limiter: RequestRateLimiter,
    ) -> Self {
        let stop = CancellationToken::new();
        Self {
            run_id: run_id.into(),
            coordinator: Arc::new(StopCoordinator::new(default_quota)),
            artifacts: Arc::new(ArtifactHandoffPool::new().with_cancellation(stop.clone())),
            metrics,
            rate_limiter: Arc::new(rate_limiter),
            stop,
        }
    }

    /// Token cancelled when the run stops
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Whether the run is stopping
    pub fn is_stopping(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Resolves once the run stops
    pub async fn stopped(&self) {
        self.stop.cancelled().await
    }

    /// Acknowledge the stop and signal every actor
    ///
    /// Only the first call has an effect; it returns `true`.
    pub fn request_stop(&self, reason: &str) -> bool {
        if !self.coordinator.acknowledge_stop() {
            return false;
        }
        tracing::info!(run_id = %self.run_id, reason, "Stopping run");
        self.stop.cancel();
        true
    }
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("run_id", &self.run_id)
            .field("coordinator", &self.coordinator)
            .field("artifacts", &self.artifacts.count())
            .field("stopping", &self.is_stopping())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::NoopMetrics;
    use crate::model::ActorId;

    fn context() -> RunContext {
        RunContext::new("test", 1, Arc::new(NoopMetrics), RequestRateLimiter::unlimited())
    }

    #[test]
    fn test_request_stop_runs_once() {
        let ctx = context();
        assert!(!ctx.is_stopping());

        assert!(ctx.request_stop("quota reached"));
        assert!(ctx.is_stopping());
        assert!(!ctx.request_stop("again"));
    }

    #[test]
    fn test_clones_share_state() {
        let ctx = context();
        let other = ctx.clone();
        ctx.coordinator.setup(1);
        ctx.coordinator
            .record_iteration_complete(&ActorId::from("producer-0"));

        assert!(other.coordinator.should_stop());
        other.request_stop("quota reached");
        assert!(ctx.is_stopping());
        assert!(!ctx.coordinator.should_stop());
    }

    #[tokio::test]
    async fn test_stopped_resolves_after_stop() {
        let ctx = context();
        let waiter = {
            let ctx = ctx.clone();
            tokio::spawn(async move { ctx.stopped().await })
        };
        ctx.request_stop("test");
        waiter.await.unwrap();
    }
}
