//! Actor lifecycle hooks and the two actor kinds

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::context::RunContext;
use crate::credentials::Credentials;
use crate::error::{ErrorKind, LoadError, LoadResult};
use crate::executor::{RequestExecutor, RequestSpec};
use crate::metrics::names;
use crate::model::{ActorId, ActorRole};
use crate::pipeline::{IterationRecord, JobOrchestrator, Stage, StageFailure, StageTiming};
use crate::traits::FlowService;

/// A simulated client driven by a [`Worker`](super::Worker)
#[async_trait]
pub trait Actor: Send + Sync {
    /// Actor id
    fn id(&self) -> &ActorId;

    /// Actor class
    fn role(&self) -> ActorRole;

    /// Prepare the session; an error removes the actor from the run
    async fn on_start(&self) -> LoadResult<()>;

    /// Run one iteration; never fails, faults are inside the record
    async fn run_iteration(&self, iteration: u32) -> IterationRecord;

    /// Called once when the actor leaves the run
    async fn on_stop(&self) {}
}

/// Log in through the executor and count the attempt
async fn authenticate(
    actor: &ActorId,
    service: &Arc<dyn FlowService>,
    executor: &RequestExecutor,
    credentials: &Credentials,
    ctx: &RunContext,
) -> LoadResult<()> {
    let result = executor
        .execute(&RequestSpec::post("login"), || service.authenticate(credentials))
        .await;
    let outcome = if result.is_ok() { "success" } else { "failure" };
    ctx.metrics
        .increment_counter(names::AUTH_ATTEMPTS, &[("outcome", outcome.into())]);

    match result {
        Ok(()) => {
            tracing::info!(actor = %actor, user = credentials.username(), "Authenticated");
            Ok(())
        }
        Err(failure) => {
            tracing::error!(actor = %actor, user = credentials.username(), error = %failure, "Authentication failed");
            Err(LoadError::new(failure.kind(), failure.to_string()))
        }
    }
}

// ============================================================================
// Producer
// ============================================================================

/// Runs the job pipeline once per iteration
pub struct ProducerActor {
    credentials: Credentials,
    service: Arc<dyn FlowService>,
    executor: RequestExecutor,
    orchestrator: JobOrchestrator,
    ctx: RunContext,
}

impl ProducerActor {
    /// Wrap an orchestrator; `service` must be the session it uses
    pub fn new(
        credentials: Credentials,
        service: Arc<dyn FlowService>,
        executor: RequestExecutor,
        orchestrator: JobOrchestrator,
        ctx: RunContext,
    ) -> Self {
        Self {
            credentials,
            service,
            executor,
            orchestrator,
            ctx,
        }
    }
}

#[async_trait]
impl Actor for ProducerActor {
    fn id(&self) -> &ActorId {
        self.orchestrator.actor()
    }

    fn role(&self) -> ActorRole {
        ActorRole::Producer
    }

    async fn on_start(&self) -> LoadResult<()> {
        authenticate(
            self.id(),
            &self.service,
            &self.executor,
            &self.credentials,
            &self.ctx,
        )
        .await
    }

    async fn run_iteration(&self, iteration: u32) -> IterationRecord {
        self.orchestrator.run_iteration(iteration).await
    }

    async fn on_stop(&self) {
        tracing::debug!(actor = %self.id(), "Producer leaving");
    }
}

// ============================================================================
// Consumer
// ============================================================================

/// Opens a random published artifact per iteration
///
/// Consumers never count toward the quota; they run until the run stops.
pub struct ConsumerActor {
    id: ActorId,
    credentials: Credentials,
    service: Arc<dyn FlowService>,
    executor: RequestExecutor,
    wait_timeout: Duration,
    ctx: RunContext,
}

impl ConsumerActor {
    /// Create a consumer that waits up to `wait_timeout` for the first artifact
    pub fn new(
        id: ActorId,
        credentials: Credentials,
        service: Arc<dyn FlowService>,
        executor: RequestExecutor,
        wait_timeout: Duration,
        ctx: RunContext,
    ) -> Self {
        Self {
            id,
            credentials,
            service,
            executor,
            wait_timeout,
            ctx,
        }
    }
}

#[async_trait]
impl Actor for ConsumerActor {
    fn id(&self) -> &ActorId {
        &self.id
    }

    fn role(&self) -> ActorRole {
        ActorRole::Consumer
    }

    async fn on_start(&self) -> LoadResult<()> {
        authenticate(
            &self.id,
            &self.service,
            &self.executor,
            &self.credentials,
            &self.ctx,
        )
        .await?;

        tracing::info!(actor = %self.id, timeout_secs = self.wait_timeout.as_secs(), "Waiting for first artifact");
        if self.ctx.artifacts.wait_for_any(self.wait_timeout).await {
            return Ok(());
        }
        if self.ctx.is_stopping() {
            return Err(LoadError::shutdown());
        }
        Err(LoadError::new(
            ErrorKind::NotReady,
            format!("no artifact published within {:?}", self.wait_timeout),
        ))
    }

    async fn run_iteration(&self, iteration: u32) -> IterationRecord {
        let mut record = IterationRecord::begin(
            self.id.clone(),
            ActorRole::Consumer,
            iteration,
            Stage::ArtifactOpen,
        );
        let started = Instant::now();

        let result = match self.ctx.artifacts.try_get_random() {
            None => Err(StageFailure::new(
                Stage::ArtifactOpen,
                ErrorKind::NotReady,
                "no artifact published yet",
            )),
            Some(artifact) => {
                record.artifact = Some(artifact.reference.clone());
                self.executor
                    .execute(&RequestSpec::get("open_artifact"), || {
                        self.service.open_artifact(&artifact.reference)
                    })
                    .await
                    .map_err(|failure| StageFailure::from_call(Stage::ArtifactOpen, failure))
            }
        };

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        record.stages.push(StageTiming {
            stage: Stage::ArtifactOpen,
            duration_ms: elapsed_ms,
            ok: result.is_ok(),
        });
        record.duration_ms = elapsed_ms;
        match result {
            Ok(()) => {
                record.success = true;
                record.stage_reached = Stage::Done;
                tracing::debug!(actor = %self.id, iteration, artifact = ?record.artifact, "Artifact opened");
            }
            Err(failure) => {
                tracing::warn!(actor = %self.id, iteration, error = %failure, "Artifact open failed");
                record.failure = Some(failure);
            }
        }

        self.ctx.metrics.increment_counter(
            names::ITERATIONS,
            &[
                ("role", ActorRole::Consumer.as_str().into()),
                ("outcome", record.outcome_label().into()),
            ],
        );
        record
    }
}
