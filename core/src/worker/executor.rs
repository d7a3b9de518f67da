//! Worker execution loop

use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;

use crate::context::RunContext;
use crate::error::LoadResult;
use crate::metrics::names;
use crate::model::ActorRole;
use crate::pipeline::IterationRecord;

use super::actor::Actor;
use super::stats::WorkerStats;

/// Drives one actor: start -> iterate -> report -> think -> repeat
///
/// Producers leave once their quota is reached; every worker leaves as soon
/// as the run stops. Workers share nothing but the [`RunContext`].
pub struct Worker {
    /// The actor being driven
    actor: Box<dyn Actor>,

    /// Run-scoped shared state
    ctx: RunContext,

    /// Channel for iteration records
    records_tx: mpsc::Sender<IterationRecord>,

    /// Pause bounds between iterations
    think_time: (Duration, Duration),
}

impl Worker {
    /// Create a new worker
    pub fn new(
        actor: Box<dyn Actor>,
        ctx: RunContext,
        records_tx: mpsc::Sender<IterationRecord>,
        think_time: (Duration, Duration),
    ) -> Self {
        Self {
            actor,
            ctx,
            records_tx,
            think_time,
        }
    }

    /// Run the worker loop until the quota is reached or the run stops
    pub async fn run(self) -> LoadResult<WorkerStats> {
        let mut stats = WorkerStats::new();
        stats.start();
        let actor_id = self.actor.id().clone();
        let role = self.actor.role();
        let role_label = [("role", role.as_str().to_string())];

        self.ctx
            .metrics
            .add_gauge(names::ACTIVE_ACTORS, &role_label, 1.0);
        tracing::debug!(actor = %actor_id, "Worker started");

        match self.actor.on_start().await {
            Ok(()) => self.iterate(&mut stats).await,
            Err(e) if self.ctx.is_stopping() => {
                tracing::debug!(actor = %actor_id, error = %e, "Run stopped during startup");
            }
            Err(e) => {
                tracing::warn!(actor = %actor_id, error = %e, "Actor failed to start, retiring");
                self.retire(&mut stats);
            }
        }

        self.actor.on_stop().await;
        self.ctx
            .metrics
            .add_gauge(names::ACTIVE_ACTORS, &role_label, -1.0);
        stats.stop();
        tracing::debug!(
            actor = %actor_id,
            completed = stats.completed,
            failed = stats.failed,
            discarded = stats.discarded,
            elapsed_ms = ?stats.elapsed().map(|d| d.as_millis()),
            "Worker finished"
        );

        Ok(stats)
    }

    async fn iterate(&self, stats: &mut WorkerStats) {
        let actor_id = self.actor.id();
        let producer = self.actor.role() == ActorRole::Producer;
        let mut iteration = 0u32;

        loop {
            // Check stop conditions BEFORE starting work
            if self.ctx.is_stopping() || self.ctx.coordinator.should_stop() {
                tracing::debug!(actor = %actor_id, "Run is stopping, worker leaving");
                break;
            }
            if producer && self.ctx.coordinator.is_actor_finished(actor_id) {
                break;
            }

            let record = self.actor.run_iteration(iteration).await;

            // In-flight work is never aborted, but its result is dropped
            if self.ctx.is_stopping() {
                stats.discarded += 1;
                tracing::debug!(actor = %actor_id, iteration, "Result discarded, run stopped");
                break;
            }

            stats.record(&record);
            let fatal = record
                .failure_kind()
                .is_some_and(|kind| kind.is_fatal_for_actor());

            let mut quota_reached = false;
            if producer {
                let progress = self.ctx.coordinator.record_iteration_complete(actor_id);
                quota_reached = progress.actor_quota_reached;
                if progress.stop_triggered {
                    self.ctx.request_stop("every producer reached its quota");
                }
            }

            if self.records_tx.send(record).await.is_err() {
                tracing::debug!(actor = %actor_id, "Record channel closed, worker stopping");
                break;
            }

            if fatal {
                tracing::warn!(actor = %actor_id, iteration, "Authentication lost, retiring actor");
                self.retire(stats);
                break;
            }
            if quota_reached {
                tracing::info!(actor = %actor_id, iterations = iteration + 1, "Actor reached its quota");
                break;
            }

            iteration += 1;
            let pause = self.think_time();
            if !pause.is_zero() {
                tokio::select! {
                    _ = self.ctx.stopped() => break,
                    _ = tokio::time::sleep(pause) => {}
                }
            }
        }
    }

    fn retire(&self, stats: &mut WorkerStats) {
        stats.retired += 1;
        if self.actor.role() != ActorRole::Producer {
            return;
        }
        let progress = self.ctx.coordinator.retire_actor(self.actor.id());
        if progress.stop_triggered {
            self.ctx.request_stop("every producer finished or retired");
        }
    }

    fn think_time(&self) -> Duration {
        let (min, max) = self.think_time;
        if max <= min {
            return min;
        }
        let ms = rand::rng().random_range(min.as_millis() as u64..=max.as_millis() as u64);
        Duration::from_millis(ms)
    }

    /// Id of the driven actor
    pub fn actor_id(&self) -> &crate::model::ActorId {
        self.actor.id()
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("actor", self.actor.id())
            .field("role", &self.actor.role())
            .field("think_time", &self.think_time)
            .finish()
    }
}
