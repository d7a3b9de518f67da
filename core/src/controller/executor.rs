//! Run controller execution logic

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use crate::chunk::{summarize, ChunkSource};
use crate::config::LoadConfig;
use crate::context::RunContext;
use crate::credentials::CredentialPool;
use crate::error::{LoadError, LoadResult};
use crate::executor::RequestExecutor;
use crate::metrics::names;
use crate::model::{ActorId, ActorRole};
use crate::pipeline::{IterationRecord, JobOrchestrator};
use crate::traits::FlowServiceFactory;
use crate::worker::{Actor, ConsumerActor, ProducerActor, Worker, WorkerBuilder};

use super::aggregator::{aggregate_worker_stats, AggregatedStats};

/// RunController manages the run lifecycle
///
/// Responsible for building actors, spawning workers, coordinating shutdown
/// and collecting results.
pub struct RunController {
    /// Load configuration
    pub(crate) config: LoadConfig,

    /// Opens one service session per actor
    pub(crate) factory: Arc<dyn FlowServiceFactory>,

    /// Input uploaded by every producer
    pub(crate) source: Arc<dyn ChunkSource>,

    /// Run-scoped shared state
    pub(crate) ctx: RunContext,

    /// Record sender (cloned for each worker)
    pub(crate) records_tx: mpsc::Sender<IterationRecord>,
}

impl RunController {
    /// Create a new controller
    ///
    /// Use `RunControllerBuilder` for a more ergonomic construction.
    pub fn new(
        config: LoadConfig,
        factory: Arc<dyn FlowServiceFactory>,
        source: Arc<dyn ChunkSource>,
        ctx: RunContext,
        records_tx: mpsc::Sender<IterationRecord>,
    ) -> Self {
        Self {
            config,
            factory,
            source,
            ctx,
            records_tx,
        }
    }

    /// Run-scoped state shared with every actor
    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    /// Get the load configuration
    pub fn config(&self) -> &LoadConfig {
        &self.config
    }

    /// Stop every worker
    pub fn shutdown(&self) {
        self.ctx.request_stop("shutdown requested");
    }

    /// Run the load test
    ///
    /// Builds every actor, spawns the workers, waits for them and returns
    /// aggregated stats. The record receiver closes when this returns.
    pub async fn run(self) -> LoadResult<AggregatedStats> {
        let start = Instant::now();
        let run = &self.config.run;

        let summary = summarize(self.source.as_ref()).await?;
        self.ctx
            .metrics
            .set_gauge(names::EXPECTED_ROWS, &[], summary.data_rows as f64);
        self.ctx.coordinator.setup(run.producers);

        tracing::info!(
            run_id = %self.ctx.run_id,
            producers = run.producers,
            consumers = run.consumers,
            iterations_per_actor = run.iterations_per_actor,
            chunks = summary.total_chunks,
            expected_rows = summary.data_rows,
            rate_limit = ?run.requests_per_second,
            "Starting run"
        );

        // Open every session before spawning so a failing factory leaves
        // nothing running
        let workers = match self.build_workers(summary) {
            Ok(workers) => workers,
            Err(e) => {
                self.ctx.request_stop("actor setup failed");
                return Err(e);
            }
        };

        let mut handles = Vec::with_capacity(workers.len());
        for worker in workers {
            let actor = worker.actor_id().clone();
            handles.push((actor, tokio::spawn(worker.run())));
        }

        // Wait for all workers to complete
        let mut results = Vec::with_capacity(handles.len());
        let mut worker_failures = 0;
        for (actor, handle) in handles {
            match handle.await {
                Ok(Ok(stats)) => {
                    tracing::debug!(
                        actor = %actor,
                        completed = stats.completed,
                        failed = stats.failed,
                        "Worker completed"
                    );
                    results.push(stats);
                }
                Ok(Err(e)) => {
                    worker_failures += 1;
                    tracing::error!(actor = %actor, error = %e, "Worker returned error");
                }
                Err(e) => {
                    worker_failures += 1;
                    tracing::error!(actor = %actor, error = %e, "Worker task panicked");
                }
            }
        }

        self.ctx.request_stop("all workers finished");

        // If all workers failed, return an error
        if results.is_empty() && worker_failures > 0 {
            return Err(LoadError::orchestration(format!(
                "All {} workers failed to complete",
                worker_failures
            )));
        }

        let aggregated = aggregate_worker_stats(&results);
        let completion = self.ctx.coordinator.stats();
        tracing::info!(
            run_id = %self.ctx.run_id,
            elapsed_secs = start.elapsed().as_secs_f64(),
            completed = aggregated.completed,
            failed = aggregated.failed,
            mismatches = aggregated.validation_mismatches,
            retired = aggregated.retired,
            producer_iterations = completion.total_iterations,
            ips = aggregated.iterations_per_second,
            "Run completed"
        );

        Ok(aggregated)
    }

    /// Run with Ctrl+C signal handling
    ///
    /// Ctrl+C stops the run the same way a reached quota does: in-flight
    /// iterations finish and their results are discarded.
    pub async fn run_with_signal_handling(self) -> LoadResult<AggregatedStats> {
        let ctx = self.ctx.clone();

        let signal_handle = tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
                    ctx.request_stop("interrupted");
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to listen for Ctrl+C");
                }
            }
        });

        let result = self.run().await;
        signal_handle.abort();

        result
    }

    /// Run with a wall-clock limit
    pub async fn run_with_timeout(self, timeout: Duration) -> LoadResult<AggregatedStats> {
        let ctx = self.ctx.clone();

        let timeout_handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            tracing::info!("Timeout reached, initiating shutdown...");
            ctx.request_stop("run timeout reached");
        });

        let result = self.run().await;
        timeout_handle.abort();

        result
    }

    fn build_workers(&self, summary: crate::chunk::SourceSummary) -> LoadResult<Vec<Worker>> {
        let run = &self.config.run;
        let users = CredentialPool::new(self.config.users.clone())?;
        let mut workers = Vec::with_capacity(run.producers + run.consumers);

        for index in 0..run.producers {
            let id = ActorId::new(ActorRole::Producer, index);
            let credentials = users.next();
            let service = self.factory.session(&id)?;
            let orchestrator = JobOrchestrator::new(
                id,
                credentials.username(),
                Arc::clone(&service),
                Arc::clone(&self.source),
                summary,
                &self.config,
                &self.ctx,
            );
            let actor = ProducerActor::new(
                credentials,
                service,
                self.executor(),
                orchestrator,
                self.ctx.clone(),
            );
            workers.push(self.worker(Box::new(actor))?);
        }

        for index in 0..run.consumers {
            let id = ActorId::new(ActorRole::Consumer, index);
            let credentials = users.next();
            let service = self.factory.session(&id)?;
            let actor = ConsumerActor::new(
                id,
                credentials,
                service,
                self.executor(),
                self.config.consumer.wait_timeout(),
                self.ctx.clone(),
            );
            workers.push(self.worker(Box::new(actor))?);
        }

        Ok(workers)
    }

    fn worker(&self, actor: Box<dyn Actor>) -> LoadResult<Worker> {
        let (min, max) = self.config.run.think_time();
        WorkerBuilder::new()
            .actor(actor)
            .context(self.ctx.clone())
            .records_tx(self.records_tx.clone())
            .think_time(min, max)
            .build()
    }

    fn executor(&self) -> RequestExecutor {
        RequestExecutor::for_run(
            &self.ctx,
            self.config.retry.policy(),
            self.config.retry.request_timeout(),
        )
    }
}

impl std::fmt::Debug for RunController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunController")
            .field("run_id", &self.ctx.run_id)
            .field("producers", &self.config.run.producers)
            .field("consumers", &self.config.run.consumers)
            .field("source", &self.source.describe())
            .finish()
    }
}
