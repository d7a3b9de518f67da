//! Per-actor job state machine

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::chunk::{ChunkSource, SourceSummary};
use crate::config::{LoadConfig, SecondarySettings, UploadSettings};
use crate::context::RunContext;
use crate::coordination::Artifact;
use crate::error::ErrorKind;
use crate::executor::{RequestExecutor, RequestSpec};
use crate::metrics::names;
use crate::model::{
    ActorId, ActorRole, ArtifactQuery, DatabaseId, JobId, RunId, SecondaryJobSpec, TableRef,
    TargetParams, UploadTarget,
};
use crate::poller::{PollResult, PollStatus, StatusPoller, StatusShape};
use crate::traits::{FlowService, ServiceError};
use crate::upload::{UploadPipeline, UploadSession};

use super::record::{IterationRecord, Stage, StageFailure, StageTiming, ValidationOutcome};

/// Remote job as seen by one iteration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    /// Remote id
    pub id: JobId,
    /// `<prefix>_<id>`; also the target table name
    pub label: String,
    /// Target connection and schema
    pub target: TargetParams,
    /// Resolved database
    pub database_id: Option<DatabaseId>,
    /// Current stage
    pub stage: Stage,
}

impl Job {
    fn upload_target(&self, database_id: DatabaseId) -> UploadTarget {
        UploadTarget {
            job_id: self.id,
            database_id,
            schema: self.target.schema.clone(),
            table: self.label.clone(),
        }
    }
}

/// Runs the job pipeline for one producer actor
///
/// Stages run strictly in order. The first failing stage aborts the
/// iteration; the next iteration starts over from [`Stage::Create`].
pub struct JobOrchestrator {
    actor: ActorId,
    username: String,
    service: Arc<dyn FlowService>,
    executor: RequestExecutor,
    uploader: UploadPipeline,
    poller: StatusPoller,
    source: Arc<dyn ChunkSource>,
    summary: SourceSummary,
    upload: UploadSettings,
    secondary: SecondarySettings,
    label_prefix: String,
    ctx: RunContext,
}

impl JobOrchestrator {
    /// Wire an orchestrator for `actor` logged in as `username`
    pub fn new(
        actor: ActorId,
        username: impl Into<String>,
        service: Arc<dyn FlowService>,
        source: Arc<dyn ChunkSource>,
        summary: SourceSummary,
        config: &LoadConfig,
        ctx: &RunContext,
    ) -> Self {
        let executor =
            RequestExecutor::for_run(ctx, config.retry.policy(), config.retry.request_timeout());
        let uploader = UploadPipeline::new(
            Arc::clone(&service),
            executor.clone(),
            config.upload.chunk_policy(),
            config.upload.chunk_timeout(),
            Arc::clone(&ctx.metrics),
            ctx.stop_token(),
        );
        let poller = StatusPoller::new(Arc::clone(&service), executor.clone(), ctx.stop_token());

        Self {
            actor,
            username: username.into(),
            service,
            executor,
            uploader,
            poller,
            source,
            summary,
            upload: config.upload.clone(),
            secondary: config.secondary.clone(),
            label_prefix: config.run.job_label_prefix.clone(),
            ctx: ctx.clone(),
        }
    }

    /// Actor this orchestrator works for
    pub fn actor(&self) -> &ActorId {
        &self.actor
    }

    /// Run one iteration; faults are captured in the record
    pub async fn run_iteration(&self, iteration: u32) -> IterationRecord {
        let clock = Instant::now();
        let mut record =
            IterationRecord::begin(self.actor.clone(), ActorRole::Producer, iteration, Stage::Create);
        record.total_chunks = self.summary.total_chunks;

        match self.drive(&mut record).await {
            Ok(()) => {
                record.success = true;
                record.stage_reached = Stage::Done;
            }
            Err(failure) => {
                tracing::warn!(
                    actor = %self.actor,
                    iteration,
                    job_id = ?record.job_id,
                    stage = %failure.stage,
                    error = %failure.message,
                    "Iteration aborted"
                );
                record.failure = Some(failure);
            }
        }
        record.duration_ms = clock.elapsed().as_secs_f64() * 1000.0;

        self.ctx.metrics.increment_counter(
            names::ITERATIONS,
            &[
                ("role", ActorRole::Producer.as_str().into()),
                ("outcome", record.outcome_label().into()),
            ],
        );
        if record.success {
            tracing::info!(
                actor = %self.actor,
                iteration,
                job_id = ?record.job_id,
                duration_ms = record.duration_ms as u64,
                uploaded = record.uploaded_chunks,
                total = record.total_chunks,
                validation = ?record.validation,
                "Iteration complete"
            );
        }
        record
    }

    async fn drive(&self, record: &mut IterationRecord) -> Result<(), StageFailure> {
        let total = self.summary.total_chunks;
        let stage_timeout = self.upload.stage_timeout(total);

        // CREATE
        let created = timed(record, Stage::Create, async {
            self.call(
                Stage::Create,
                RequestSpec::post("create_job"),
                || self.service.create_job(&self.label_prefix),
            )
            .await
        })
        .await;
        let status = if created.is_ok() { "success" } else { "failed" };
        self.ctx
            .metrics
            .increment_counter(names::JOB_CREATIONS, &[("status", status.into())]);
        let job_id = created?;
        record.job_id = Some(job_id);

        let mut job = Job {
            id: job_id,
            label: format!("{}_{}", self.label_prefix, job_id),
            target: TargetParams::default(),
            database_id: None,
            stage: Stage::Create,
        };
        tracing::debug!(actor = %self.actor, job_id = %job.id, label = %job.label, "Job created");

        // FETCH_PARAMS
        job.stage = Stage::FetchParams;
        job.target = timed(record, Stage::FetchParams, async {
            self.call(Stage::FetchParams, RequestSpec::get("job_params"), || {
                self.service.get_job_params(job_id)
            })
            .await
        })
        .await?;

        // CONFIGURE
        job.stage = Stage::Configure;
        timed(record, Stage::Configure, async {
            self.call(Stage::Configure, RequestSpec::put("update_job"), || {
                self.service.update_job(job_id, &job.label, &job.target)
            })
            .await
        })
        .await?;

        // RESOLVE_TARGET_DB
        job.stage = Stage::ResolveTargetDb;
        let database_id = timed(record, Stage::ResolveTargetDb, async {
            self.call(Stage::ResolveTargetDb, RequestSpec::get("databases"), || {
                self.service.resolve_target_database(&self.username)
            })
            .await
        })
        .await?;
        job.database_id = Some(database_id);
        let target = job.upload_target(database_id);

        // UPLOAD_START
        job.stage = Stage::UploadStart;
        timed(record, Stage::UploadStart, async {
            if total == 0 {
                return Err(StageFailure::new(
                    Stage::UploadStart,
                    ErrorKind::Input,
                    "input produced no chunks",
                ));
            }
            self.call(
                Stage::UploadStart,
                RequestSpec::post("start_upload").with_timeout(stage_timeout),
                || self.service.start_upload(&target, total),
            )
            .await
        })
        .await?;

        // UPLOAD_CHUNKS
        job.stage = Stage::UploadChunks;
        let uploaded = timed(record, Stage::UploadChunks, async {
            let stream = self.source.open().await.map_err(|e| {
                StageFailure::new(Stage::UploadChunks, e.kind, e.message)
            })?;
            let mut session = UploadSession::new(job_id, total);
            let uploaded = self.uploader.upload(&mut session, &target, stream).await;
            if self.ctx.is_stopping() {
                return Err(StageFailure::new(
                    Stage::UploadChunks,
                    ErrorKind::Shutdown,
                    format!("run stopped after {uploaded}/{total} chunks"),
                ));
            }
            if uploaded < total {
                tracing::warn!(
                    actor = %self.actor,
                    job_id = %job_id,
                    uploaded,
                    total,
                    failed = session.failed,
                    "Upload incomplete, continuing"
                );
            }
            Ok(uploaded)
        })
        .await?;
        record.uploaded_chunks = uploaded;

        // UPLOAD_FINALIZE
        job.stage = Stage::UploadFinalize;
        timed(record, Stage::UploadFinalize, async {
            self.call(
                Stage::UploadFinalize,
                RequestSpec::post("finalize_upload").with_timeout(stage_timeout),
                || self.service.finalize_upload(&target, uploaded),
            )
            .await
        })
        .await?;

        // PROCESS_START
        job.stage = Stage::ProcessStart;
        let run_id = timed(record, Stage::ProcessStart, async {
            self.call(
                Stage::ProcessStart,
                RequestSpec::post("start_processing").with_timeout(stage_timeout),
                || self.service.start_processing(&target),
            )
            .await
        })
        .await?;

        // PROCESS_POLL
        job.stage = Stage::ProcessPoll;
        timed(record, Stage::ProcessPoll, async {
            let result = self
                .poller
                .poll(&run_id, StatusShape::Flat, self.upload.poll_interval(), stage_timeout)
                .await;
            self.ctx
                .metrics
                .observe(names::PROCESSING_DURATION, &[], result.elapsed);
            poll_outcome(Stage::ProcessPoll, &result)
        })
        .await?;

        // VALIDATE
        job.stage = Stage::Validate;
        let table = TableRef::from(&target);
        let validation = timed(record, Stage::Validate, async {
            Ok::<_, StageFailure>(self.validate(job_id, &table).await)
        })
        .await?;
        record.validation = Some(validation);

        if !self.secondary.enabled {
            return Ok(());
        }

        // SECONDARY_PARAMS
        job.stage = Stage::SecondaryParams;
        let source = timed(record, Stage::SecondaryParams, async {
            self.call(
                Stage::SecondaryParams,
                RequestSpec::get("secondary_params"),
                || self.service.get_secondary_params(job_id),
            )
            .await
        })
        .await?;

        // SECONDARY_CREATE
        job.stage = Stage::SecondaryCreate;
        let spec = SecondaryJobSpec {
            parent: job_id,
            label: format!("{}{}", job.label, self.secondary.label_suffix),
            source,
            table: job.label.clone(),
        };
        let secondary_job = timed(record, Stage::SecondaryCreate, async {
            self.call(
                Stage::SecondaryCreate,
                RequestSpec::post("create_secondary_job"),
                || self.service.create_secondary_job(&spec),
            )
            .await
        })
        .await?;

        // SECONDARY_START
        job.stage = Stage::SecondaryStart;
        let secondary_run = timed(record, Stage::SecondaryStart, async {
            self.call(
                Stage::SecondaryStart,
                RequestSpec::post("start_secondary"),
                || self.service.start_secondary(secondary_job),
            )
            .await
        })
        .await?;

        // SECONDARY_POLL
        job.stage = Stage::SecondaryPoll;
        let polled = timed(record, Stage::SecondaryPoll, async {
            let result = self
                .poller
                .poll(
                    &secondary_run,
                    StatusShape::BlockTree,
                    self.secondary.poll_interval(),
                    self.secondary.timeout(),
                )
                .await;
            poll_outcome(Stage::SecondaryPoll, &result).map(|()| result)
        })
        .await?;

        // ARTIFACT_LOOKUP
        job.stage = Stage::ArtifactLookup;
        let reference = timed(record, Stage::ArtifactLookup, async {
            self.lookup_artifact(secondary_job, secondary_run, &polled).await
        })
        .await?;

        // ARTIFACT_OPEN
        job.stage = Stage::ArtifactOpen;
        timed(record, Stage::ArtifactOpen, async {
            self.call(Stage::ArtifactOpen, RequestSpec::get("open_artifact"), || {
                self.service.open_artifact(&reference)
            })
            .await
        })
        .await?;

        self.ctx
            .artifacts
            .publish(Artifact::new(reference.clone(), self.actor.clone()));
        record.artifact = Some(reference);
        Ok(())
    }

    async fn validate(&self, job_id: JobId, table: &TableRef) -> ValidationOutcome {
        let expected = self.summary.data_rows;
        let job_label = job_id.to_string();

        let outcome = match self
            .executor
            .execute(&RequestSpec::post("row_count"), || {
                self.service.query_row_count(table)
            })
            .await
        {
            Ok(actual) => {
                self.ctx.metrics.set_gauge(
                    names::ROW_COUNT,
                    &[("job_id", job_label.clone())],
                    actual as f64,
                );
                ValidationOutcome::compare(expected, actual)
            }
            Err(failure) => ValidationOutcome::QueryFailed {
                reason: failure.to_string(),
            },
        };

        match &outcome {
            ValidationOutcome::Match { rows } => {
                tracing::info!(actor = %self.actor, job_id = %job_id, rows, "Row count matches");
            }
            ValidationOutcome::Mismatch { expected, actual } => {
                tracing::warn!(
                    actor = %self.actor,
                    job_id = %job_id,
                    table = %table.qualified_name(),
                    expected,
                    actual,
                    "Row count mismatch"
                );
            }
            ValidationOutcome::QueryFailed { reason } => {
                tracing::warn!(actor = %self.actor, job_id = %job_id, error = %reason, "Row count query failed");
            }
        }
        if !matches!(outcome, ValidationOutcome::QueryFailed { .. }) {
            self.ctx.metrics.set_gauge(
                names::VALIDATION_RESULT,
                &[("job_id", job_label)],
                if outcome.is_match() { 1.0 } else { 0.0 },
            );
        }
        outcome
    }

    async fn lookup_artifact(
        &self,
        job_id: JobId,
        run_id: RunId,
        polled: &PollResult,
    ) -> Result<String, StageFailure> {
        let block_id = self.secondary.artifact_block.clone();
        let block_run_id = polled.sub_tasks.get(&block_id).cloned().ok_or_else(|| {
            StageFailure::new(
                Stage::ArtifactLookup,
                ErrorKind::InvalidResponse,
                format!("no run id reported for sub-task {block_id}"),
            )
        })?;
        let query = ArtifactQuery {
            job_id,
            run_id,
            block_id,
            block_run_id,
        };

        self.call(Stage::ArtifactLookup, RequestSpec::get("artifact_lookup"), || {
            self.service.lookup_artifact(&query)
        })
        .await?
        .ok_or_else(|| {
            StageFailure::new(
                Stage::ArtifactLookup,
                ErrorKind::RemoteFailure,
                format!("secondary job {job_id} produced no artifact"),
            )
        })
    }

    async fn call<T, F, Fut>(
        &self,
        stage: Stage,
        request: RequestSpec,
        action: F,
    ) -> Result<T, StageFailure>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        self.executor
            .execute(&request, action)
            .await
            .map_err(|failure| StageFailure::from_call(stage, failure))
    }
}

impl std::fmt::Debug for JobOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobOrchestrator")
            .field("actor", &self.actor)
            .field("username", &self.username)
            .field("summary", &self.summary)
            .field("secondary", &self.secondary.enabled)
            .finish()
    }
}

/// Run a stage and append its timing to the record
async fn timed<T, Fut>(
    record: &mut IterationRecord,
    stage: Stage,
    work: Fut,
) -> Result<T, StageFailure>
where
    Fut: Future<Output = Result<T, StageFailure>>,
{
    record.stage_reached = stage;
    let started = Instant::now();
    let result = work.await;
    record.stages.push(StageTiming {
        stage,
        duration_ms: duration_ms(started.elapsed()),
        ok: result.is_ok(),
    });
    result
}

fn duration_ms(elapsed: Duration) -> f64 {
    elapsed.as_secs_f64() * 1000.0
}

fn poll_outcome(stage: Stage, result: &PollResult) -> Result<(), StageFailure> {
    let detail = || result.error.clone().unwrap_or_default();
    match result.status {
        PollStatus::Success => Ok(()),
        _ if result.stopped => Err(StageFailure::new(stage, ErrorKind::Shutdown, detail())),
        PollStatus::Timeout => Err(StageFailure::new(stage, ErrorKind::Timeout, detail())),
        _ => Err(StageFailure::new(stage, ErrorKind::RemoteFailure, detail())),
    }
}
