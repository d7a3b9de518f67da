//! Chunked upload with per-chunk retry
//!
//! Chunks are sent strictly in order. Each chunk gets its own linear retry
//! budget on top of the executor's transport-level retries; a chunk that
//! still fails is counted and skipped so the upload can be finalized with
//! whatever made it across.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::chunk::ChunkStream;
use crate::executor::{CallFailure, RequestExecutor, RequestSpec};
use crate::metrics::{names, MetricsSink};
use crate::model::{JobId, UploadTarget};
use crate::retry::{retry_with_backoff, Attempt, RetryError, RetryPolicy};
use crate::traits::FlowService;

/// Progress of one job's upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSession {
    /// Job being uploaded
    pub job_id: JobId,
    /// Chunks announced
    pub total_chunks: usize,
    /// Chunks confirmed
    pub uploaded: usize,
    /// Chunks given up on
    pub failed: usize,
}

impl UploadSession {
    /// Session with nothing uploaded yet
    pub fn new(job_id: JobId, total_chunks: usize) -> Self {
        Self {
            job_id,
            total_chunks,
            uploaded: 0,
            failed: 0,
        }
    }

    /// Record one confirmed chunk; never exceeds the total
    pub fn record_uploaded(&mut self) {
        if self.uploaded < self.total_chunks {
            self.uploaded += 1;
        }
    }

    /// Confirmed share of the total, 0-100
    pub fn progress_percent(&self) -> f64 {
        if self.total_chunks == 0 {
            return 0.0;
        }
        self.uploaded as f64 / self.total_chunks as f64 * 100.0
    }

    /// Every chunk confirmed
    pub fn is_complete(&self) -> bool {
        self.total_chunks > 0 && self.uploaded == self.total_chunks
    }
}

/// Sends chunk streams through the executor
#[derive(Clone)]
pub struct UploadPipeline {
    service: Arc<dyn FlowService>,
    executor: RequestExecutor,
    chunk_policy: RetryPolicy,
    chunk_timeout: Duration,
    metrics: Arc<dyn MetricsSink>,
    stop: CancellationToken,
}

impl UploadPipeline {
    /// Create a pipeline
    pub fn new(
        service: Arc<dyn FlowService>,
        executor: RequestExecutor,
        chunk_policy: RetryPolicy,
        chunk_timeout: Duration,
        metrics: Arc<dyn MetricsSink>,
        stop: CancellationToken,
    ) -> Self {
        Self {
            service,
            executor,
            chunk_policy,
            chunk_timeout,
            metrics,
            stop,
        }
    }

    /// Upload every chunk of `chunks` in order; returns the confirmed count
    ///
    /// Stops early when the run stops or the stream errors.
    pub async fn upload(
        &self,
        session: &mut UploadSession,
        target: &UploadTarget,
        mut chunks: ChunkStream,
    ) -> usize {
        let job_label = session.job_id.to_string();
        let request = RequestSpec::post("upload_chunk").with_timeout(self.chunk_timeout);

        while let Some(next) = chunks.next().await {
            if self.stop.is_cancelled() {
                tracing::info!(job_id = %session.job_id, uploaded = session.uploaded, "Upload interrupted by stop");
                break;
            }
            let chunk = match next {
                Ok(chunk) => chunk,
                Err(e) => {
                    tracing::error!(job_id = %session.job_id, error = %e, "Reading input failed, ending upload");
                    break;
                }
            };
            if chunk.number == 0 || chunk.number > session.total_chunks {
                tracing::warn!(
                    job_id = %session.job_id,
                    chunk = chunk.number,
                    total = session.total_chunks,
                    "Chunk outside announced range, skipped"
                );
                continue;
            }

            self.metrics
                .add_gauge(names::CHUNKS_IN_PROGRESS, &[], 1.0);
            let started = Instant::now();
            let total = session.total_chunks;
            let service = &self.service;
            let executor = &self.executor;
            let request = &request;
            let chunk_ref = &chunk;

            let outcome = retry_with_backoff(
                &self.chunk_policy,
                "upload_chunk",
                &self.stop,
                move |_| async move {
                    match executor
                        .execute(request, || service.upload_chunk(target, chunk_ref, total))
                        .await
                    {
                        Ok(()) => Attempt::Done(()),
                        Err(failure @ CallFailure::Stopped { .. }) => Attempt::Fail(failure),
                        Err(failure) => Attempt::Retry(failure),
                    }
                },
            )
            .await;

            self.metrics
                .add_gauge(names::CHUNKS_IN_PROGRESS, &[], -1.0);
            self.metrics
                .observe(names::CHUNK_UPLOAD_DURATION, &[], started.elapsed());

            match outcome {
                Ok(()) => {
                    session.record_uploaded();
                    self.metrics
                        .increment_counter(names::CHUNK_UPLOADS, &[("status", "success".into())]);
                    self.metrics.set_gauge(
                        names::UPLOAD_PROGRESS,
                        &[("job_id", job_label.clone())],
                        session.progress_percent(),
                    );
                    tracing::debug!(
                        job_id = %session.job_id,
                        chunk = chunk.number,
                        total,
                        bytes = chunk.size_bytes(),
                        "Chunk uploaded"
                    );
                }
                Err(RetryError::Exhausted { error, attempts }) => {
                    session.failed += 1;
                    self.metrics
                        .increment_counter(names::CHUNK_UPLOADS, &[("status", "failed".into())]);
                    tracing::error!(
                        job_id = %session.job_id,
                        chunk = chunk.number,
                        attempts,
                        error = %error,
                        "Chunk upload failed, continuing with next chunk"
                    );
                }
                Err(RetryError::Rejected { .. }) | Err(RetryError::Cancelled { .. }) => {
                    tracing::info!(job_id = %session.job_id, uploaded = session.uploaded, "Upload interrupted by stop");
                    break;
                }
            }
        }

        session.uploaded
    }
}

impl std::fmt::Debug for UploadPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadPipeline")
            .field("chunk_policy", &self.chunk_policy)
            .field("chunk_timeout", &self.chunk_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{summarize, Chunk};
    use crate::context::RunContext;
    use crate::error::LoadError;
    use crate::metrics::InMemoryMetrics;
    use crate::model::DatabaseId;
    use crate::test_support::{csv_source, fast_executor, metered_context, MockFlowService};
    use crate::traits::ServiceError;

    fn pipeline(service: &Arc<MockFlowService>, ctx: &RunContext) -> UploadPipeline {
        UploadPipeline::new(
            service.clone(),
            fast_executor(ctx),
            RetryPolicy::linear(3, Duration::from_millis(10), Duration::from_millis(40)),
            Duration::from_secs(5),
            ctx.metrics.clone(),
            ctx.stop_token(),
        )
    }

    fn target() -> UploadTarget {
        UploadTarget {
            job_id: JobId(9),
            database_id: DatabaseId(7),
            schema: "staging".into(),
            table: "Tube_9".into(),
        }
    }

    fn chunk(number: usize) -> Chunk {
        Chunk {
            number,
            content: format!("{number},eu-1,1.50\n").into_bytes(),
        }
    }

    fn stream(items: Vec<crate::error::LoadResult<Chunk>>) -> ChunkStream {
        Box::pin(futures::stream::iter(items))
    }

    fn failed_chunks(metrics: &InMemoryMetrics) -> u64 {
        metrics.counter(names::CHUNK_UPLOADS, &[("status", "failed".into())])
    }

    #[test]
    fn test_progress_percent() {
        let mut session = UploadSession::new(JobId(1), 4);
        assert_eq!(session.progress_percent(), 0.0);
        session.record_uploaded();
        assert_eq!(session.progress_percent(), 25.0);
        for _ in 0..10 {
            session.record_uploaded();
        }
        assert_eq!(session.uploaded, 4);
        assert_eq!(session.progress_percent(), 100.0);
        assert!(session.is_complete());
    }

    #[test]
    fn test_empty_session_is_never_complete() {
        let session = UploadSession::new(JobId(1), 0);
        assert_eq!(session.progress_percent(), 0.0);
        assert!(!session.is_complete());
    }

    #[tokio::test(start_paused = true)]
    async fn test_upload_sends_every_chunk_in_order() {
        let (ctx, _) = metered_context(1);
        let service = Arc::new(MockFlowService::new());
        let source = csv_source(40, 64);
        let total = summarize(source.as_ref()).await.unwrap().total_chunks;

        let mut session = UploadSession::new(JobId(9), total);
        let uploaded = pipeline(&service, &ctx)
            .upload(&mut session, &target(), source.open().await.unwrap())
            .await;

        assert_eq!(uploaded, total);
        assert!(session.is_complete());
        assert_eq!(
            service.uploaded_chunks("Tube_9"),
            (1..=total).collect::<Vec<_>>()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_chunk_failing_uploads_nothing() {
        let (ctx, metrics) = metered_context(1);
        let service = Arc::new(MockFlowService::new());
        service.fail(
            "upload_chunk",
            (0..9)
                .map(|_| ServiceError::status(413, "payload too large"))
                .collect(),
        );

        let mut session = UploadSession::new(JobId(9), 3);
        let uploaded = pipeline(&service, &ctx)
            .upload(
                &mut session,
                &target(),
                stream(vec![Ok(chunk(1)), Ok(chunk(2)), Ok(chunk(3))]),
            )
            .await;

        assert_eq!(uploaded, 0);
        assert_eq!(session.failed, 3);
        assert!(!session.is_complete());
        // Three chunk-level attempts per chunk
        assert_eq!(service.calls("upload_chunk"), 9);
        assert_eq!(failed_chunks(&metrics), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_chunk_beyond_announced_total_is_skipped() {
        let (ctx, _) = metered_context(1);
        let service = Arc::new(MockFlowService::new());

        let mut session = UploadSession::new(JobId(9), 2);
        let uploaded = pipeline(&service, &ctx)
            .upload(
                &mut session,
                &target(),
                stream(vec![Ok(chunk(1)), Ok(chunk(2)), Ok(chunk(3))]),
            )
            .await;

        assert_eq!(uploaded, 2);
        assert_eq!(session.failed, 0);
        assert_eq!(service.uploaded_chunks("Tube_9"), vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_error_returns_count_so_far() {
        let (ctx, _) = metered_context(1);
        let service = Arc::new(MockFlowService::new());

        let mut session = UploadSession::new(JobId(9), 3);
        let uploaded = pipeline(&service, &ctx)
            .upload(
                &mut session,
                &target(),
                stream(vec![
                    Ok(chunk(1)),
                    Err(LoadError::input("input file truncated")),
                    Ok(chunk(3)),
                ]),
            )
            .await;

        assert_eq!(uploaded, 1);
        assert_eq!(service.uploaded_chunks("Tube_9"), vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_between_chunks_ends_upload() {
        let (ctx, _) = metered_context(1);
        let service = Arc::new(MockFlowService::new());

        // The run stops while the second chunk is being read
        let stopper = ctx.clone();
        let chunks: ChunkStream = Box::pin(futures::stream::iter(1..=3).map(move |number| {
            if number == 2 {
                stopper.request_stop("test");
            }
            Ok::<_, LoadError>(chunk(number))
        }));

        let mut session = UploadSession::new(JobId(9), 3);
        let uploaded = pipeline(&service, &ctx)
            .upload(&mut session, &target(), chunks)
            .await;

        assert_eq!(uploaded, 1);
        assert_eq!(session.failed, 0);
        assert_eq!(service.calls("upload_chunk"), 1);
        assert_eq!(service.uploaded_chunks("Tube_9"), vec![1]);
    }
}
