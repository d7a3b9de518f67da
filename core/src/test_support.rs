//! Scripted in-memory service shared by the unit tests

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;

use crate::chunk::{Chunk, ChunkSource, LineChunkSource};
use crate::config::LoadConfig;
use crate::context::RunContext;
use crate::credentials::Credentials;
use crate::error::LoadResult;
use crate::executor::RequestExecutor;
use crate::metrics::InMemoryMetrics;
use crate::model::{
    ActorId, ArtifactQuery, DatabaseId, JobId, RunId, SecondaryJobSpec, SourceParams, TableRef,
    TargetParams, UploadTarget,
};
use crate::poller::StatusShape;
use crate::rate_limiter::RequestRateLimiter;
use crate::traits::{FlowService, FlowServiceFactory, ServiceError};

/// In-memory job service
///
/// Row counts are derived from the bytes actually uploaded, so a complete
/// upload validates and a lossy one does not.
pub struct MockFlowService {
    latency: Duration,
    next_id: AtomicU64,
    failures: Mutex<HashMap<String, VecDeque<ServiceError>>>,
    statuses: Mutex<HashMap<StatusShape, VecDeque<serde_json::Value>>>,
    row_count_override: Mutex<Option<u64>>,
    artifact: Mutex<Option<Option<String>>>,
    uploads: Mutex<BTreeMap<String, Vec<Chunk>>>,
    opened: Mutex<Vec<String>>,
    calls: Mutex<Vec<String>>,
}

impl MockFlowService {
    pub fn new() -> Self {
        Self {
            latency: Duration::from_millis(1),
            next_id: AtomicU64::new(100),
            failures: Mutex::new(HashMap::new()),
            statuses: Mutex::new(HashMap::new()),
            row_count_override: Mutex::new(None),
            artifact: Mutex::new(None),
            uploads: Mutex::new(BTreeMap::new()),
            opened: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Queue failures for an operation; `upload_chunk:N` targets chunk N
    pub fn fail(&self, op: &str, errors: Vec<ServiceError>) {
        self.failures
            .lock()
            .entry(op.to_string())
            .or_default()
            .extend(errors);
    }

    /// Queue status documents; once drained the shape reports success
    pub fn script_statuses(&self, shape: StatusShape, docs: Vec<serde_json::Value>) {
        self.statuses.lock().entry(shape).or_default().extend(docs);
    }

    pub fn set_row_count(&self, rows: u64) {
        *self.row_count_override.lock() = Some(rows);
    }

    pub fn set_artifact(&self, artifact: Option<String>) {
        *self.artifact.lock() = Some(artifact);
    }

    pub fn calls(&self, op: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.as_str() == op).count()
    }

    pub fn uploaded_chunks(&self, table: &str) -> Vec<usize> {
        self.uploads
            .lock()
            .get(table)
            .map(|chunks| chunks.iter().map(|c| c.number).collect())
            .unwrap_or_default()
    }

    pub fn uploaded_bytes(&self, table: &str) -> Vec<u8> {
        self.uploads
            .lock()
            .get(table)
            .map(|chunks| chunks.iter().flat_map(|c| c.content.clone()).collect())
            .unwrap_or_default()
    }

    pub fn opened(&self) -> Vec<String> {
        self.opened.lock().clone()
    }

    async fn enter(&self, op: &str) -> Result<(), ServiceError> {
        self.calls.lock().push(op.to_string());
        tokio::time::sleep(self.latency).await;
        match self.failures.lock().get_mut(op).and_then(|q| q.pop_front()) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }
}

pub fn flat_status(status: &str) -> serde_json::Value {
    json!({ "status": status, "error": null })
}

pub fn block_status(status: &str, blocks: &[(&str, &str, Option<&str>)]) -> serde_json::Value {
    let blocks: Vec<_> = blocks
        .iter()
        .map(|(id, status, run)| json!({"block_id": id, "status": status, "block_run_id": run}))
        .collect();
    json!({ "result": { "status": status, "blocks": blocks } })
}

#[async_trait]
impl FlowService for MockFlowService {
    async fn authenticate(&self, _credentials: &Credentials) -> Result<(), ServiceError> {
        self.enter("authenticate").await
    }

    async fn create_job(&self, _label: &str) -> Result<JobId, ServiceError> {
        self.enter("create_job").await?;
        Ok(JobId(self.next_id()))
    }

    async fn get_job_params(&self, job: JobId) -> Result<TargetParams, ServiceError> {
        self.enter("get_job_params").await?;
        Ok(TargetParams {
            connection: format!("conn-{job}"),
            schema: "staging".into(),
        })
    }

    async fn update_job(
        &self,
        _job: JobId,
        _label: &str,
        _target: &TargetParams,
    ) -> Result<(), ServiceError> {
        self.enter("update_job").await
    }

    async fn resolve_target_database(&self, _username: &str) -> Result<DatabaseId, ServiceError> {
        self.enter("resolve_target_database").await?;
        Ok(DatabaseId(7))
    }

    async fn start_upload(
        &self,
        target: &UploadTarget,
        _total_chunks: usize,
    ) -> Result<(), ServiceError> {
        self.enter("start_upload").await?;
        self.uploads.lock().insert(target.table.clone(), Vec::new());
        Ok(())
    }

    async fn upload_chunk(
        &self,
        target: &UploadTarget,
        chunk: &Chunk,
        _total_chunks: usize,
    ) -> Result<(), ServiceError> {
        self.enter("upload_chunk").await?;
        self.enter(&format!("upload_chunk:{}", chunk.number)).await?;
        self.uploads
            .lock()
            .entry(target.table.clone())
            .or_default()
            .push(chunk.clone());
        Ok(())
    }

    async fn finalize_upload(
        &self,
        _target: &UploadTarget,
        _uploaded_chunks: usize,
    ) -> Result<(), ServiceError> {
        self.enter("finalize_upload").await
    }

    async fn start_processing(&self, _target: &UploadTarget) -> Result<RunId, ServiceError> {
        self.enter("start_processing").await?;
        Ok(RunId(format!("run-{}", self.next_id())))
    }

    async fn get_status(
        &self,
        run: &RunId,
        shape: StatusShape,
    ) -> Result<serde_json::Value, ServiceError> {
        self.enter("get_status").await?;
        if let Some(doc) = self.statuses.lock().get_mut(&shape).and_then(|q| q.pop_front()) {
            return Ok(doc);
        }
        Ok(match shape {
            StatusShape::Flat => flat_status("success"),
            StatusShape::BlockTree => {
                let block_run = format!("block-{run}");
                block_status("success", &[("1", "success", Some(block_run.as_str()))])
            }
        })
    }

    async fn query_row_count(&self, table: &TableRef) -> Result<u64, ServiceError> {
        self.enter("query_row_count").await?;
        if let Some(rows) = *self.row_count_override.lock() {
            return Ok(rows);
        }
        let bytes = self.uploaded_bytes(&table.table);
        let mut lines = bytes.iter().filter(|b| **b == b'\n').count() as u64;
        if bytes.last().is_some_and(|b| *b != b'\n') {
            lines += 1;
        }
        Ok(lines.saturating_sub(1))
    }

    async fn get_secondary_params(&self, job: JobId) -> Result<SourceParams, ServiceError> {
        self.enter("get_secondary_params").await?;
        Ok(SourceParams {
            connection: format!("conn-{job}"),
            schema: "staging".into(),
        })
    }

    async fn create_secondary_job(&self, _spec: &SecondaryJobSpec) -> Result<JobId, ServiceError> {
        self.enter("create_secondary_job").await?;
        Ok(JobId(self.next_id()))
    }

    async fn start_secondary(&self, _job: JobId) -> Result<RunId, ServiceError> {
        self.enter("start_secondary").await?;
        Ok(RunId(format!("run-{}", self.next_id())))
    }

    async fn lookup_artifact(
        &self,
        query: &ArtifactQuery,
    ) -> Result<Option<String>, ServiceError> {
        self.enter("lookup_artifact").await?;
        if let Some(artifact) = self.artifact.lock().clone() {
            return Ok(artifact);
        }
        Ok(Some(format!(
            "https://bi.example/dashboards/{}/{}",
            query.job_id, query.block_run_id
        )))
    }

    async fn open_artifact(&self, reference: &str) -> Result<(), ServiceError> {
        self.enter("open_artifact").await?;
        self.opened.lock().push(reference.to_string());
        Ok(())
    }
}

/// Hands every actor the same mock
pub struct MockFactory(pub Arc<MockFlowService>);

impl FlowServiceFactory for MockFactory {
    fn session(&self, _actor: &ActorId) -> LoadResult<Arc<dyn FlowService>> {
        Ok(self.0.clone())
    }
}

/// Small CSV with a header and `rows` data lines
pub fn sample_csv(rows: usize) -> Vec<u8> {
    let mut data = b"id,region,amount\n".to_vec();
    for i in 0..rows {
        data.extend_from_slice(format!("{i},eu-{},{}.50\n", i % 4, i * 3).as_bytes());
    }
    data
}

/// Configuration with millisecond-scale delays
pub fn fast_config() -> LoadConfig {
    let mut config = LoadConfig::default();
    config.run.think_time_min_ms = 0;
    config.run.think_time_max_ms = 0;
    config.retry.base_delay_ms = 10;
    config.retry.max_delay_ms = 40;
    config.retry.request_timeout_secs = 5;
    config.upload.chunk_retry_delay_ms = 10;
    config.upload.poll_interval_secs = 1;
    config.upload.timeout_small_secs = 30;
    config.secondary.poll_interval_secs = 1;
    config.secondary.timeout_secs = 30;
    config.consumer.wait_timeout_secs = 5;
    config.users = vec![Credentials::new("analyst_one", "secret")];
    config
}

/// Run context reporting into an inspectable sink
pub fn metered_context(quota: u32) -> (RunContext, Arc<InMemoryMetrics>) {
    let metrics = Arc::new(InMemoryMetrics::new());
    let ctx = RunContext::new(
        "test-run",
        quota,
        metrics.clone(),
        RequestRateLimiter::unlimited(),
    );
    (ctx, metrics)
}

/// In-memory CSV source with `rows` data lines
pub fn csv_source(rows: usize, chunk_size: usize) -> Arc<dyn ChunkSource> {
    match LineChunkSource::from_bytes(sample_csv(rows), chunk_size) {
        Ok(source) => Arc::new(source),
        Err(e) => panic!("invalid test source: {e}"),
    }
}

/// Executor with fast retries bound to `ctx`
pub fn fast_executor(ctx: &RunContext) -> RequestExecutor {
    let config = fast_config();
    RequestExecutor::for_run(ctx, config.retry.policy(), config.retry.request_timeout())
}
