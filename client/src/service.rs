//! reqwest-backed implementation of the remote service contract

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::{multipart, Client, RequestBuilder, Response, StatusCode};
use serde_json::Value;

use flowload_core::poller::StatusShape;
use flowload_core::{
    ActorId, ArtifactQuery, Chunk, Credentials, DatabaseId, FlowService, FlowServiceFactory, JobId,
    LoadError, LoadResult, RunId, SecondaryJobSpec, ServiceError, SourceParams, TableRef,
    TargetParams, UploadTarget,
};

use crate::config::ClientConfig;
use crate::{parse, payload};

const JOBS_PATH: &str = "/etl/api/v1/flow/";
const DAG_PARAMS_PATH: &str = "/etl/api/v1/flow/dag_params/v2";
const DATABASES_PATH: &str = "/api/v1/database/";
const START_UPLOAD_PATH: &str = "/etl/api/v1/file/start_upload";
const UPLOAD_PATH: &str = "/etl/api/v1/file/upload";
const FINALIZE_PATH: &str = "/etl/api/v1/file/finalize";
const PROCESS_PATH: &str = "/etl/api/v1/file/start";
const FILE_STATUS_PATH: &str = "/etl/api/v1/file/status";
const FLOW_STATUS_PATH: &str = "/etl/api/v1/flow/status";
const SQL_PATH: &str = "/api/v1/sqllab/execute/";
const ARTIFACTS_PATH: &str = "/etl/api/v1/flowartefact/";
const LOGIN_PATH: &str = "/login/";

/// Longest response excerpt kept in an error
const ERROR_EXCERPT_LEN: usize = 200;

/// One HTTP session against the job service
///
/// Cookies set by the login call are kept in the client's cookie store, so
/// every actor needs its own instance.
#[derive(Debug, Clone)]
pub struct HttpFlowService {
    client: Client,
    config: Arc<ClientConfig>,
    /// Secondary blocks by job, replayed when the job is triggered
    secondary_blocks: Arc<Mutex<HashMap<JobId, Value>>>,
}

impl HttpFlowService {
    /// Create a session with its own cookie store
    pub fn new(config: Arc<ClientConfig>) -> Result<Self, ServiceError> {
        let client = Client::builder()
            .cookie_store(true)
            .connect_timeout(config.connect_timeout())
            .build()
            .map_err(|e| ServiceError::Transport(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            config,
            secondary_blocks: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Client configuration
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn get(&self, path: &str) -> RequestBuilder {
        self.client.get(self.config.url(path))
    }

    fn post(&self, path: &str) -> RequestBuilder {
        self.client.post(self.config.url(path))
    }

    /// Send and require a success status
    async fn send(&self, request: RequestBuilder) -> Result<Response, ServiceError> {
        let response = request.send().await.map_err(|e| self.map_transport(e))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let text = response.text().await.unwrap_or_default();
        Err(ServiceError::status(status.as_u16(), excerpt(&text, status)))
    }

    /// Send and decode a JSON body
    async fn send_json(&self, request: RequestBuilder) -> Result<Value, ServiceError> {
        self.send(request)
            .await?
            .json::<Value>()
            .await
            .map_err(|e| ServiceError::InvalidResponse(format!("body is not JSON: {e}")))
    }

    /// The executor owns the per-call window, so a client timeout is a connect timeout
    fn map_transport(&self, err: reqwest::Error) -> ServiceError {
        if err.is_timeout() {
            ServiceError::Timeout(self.config.connect_timeout())
        } else {
            ServiceError::Transport(err.to_string())
        }
    }

    /// Trigger body replaying the block cached when `job` was created
    fn trigger_body(&self, job: JobId) -> Value {
        let block = self.secondary_blocks.lock().get(&job).cloned();
        payload::trigger_secondary(block)
    }

    async fn dag_params(&self, process: &str, block: u32, job: JobId) -> Result<Value, ServiceError> {
        let url = format!(
            "{DAG_PARAMS_PATH}/{process}?q={}",
            payload::dag_params_query(block, job)
        );
        self.send_json(self.get(&url)).await
    }
}

fn excerpt(text: &str, status: StatusCode) -> String {
    let text = text.trim();
    if text.is_empty() {
        return status.canonical_reason().unwrap_or("no body").to_string();
    }
    text.chars().take(ERROR_EXCERPT_LEN).collect()
}

#[async_trait]
impl FlowService for HttpFlowService {
    async fn authenticate(&self, credentials: &Credentials) -> Result<(), ServiceError> {
        let form = [
            ("flowType", "byLogin"),
            ("username", credentials.username()),
            ("formattedUsername", credentials.username()),
            ("password", credentials.password()),
        ];
        match self.send(self.post(LOGIN_PATH).form(&form)).await {
            Ok(_) => Ok(()),
            Err(ServiceError::Status { status, message }) if status == 401 || status == 403 => {
                Err(ServiceError::Auth(message))
            }
            Err(e) => Err(e),
        }
    }

    async fn create_job(&self, label: &str) -> Result<JobId, ServiceError> {
        let body = payload::create_job(&self.config, label);
        let response = self.send_json(self.post(JOBS_PATH).json(&body)).await?;
        parse::extract_job_id(&response)
    }

    async fn get_job_params(&self, job: JobId) -> Result<TargetParams, ServiceError> {
        let body = self.dag_params(&self.config.loader_process, 0, job).await?;
        let (connection, schema) =
            parse::extract_param_pair(&body, "target_connection", "target_schema")?;
        Ok(TargetParams { connection, schema })
    }

    async fn update_job(
        &self,
        job: JobId,
        label: &str,
        target: &TargetParams,
    ) -> Result<(), ServiceError> {
        let body = payload::update_job(&self.config, job, label, target);
        let url = format!("{JOBS_PATH}{job}");
        self.send(self.client.put(self.config.url(&url)).json(&body))
            .await
            .map(drop)
    }

    async fn resolve_target_database(&self, username: &str) -> Result<DatabaseId, ServiceError> {
        let body = self.send_json(self.get(DATABASES_PATH)).await?;
        parse::match_database(&body, &self.config.database_prefix, username).ok_or_else(|| {
            ServiceError::InvalidResponse(format!("no database found for user {username}"))
        })
    }

    async fn start_upload(
        &self,
        target: &UploadTarget,
        total_chunks: usize,
    ) -> Result<(), ServiceError> {
        let body = payload::start_upload(&self.config, target, total_chunks);
        self.send(self.post(START_UPLOAD_PATH).json(&body))
            .await
            .map(drop)
    }

    async fn upload_chunk(
        &self,
        target: &UploadTarget,
        chunk: &Chunk,
        total_chunks: usize,
    ) -> Result<(), ServiceError> {
        let file = multipart::Part::bytes(chunk.content.clone())
            .file_name(format!("chunk_{}.csv", chunk.number))
            .mime_str("text/csv")
            .map_err(|e| ServiceError::Transport(e.to_string()))?;

        let mut form = multipart::Form::new();
        for (name, value) in payload::chunk_fields(&self.config, target, chunk.number, total_chunks) {
            form = form.text(name, value);
        }
        form = form.part("file", file);

        self.send(self.post(UPLOAD_PATH).multipart(form))
            .await
            .map(drop)
    }

    async fn finalize_upload(
        &self,
        target: &UploadTarget,
        uploaded_chunks: usize,
    ) -> Result<(), ServiceError> {
        let body = payload::finalize_upload(&self.config, target, uploaded_chunks);
        self.send(self.post(FINALIZE_PATH).json(&body)).await.map(drop)
    }

    async fn start_processing(&self, target: &UploadTarget) -> Result<RunId, ServiceError> {
        let body = payload::start_processing(&self.config, target);
        let response = self.send_json(self.post(PROCESS_PATH).json(&body)).await?;
        parse::extract_run_id(&response)
    }

    async fn get_status(&self, run: &RunId, shape: StatusShape) -> Result<Value, ServiceError> {
        let base = match shape {
            StatusShape::Flat => FILE_STATUS_PATH,
            StatusShape::BlockTree => FLOW_STATUS_PATH,
        };
        let url = format!("{base}/{}", urlencoding::encode(&run.0));
        self.send_json(self.get(&url)).await
    }

    async fn query_row_count(&self, table: &TableRef) -> Result<u64, ServiceError> {
        let body = payload::row_count_query(table);
        let response = self.send_json(self.post(SQL_PATH).json(&body)).await?;
        parse::extract_row_count(&response)
    }

    async fn get_secondary_params(&self, job: JobId) -> Result<SourceParams, ServiceError> {
        let body = self
            .dag_params(&self.config.secondary_process, 1, job)
            .await?;
        let (connection, schema) =
            parse::extract_param_pair(&body, "source_connection", "source_schema")?;
        Ok(SourceParams { connection, schema })
    }

    async fn create_secondary_job(&self, spec: &SecondaryJobSpec) -> Result<JobId, ServiceError> {
        let body = payload::create_secondary_job(&self.config, spec);
        let response = self.send_json(self.post(JOBS_PATH).json(&body)).await?;
        let job = parse::extract_job_id(&response)?;
        // Iterations run one at a time per session, so older entries belong
        // to jobs that were never triggered
        let mut blocks = self.secondary_blocks.lock();
        blocks.clear();
        blocks.insert(job, payload::secondary_block(&self.config, spec));
        Ok(job)
    }

    async fn start_secondary(&self, job: JobId) -> Result<RunId, ServiceError> {
        let body = self.trigger_body(job);
        let url = format!("{JOBS_PATH}{job}/trigger");
        let result = self
            .send_json(self.post(&url).json(&body))
            .await
            .and_then(|response| parse::extract_run_id(&response));

        // The block stays cached while the executor may still retry
        let settled = match &result {
            Ok(_) => true,
            Err(e) => !e.is_retryable(),
        };
        if settled {
            self.secondary_blocks.lock().remove(&job);
        }
        result
    }

    async fn lookup_artifact(
        &self,
        query: &ArtifactQuery,
    ) -> Result<Option<String>, ServiceError> {
        let url = format!("{ARTIFACTS_PATH}?q={}", payload::artifact_query(query));
        let body = self.send_json(self.get(&url)).await?;
        Ok(parse::extract_artifact_url(&body, &self.config.artifact_event))
    }

    async fn open_artifact(&self, reference: &str) -> Result<(), ServiceError> {
        self.send(self.get(reference)).await.map(drop)
    }
}

/// Opens one [`HttpFlowService`] per actor
#[derive(Debug, Clone)]
pub struct HttpServiceFactory {
    config: Arc<ClientConfig>,
}

impl HttpServiceFactory {
    /// Validate `config` and wrap it
    pub fn new(config: ClientConfig) -> LoadResult<Self> {
        config
            .validate()
            .map_err(|e| LoadError::config(e.to_string()))?;
        Ok(Self {
            config: Arc::new(config),
        })
    }
}

impl FlowServiceFactory for HttpServiceFactory {
    fn session(&self, actor: &ActorId) -> LoadResult<Arc<dyn FlowService>> {
        let service = HttpFlowService::new(Arc::clone(&self.config)).map_err(|e| {
            LoadError::config(format!("cannot open session for {actor}: {e}"))
        })?;
        tracing::debug!(actor = %actor, base_url = %self.config.base_url, "Opened HTTP session");
        Ok(Arc::new(service))
    }
}
