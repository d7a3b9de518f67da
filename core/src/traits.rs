//! Remote service contract
//!
//! The engine only talks to the outside world through [`FlowService`].
//! The HTTP implementation lives in the `flowload-client` crate; tests use
//! scripted in-memory implementations.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::chunk::Chunk;
use crate::credentials::Credentials;
use crate::error::{ErrorKind, LoadResult};
use crate::model::{
    ActorId, ArtifactQuery, DatabaseId, JobId, RunId, SecondaryJobSpec, SourceParams, TableRef,
    TargetParams, UploadTarget,
};
use crate::poller::StatusShape;

// ============================================================================
// Service Trait
// ============================================================================

/// One authenticated session against the remote job service
///
/// Every method performs exactly one remote call. Retrying, timeouts and
/// metrics are applied by the caller through `RequestExecutor`.
#[async_trait]
pub trait FlowService: Send + Sync {
    /// Log in; session state (cookies, tokens) is kept by the implementation
    async fn authenticate(&self, credentials: &Credentials) -> Result<(), ServiceError>;

    /// Create a job with the given label
    async fn create_job(&self, label: &str) -> Result<JobId, ServiceError>;

    /// Read the target connection and schema assigned to a job
    async fn get_job_params(&self, job: JobId) -> Result<TargetParams, ServiceError>;

    /// Push the job configuration
    async fn update_job(
        &self,
        job: JobId,
        label: &str,
        target: &TargetParams,
    ) -> Result<(), ServiceError>;

    /// Find the database that belongs to `username`
    async fn resolve_target_database(&self, username: &str) -> Result<DatabaseId, ServiceError>;

    /// Announce an upload of `total_chunks` chunks
    async fn start_upload(
        &self,
        target: &UploadTarget,
        total_chunks: usize,
    ) -> Result<(), ServiceError>;

    /// Transfer one chunk
    async fn upload_chunk(
        &self,
        target: &UploadTarget,
        chunk: &Chunk,
        total_chunks: usize,
    ) -> Result<(), ServiceError>;

    /// Close the upload session
    async fn finalize_upload(
        &self,
        target: &UploadTarget,
        uploaded_chunks: usize,
    ) -> Result<(), ServiceError>;

    /// Kick off processing of the uploaded data
    async fn start_processing(&self, target: &UploadTarget) -> Result<RunId, ServiceError>;

    /// Fetch the raw status document of a run
    async fn get_status(
        &self,
        run: &RunId,
        shape: StatusShape,
    ) -> Result<serde_json::Value, ServiceError>;

    /// Count rows in a table
    async fn query_row_count(&self, table: &TableRef) -> Result<u64, ServiceError>;

    /// Read the source parameters of the secondary job derived from `job`
    async fn get_secondary_params(&self, job: JobId) -> Result<SourceParams, ServiceError>;

    /// Create the secondary job
    async fn create_secondary_job(&self, spec: &SecondaryJobSpec) -> Result<JobId, ServiceError>;

    /// Trigger the secondary job
    async fn start_secondary(&self, job: JobId) -> Result<RunId, ServiceError>;

    /// Resolve the artifact a secondary run produced, if any
    async fn lookup_artifact(&self, query: &ArtifactQuery)
        -> Result<Option<String>, ServiceError>;

    /// Open a published artifact
    async fn open_artifact(&self, reference: &str) -> Result<(), ServiceError>;
}

/// Creates one service session per actor
pub trait FlowServiceFactory: Send + Sync {
    /// Open a fresh session for `actor`
    fn session(&self, actor: &ActorId) -> LoadResult<Arc<dyn FlowService>>;
}

// ============================================================================
// Service Errors
// ============================================================================

/// Fault returned by a single remote call
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ServiceError {
    /// Connection-level failure
    #[error("transport error: {0}")]
    Transport(String),

    /// Non-success HTTP status
    #[error("HTTP {status}: {message}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Response excerpt
        message: String,
    },

    /// The call did not complete within its window
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// Credentials refused
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Body could not be interpreted
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl ServiceError {
    /// Shorthand for a status error
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        ServiceError::Status {
            status,
            message: message.into(),
        }
    }

    /// Server errors and transport faults are worth another attempt
    pub fn is_retryable(&self) -> bool {
        match self {
            ServiceError::Transport(_) | ServiceError::Timeout(_) => true,
            ServiceError::Status { status, .. } => *status >= 500,
            ServiceError::Auth(_) | ServiceError::InvalidResponse(_) => false,
        }
    }

    /// Value of the `status` metrics label
    pub fn status_label(&self) -> String {
        match self {
            ServiceError::Status { status, .. } => status.to_string(),
            ServiceError::Transport(_) => "transport_error".to_string(),
            ServiceError::Timeout(_) => "timeout".to_string(),
            ServiceError::Auth(_) => "auth_error".to_string(),
            ServiceError::InvalidResponse(_) => "invalid_response".to_string(),
        }
    }

    /// Convert to ErrorKind for iteration records
    pub fn to_error_kind(&self) -> ErrorKind {
        match self {
            ServiceError::Transport(_) => ErrorKind::Transport,
            ServiceError::Status { status, .. } if *status >= 500 => ErrorKind::Server,
            ServiceError::Status { .. } => ErrorKind::Client,
            ServiceError::Timeout(_) => ErrorKind::Timeout,
            ServiceError::Auth(_) => ErrorKind::Authentication,
            ServiceError::InvalidResponse(_) => ErrorKind::InvalidResponse,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_error_retryable() {
        assert!(ServiceError::Transport("reset".into()).is_retryable());
        assert!(ServiceError::Timeout(Duration::from_secs(30)).is_retryable());
        assert!(ServiceError::status(500, "boom").is_retryable());
        assert!(ServiceError::status(503, "busy").is_retryable());

        assert!(!ServiceError::status(404, "missing").is_retryable());
        assert!(!ServiceError::status(400, "bad").is_retryable());
        assert!(!ServiceError::Auth("denied".into()).is_retryable());
        assert!(!ServiceError::InvalidResponse("no id".into()).is_retryable());
    }

    #[test]
    fn test_service_error_to_error_kind() {
        assert_eq!(
            ServiceError::status(502, "").to_error_kind(),
            ErrorKind::Server
        );
        assert_eq!(
            ServiceError::status(409, "").to_error_kind(),
            ErrorKind::Client
        );
        assert_eq!(
            ServiceError::Auth("x".into()).to_error_kind(),
            ErrorKind::Authentication
        );
        assert_eq!(
            ServiceError::Timeout(Duration::from_secs(1)).to_error_kind(),
            ErrorKind::Timeout
        );
    }

    #[test]
    fn test_status_label() {
        assert_eq!(ServiceError::status(404, "").status_label(), "404");
        assert_eq!(
            ServiceError::Transport("x".into()).status_label(),
            "transport_error"
        );
    }

    #[test]
    fn test_error_display() {
        let err = ServiceError::status(500, "Internal Server Error");
        assert_eq!(err.to_string(), "HTTP 500: Internal Server Error");
    }
}
