//! flowload-core: Load generation engine for multi-stage data ingestion jobs
//!
//! This crate drives simulated users against a remote job service that
//! ingests delimited files, including:
//!
//! - The per-iteration job pipeline (create, configure, upload, process,
//!   validate, optional secondary job and artifact publication)
//! - Chunked uploads and status polling with unified retry
//! - Quota tracking and the producer to consumer artifact handoff
//! - Actors, workers and the run controller
//! - Metrics collection and the run summary
//! - Error handling and configuration

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod chunk;
pub mod config;
pub mod context;
pub mod controller;
pub mod coordination;
pub mod credentials;
pub mod error;
pub mod executor;
pub mod metrics;
pub mod model;
pub mod pipeline;
pub mod poller;
pub mod rate_limiter;
pub mod retry;
pub mod traits;
pub mod upload;
pub mod worker;

#[cfg(test)]
mod test_support;

pub use chunk::{summarize, Chunk, ChunkSource, ChunkStream, LineChunkSource, SourceSummary};
pub use config::{ConfigError, LoadConfig};
pub use context::RunContext;
pub use controller::{AggregatedStats, RunController, RunControllerBuilder};
pub use coordination::{Artifact, ArtifactHandoffPool, StopCoordinator};
pub use credentials::{CredentialPool, Credentials};
pub use error::*;
pub use executor::{CallFailure, RequestExecutor, RequestSpec};
pub use metrics::{InMemoryMetrics, MetricsSink, NoopMetrics, RunSummary};
pub use model::*;
pub use pipeline::{IterationRecord, JobOrchestrator, Stage, StageFailure, ValidationOutcome};
pub use poller::{PollStatus, StatusShape};
pub use rate_limiter::RequestRateLimiter;
pub use retry::RetryPolicy;
pub use traits::*;
pub use worker::{Worker, WorkerBuilder, WorkerStats};

#[cfg(test)]
mod integration_tests {
    use super::*;

    // =========================================================================
    // Report JSON format
    // =========================================================================

    fn failed_record() -> IterationRecord {
        let mut record = IterationRecord::begin(
            ActorId::new(ActorRole::Producer, 2),
            ActorRole::Producer,
            4,
            Stage::Create,
        );
        record.job_id = Some(JobId(981));
        record.stage_reached = Stage::UploadChunks;
        record.failure = Some(StageFailure::new(
            Stage::UploadChunks,
            ErrorKind::Shutdown,
            "run is stopping",
        ));
        record
    }

    #[test]
    fn test_record_json_format() {
        let json = serde_json::to_value(failed_record()).unwrap();

        assert_eq!(json["actor_id"], "producer-2");
        assert_eq!(json["role"], "producer");
        assert_eq!(json["job_id"], 981);
        assert_eq!(json["stage_reached"], "upload_chunks");
        assert_eq!(json["failure"]["stage"], "upload_chunks");
        assert_eq!(json["failure"]["kind"], "shutdown");
        assert_eq!(json["success"], false);
    }

    #[test]
    fn test_record_roundtrip() {
        let mut record = failed_record();
        record.validation = Some(ValidationOutcome::Mismatch {
            expected: 10,
            actual: 8,
        });
        let json = serde_json::to_string(&record).unwrap();
        let deserialized: IterationRecord = serde_json::from_str(&json).unwrap();

        assert_eq!(deserialized, record);
    }

    #[test]
    fn test_validation_outcome_tagged_format() {
        let json = serde_json::to_value(ValidationOutcome::QueryFailed {
            reason: "sqllab unavailable".into(),
        })
        .unwrap();
        assert_eq!(json["result"], "query_failed");
        assert_eq!(json["reason"], "sqllab unavailable");

        let json = serde_json::to_value(ValidationOutcome::Match { rows: 3 }).unwrap();
        assert_eq!(json["result"], "match");
        assert_eq!(json["rows"], 3);
    }

    #[test]
    fn test_stage_names_match_serialization() {
        for stage in [
            Stage::Create,
            Stage::ResolveTargetDb,
            Stage::ProcessPoll,
            Stage::SecondaryParams,
            Stage::ArtifactLookup,
            Stage::ArtifactOpen,
        ] {
            let json = serde_json::to_string(&stage).unwrap();
            assert_eq!(json, format!("\"{}\"", stage.as_str()));
        }
    }

    #[test]
    fn test_summary_from_records_serializes() {
        let summary = RunSummary::from_records(&[failed_record()], std::time::Duration::from_secs(2));
        let json = serde_json::to_value(&summary).unwrap();

        assert_eq!(json["producer_iterations"], 1);
        assert_eq!(json["failed"], 1);
        assert_eq!(json["failures_by_stage"]["upload_chunks"], 1);
    }
}
