//! Iteration outcome types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::executor::CallFailure;
use crate::model::{ActorId, ActorRole, JobId};

/// Pipeline stages in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Create the remote job
    Create,
    /// Read the job's target parameters
    FetchParams,
    /// Push the job configuration
    Configure,
    /// Find the database for the actor's user
    ResolveTargetDb,
    /// Announce the upload
    UploadStart,
    /// Transfer chunks
    UploadChunks,
    /// Close the upload
    UploadFinalize,
    /// Trigger processing
    ProcessStart,
    /// Wait for processing
    ProcessPoll,
    /// Compare row counts
    Validate,
    /// Read the secondary job's source parameters
    SecondaryParams,
    /// Create the secondary job
    SecondaryCreate,
    /// Trigger the secondary job
    SecondaryStart,
    /// Wait for the secondary job
    SecondaryPoll,
    /// Resolve the produced artifact
    ArtifactLookup,
    /// Open the artifact
    ArtifactOpen,
    /// Iteration finished
    Done,
}

impl Stage {
    /// Snake-case name used in logs, metrics and reports
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Create => "create",
            Stage::FetchParams => "fetch_params",
            Stage::Configure => "configure",
            Stage::ResolveTargetDb => "resolve_target_db",
            Stage::UploadStart => "upload_start",
            Stage::UploadChunks => "upload_chunks",
            Stage::UploadFinalize => "upload_finalize",
            Stage::ProcessStart => "process_start",
            Stage::ProcessPoll => "process_poll",
            Stage::Validate => "validate",
            Stage::SecondaryParams => "secondary_params",
            Stage::SecondaryCreate => "secondary_create",
            Stage::SecondaryStart => "secondary_start",
            Stage::SecondaryPoll => "secondary_poll",
            Stage::ArtifactLookup => "artifact_lookup",
            Stage::ArtifactOpen => "artifact_open",
            Stage::Done => "done",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an iteration aborted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{stage} failed ({kind:?}): {message}")]
pub struct StageFailure {
    /// Stage that failed
    pub stage: Stage,
    /// Classification
    pub kind: ErrorKind,
    /// Detail
    pub message: String,
}

impl StageFailure {
    /// Create a failure
    pub fn new(stage: Stage, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            stage,
            kind,
            message: message.into(),
        }
    }

    /// Failure caused by an executor call
    pub fn from_call(stage: Stage, failure: CallFailure) -> Self {
        Self::new(stage, failure.kind(), failure.to_string())
    }
}

/// Duration of one stage
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StageTiming {
    /// Stage
    pub stage: Stage,
    /// Wall time in milliseconds
    pub duration_ms: f64,
    /// Whether the stage succeeded
    pub ok: bool,
}

/// Row count comparison
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ValidationOutcome {
    /// Counts agree
    Match {
        /// Rows found
        rows: u64,
    },
    /// Counts disagree
    Mismatch {
        /// Rows in the input
        expected: u64,
        /// Rows found
        actual: u64,
    },
    /// Count query did not succeed
    QueryFailed {
        /// Why
        reason: String,
    },
}

impl ValidationOutcome {
    /// Compare a counted value against the expected one
    pub fn compare(expected: u64, actual: u64) -> Self {
        if expected == actual {
            ValidationOutcome::Match { rows: actual }
        } else {
            ValidationOutcome::Mismatch { expected, actual }
        }
    }

    /// Counts agree
    pub fn is_match(&self) -> bool {
        matches!(self, ValidationOutcome::Match { .. })
    }
}

/// Structured result of one iteration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    /// Actor
    pub actor_id: ActorId,
    /// Actor class
    pub role: ActorRole,
    /// 0-based iteration index
    pub iteration: u32,
    /// Remote job, once created
    pub job_id: Option<JobId>,
    /// Reached DONE
    pub success: bool,
    /// Last stage entered
    pub stage_reached: Stage,
    /// Cause of an abort
    pub failure: Option<StageFailure>,
    /// Timings of every stage entered
    pub stages: Vec<StageTiming>,
    /// Chunks confirmed
    pub uploaded_chunks: usize,
    /// Chunks announced
    pub total_chunks: usize,
    /// Row count comparison
    pub validation: Option<ValidationOutcome>,
    /// Artifact reference published or opened
    pub artifact: Option<String>,
    /// Start time
    pub started_at: DateTime<Utc>,
    /// Total wall time in milliseconds
    pub duration_ms: f64,
}

impl IterationRecord {
    /// Empty record for an iteration starting now
    pub fn begin(actor_id: ActorId, role: ActorRole, iteration: u32, first: Stage) -> Self {
        Self {
            actor_id,
            role,
            iteration,
            job_id: None,
            success: false,
            stage_reached: first,
            failure: None,
            stages: Vec::new(),
            uploaded_chunks: 0,
            total_chunks: 0,
            validation: None,
            artifact: None,
            started_at: Utc::now(),
            duration_ms: 0.0,
        }
    }

    /// Classification of the abort, if any
    pub fn failure_kind(&self) -> Option<ErrorKind> {
        self.failure.as_ref().map(|f| f.kind)
    }

    /// `success` or `failure`, for metric labels
    pub fn outcome_label(&self) -> &'static str {
        if self.success {
            "success"
        } else {
            "failure"
        }
    }
}
