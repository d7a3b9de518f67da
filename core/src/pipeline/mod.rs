//! Job pipeline
//!
//! One [`JobOrchestrator`] per producer actor drives a remote job through
//! every [`Stage`] in order:
//!
//! ```text
//! CREATE → FETCH_PARAMS → CONFIGURE → RESOLVE_TARGET_DB → UPLOAD_START
//!   → UPLOAD_CHUNKS → UPLOAD_FINALIZE → PROCESS_START → PROCESS_POLL → VALIDATE
//!   → [SECONDARY_PARAMS → SECONDARY_CREATE → SECONDARY_START → SECONDARY_POLL
//!      → ARTIFACT_LOOKUP → ARTIFACT_OPEN] → DONE
//! ```
//!
//! A stage failure ends the iteration and is reported as a [`StageFailure`]
//! inside the [`IterationRecord`]; it never escapes as an error.

mod job;
mod record;

pub use job::{Job, JobOrchestrator};
pub use record::{IterationRecord, Stage, StageFailure, StageTiming, ValidationOutcome};
