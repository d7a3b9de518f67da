//! Shared run-wide coordination state
//!
//! Two primitives are shared between concurrently running actors:
//!
//! - [`StopCoordinator`] tracks per-actor quotas and decides, exactly once,
//!   when the run is complete.
//! - [`ArtifactHandoffPool`] lets producers publish artifacts that consumers
//!   pick at random.
//!
//! Both guard their state with a single mutex and never hold it across an
//! await point.

mod pool;
mod stop;

pub use pool::{Artifact, ArtifactHandoffPool};
pub use stop::{ActorProgress, CompletionStats, QuotaProgress, StopCoordinator};
