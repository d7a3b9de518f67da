//! Run completion tracking

use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde::Serialize;

use crate::model::ActorId;

/// Result of recording one completed iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QuotaProgress {
    /// The actor has completed its quota (or was retired)
    pub actor_quota_reached: bool,
    /// Every actor has completed its quota
    pub global_quota_reached: bool,
    /// This call is the one that made the global quota reached
    pub stop_triggered: bool,
}

/// Per-actor view in a [`CompletionStats`] snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ActorProgress {
    /// Iterations recorded
    pub completed: u32,
    /// Iterations required
    pub quota: u32,
    /// Quota reached or actor retired
    pub finished: bool,
    /// Removed from the run before reaching its quota
    pub retired: bool,
}

/// Read-only snapshot of the coordinator
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct CompletionStats {
    /// Actors the run waits for
    pub total_actors: usize,
    /// Actors that finished
    pub completed_actors: usize,
    /// Iterations recorded across all actors
    pub total_iterations: u64,
    /// The global quota was reached
    pub stop_requested: bool,
    /// The stop action ran
    pub stop_acknowledged: bool,
    /// Per-actor progress
    pub actors: BTreeMap<ActorId, ActorProgress>,
}

#[derive(Debug, Default)]
struct CompletionState {
    total_actors: usize,
    completed_actors: usize,
    total_iterations: u64,
    stop_requested: bool,
    stop_acknowledged: bool,
    actors: BTreeMap<ActorId, ActorProgress>,
}

impl CompletionState {
    /// Count `actor` as finished; returns whether this call finished it
    fn finish(&mut self, actor: &ActorId) -> bool {
        let Some(progress) = self.actors.get_mut(actor) else {
            return false;
        };
        if progress.finished {
            return false;
        }
        progress.finished = true;
        if self.completed_actors < self.total_actors {
            self.completed_actors += 1;
        }
        true
    }

    fn progress(&mut self, actor_finished: bool) -> QuotaProgress {
        let global_quota_reached = self.completed_actors >= self.total_actors;
        let stop_triggered = global_quota_reached && !self.stop_requested;
        if stop_triggered {
            self.stop_requested = true;
        }
        QuotaProgress {
            actor_quota_reached: actor_finished,
            global_quota_reached,
            stop_triggered,
        }
    }
}

/// Decides when every actor has completed its quota
///
/// All mutation happens under one mutex, so concurrent completions are
/// serialized and the transition to "global quota reached" is observed by
/// exactly one caller (`stop_triggered`).
#[derive(Debug)]
pub struct StopCoordinator {
    default_quota: u32,
    state: Mutex<CompletionState>,
}

impl StopCoordinator {
    /// Create a coordinator; actors not registered explicitly get `default_quota`
    pub fn new(default_quota: u32) -> Self {
        Self {
            default_quota,
            state: Mutex::new(CompletionState::default()),
        }
    }

    /// Reset all per-run state and arm for `total_actors`
    pub fn setup(&self, total_actors: usize) {
        let mut state = self.state.lock();
        *state = CompletionState {
            total_actors,
            ..Default::default()
        };
        tracing::debug!(total_actors, quota = self.default_quota, "Stop coordinator armed");
    }

    /// Register an actor with its own quota
    pub fn register_actor(&self, actor: &ActorId, quota: u32) {
        self.state.lock().actors.insert(
            actor.clone(),
            ActorProgress {
                completed: 0,
                quota,
                finished: false,
                retired: false,
            },
        );
    }

    /// Record one finished iteration for `actor`
    pub fn record_iteration_complete(&self, actor: &ActorId) -> QuotaProgress {
        let mut state = self.state.lock();
        state.total_iterations += 1;

        let default_quota = self.default_quota;
        let progress = state.actors.entry(actor.clone()).or_insert(ActorProgress {
            completed: 0,
            quota: default_quota,
            finished: false,
            retired: false,
        });
        progress.completed += 1;
        let already_finished = progress.finished;
        let reached = progress.completed >= progress.quota;

        if reached && !already_finished {
            state.finish(actor);
        }
        state.progress(reached || already_finished)
    }

    /// Remove `actor` from the run; it counts as finished so the run can end
    pub fn retire_actor(&self, actor: &ActorId) -> QuotaProgress {
        let mut state = self.state.lock();
        let default_quota = self.default_quota;
        let progress = state.actors.entry(actor.clone()).or_insert(ActorProgress {
            completed: 0,
            quota: default_quota,
            finished: false,
            retired: false,
        });
        if !progress.finished {
            progress.retired = true;
        }
        state.finish(actor);
        state.progress(true)
    }

    /// Whether `actor` has no iterations left
    pub fn is_actor_finished(&self, actor: &ActorId) -> bool {
        self.state
            .lock()
            .actors
            .get(actor)
            .is_some_and(|p| p.finished)
    }

    /// Global quota reached and nobody has acted on it yet
    pub fn should_stop(&self) -> bool {
        let state = self.state.lock();
        state.stop_requested && !state.stop_acknowledged
    }

    /// Mark the stop as handled; returns `true` only for the first caller
    pub fn acknowledge_stop(&self) -> bool {
        let mut state = self.state.lock();
        if state.stop_acknowledged {
            return false;
        }
        state.stop_acknowledged = true;
        true
    }

    /// Snapshot
    pub fn stats(&self) -> CompletionStats {
        let state = self.state.lock();
        CompletionStats {
            total_actors: state.total_actors,
            completed_actors: state.completed_actors,
            total_iterations: state.total_iterations,
            stop_requested: state.stop_requested,
            stop_acknowledged: state.stop_acknowledged,
            actors: state.actors.clone(),
        }
    }
}
