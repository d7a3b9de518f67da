//! Producer to consumer artifact handoff

use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::seq::IndexedRandom;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::model::ActorId;

/// A result reference published by a producer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// Where the artifact can be opened (typically a URL)
    pub reference: String,
    /// Producing actor
    pub producer: ActorId,
    /// Publish time
    pub published_at: DateTime<Utc>,
}

impl Artifact {
    /// Artifact published now
    pub fn new(reference: impl Into<String>, producer: ActorId) -> Self {
        Self {
            reference: reference.into(),
            producer,
            published_at: Utc::now(),
        }
    }
}

/// Append-only pool of artifacts
///
/// The artifact count is mirrored into a `watch` channel so waiting
/// consumers are woken by [`publish`](Self::publish) instead of polling.
#[derive(Debug)]
pub struct ArtifactHandoffPool {
    artifacts: Mutex<Vec<Artifact>>,
    count_tx: watch::Sender<usize>,
    stop: Option<CancellationToken>,
}

impl ArtifactHandoffPool {
    /// Create an empty pool
    pub fn new() -> Self {
        let (count_tx, _) = watch::channel(0);
        Self {
            artifacts: Mutex::new(Vec::new()),
            count_tx,
            stop: None,
        }
    }

    /// Make waits return early once `stop` is cancelled
    pub fn with_cancellation(mut self, stop: CancellationToken) -> Self {
        self.stop = Some(stop);
        self
    }

    /// Append an artifact and wake waiters
    pub fn publish(&self, artifact: Artifact) {
        let mut artifacts = self.artifacts.lock();
        tracing::debug!(
            producer = %artifact.producer,
            reference = %artifact.reference,
            "Artifact published"
        );
        artifacts.push(artifact);
        // Updated under the lock so watchers never see the count go backwards
        self.count_tx.send_replace(artifacts.len());
    }

    /// A uniformly random artifact, or `None` while the pool is empty
    pub fn try_get_random(&self) -> Option<Artifact> {
        self.artifacts.lock().choose(&mut rand::rng()).cloned()
    }

    /// Wait until at least one artifact exists
    ///
    /// Returns `true` immediately when the pool is non-empty, `false` when
    /// `timeout` elapsed or the run stopped first.
    pub async fn wait_for_any(&self, timeout: Duration) -> bool {
        if self.count() > 0 {
            return true;
        }

        let mut rx = self.count_tx.subscribe();
        let ready = async { rx.wait_for(|count| *count > 0).await.is_ok() };
        let timed = async { tokio::time::timeout(timeout, ready).await.unwrap_or(false) };

        match &self.stop {
            Some(stop) => tokio::select! {
                ready = timed => ready,
                _ = stop.cancelled() => self.count() > 0,
            },
            None => timed.await,
        }
    }

    /// Number of published artifacts
    pub fn count(&self) -> usize {
        self.artifacts.lock().len()
    }

    /// Copy of every artifact
    pub fn snapshot(&self) -> Vec<Artifact> {
        self.artifacts.lock().clone()
    }
}

impl Default for ArtifactHandoffPool {
    fn default() -> Self {
        Self::new()
    }
}
