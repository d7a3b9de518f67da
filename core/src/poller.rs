//! Status polling state machine
//!
//! [`StatusPoller::poll`] repeatedly fetches a run's status until it reaches
//! a terminal state, the wait window closes, or the run stops. The caller
//! states which document shape to expect; nothing is inferred from ids.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::executor::{RequestExecutor, RequestSpec};
use crate::model::RunId;
use crate::traits::FlowService;

/// Layout of a status document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusShape {
    /// `{"result": {"status", "blocks": [{"block_id", "status", "block_run_id"}]}}`
    BlockTree,
    /// `{"status", "error"}`
    Flat,
}

impl StatusShape {
    fn request_label(&self) -> &'static str {
        match self {
            StatusShape::BlockTree => "job_status",
            StatusShape::Flat => "processing_status",
        }
    }
}

/// Status of a run or sub-task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollStatus {
    /// Accepted, not started
    Pending,
    /// In progress
    Running,
    /// Finished successfully
    Success,
    /// Finished with an error
    Failed,
    /// Value not understood; treated as in progress
    Unknown,
    /// Wait window closed before a terminal state
    Timeout,
}

impl PollStatus {
    /// Map a remote status string
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pending" | "queued" | "scheduled" => PollStatus::Pending,
            "running" => PollStatus::Running,
            "success" => PollStatus::Success,
            "failed" => PollStatus::Failed,
            _ => PollStatus::Unknown,
        }
    }

    /// Success, failed or timeout
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PollStatus::Success | PollStatus::Failed | PollStatus::Timeout
        )
    }
}

/// One sub-task of a block-tree status
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubTask {
    /// Sub-task name
    pub name: String,
    /// Parsed status
    pub status: PollStatus,
    /// Remote run id of the sub-task
    pub run_id: Option<String>,
}

/// One parsed status document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    /// Overall status
    pub status: PollStatus,
    /// Status string as received
    pub raw_status: String,
    /// Sub-tasks (block-tree shape only)
    pub sub_tasks: Vec<SubTask>,
    /// Error text reported by the service
    pub error: Option<String>,
}

#[derive(Deserialize)]
struct BlockTreeDoc {
    result: BlockTreeResult,
}

#[derive(Deserialize)]
struct BlockTreeResult {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    blocks: Vec<BlockDoc>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct BlockDoc {
    #[serde(default)]
    block_id: serde_json::Value,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    block_run_id: Option<String>,
}

#[derive(Deserialize)]
struct FlatDoc {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Parse a status document of the given shape
pub fn parse_status(shape: StatusShape, body: &serde_json::Value) -> Result<StatusReport, String> {
    match shape {
        StatusShape::BlockTree => {
            let doc: BlockTreeDoc =
                serde_json::from_value(body.clone()).map_err(|e| e.to_string())?;
            let raw_status = doc.result.status.unwrap_or_default();
            let sub_tasks = doc
                .result
                .blocks
                .into_iter()
                .map(|block| SubTask {
                    name: match block.block_id {
                        serde_json::Value::String(s) => s,
                        other => other.to_string(),
                    },
                    status: PollStatus::parse(block.status.as_deref().unwrap_or_default()),
                    run_id: block.block_run_id,
                })
                .collect();
            Ok(StatusReport {
                status: PollStatus::parse(&raw_status),
                raw_status,
                sub_tasks,
                error: doc.result.error,
            })
        }
        StatusShape::Flat => {
            let doc: FlatDoc = serde_json::from_value(body.clone()).map_err(|e| e.to_string())?;
            let raw_status = doc.status.unwrap_or_default();
            Ok(StatusReport {
                status: PollStatus::parse(&raw_status),
                raw_status,
                sub_tasks: Vec::new(),
                error: doc.error.filter(|e| !e.is_empty()),
            })
        }
    }
}

/// Terminal outcome of [`StatusPoller::poll`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollResult {
    /// Success, failed or timeout
    pub status: PollStatus,
    /// Sub-task name to sub-task run id, collected across polls
    pub sub_tasks: BTreeMap<String, String>,
    /// Names of sub-tasks that failed
    pub failed_sub_tasks: Vec<String>,
    /// Error detail
    pub error: Option<String>,
    /// Status requests issued
    pub polls: u32,
    /// Time spent polling
    pub elapsed: Duration,
    /// The run stopped while polling
    pub stopped: bool,
}

impl PollResult {
    /// Terminal success
    pub fn is_success(&self) -> bool {
        self.status == PollStatus::Success
    }
}

/// Polls run status through the executor
#[derive(Clone)]
pub struct StatusPoller {
    service: Arc<dyn FlowService>,
    executor: RequestExecutor,
    stop: CancellationToken,
}

impl StatusPoller {
    /// Progress is logged every this many polls
    const PROGRESS_LOG_EVERY: u32 = 5;
    /// Sub-task breakdown and unknown statuses are logged every this many polls
    const DETAIL_LOG_EVERY: u32 = 10;

    /// Create a poller
    pub fn new(
        service: Arc<dyn FlowService>,
        executor: RequestExecutor,
        stop: CancellationToken,
    ) -> Self {
        Self {
            service,
            executor,
            stop,
        }
    }

    /// Poll `run` until a terminal state, timeout, or stop
    ///
    /// A poll is only issued while `elapsed + interval <= max_wait`.
    pub async fn poll(
        &self,
        run: &RunId,
        shape: StatusShape,
        interval: Duration,
        max_wait: Duration,
    ) -> PollResult {
        let started = Instant::now();
        let spec = RequestSpec::get(shape.request_label());
        let mut sub_tasks = BTreeMap::new();
        let mut polls = 0u32;

        let finish = |status: PollStatus,
                      sub_tasks: BTreeMap<String, String>,
                      failed_sub_tasks: Vec<String>,
                      error: Option<String>,
                      polls: u32,
                      stopped: bool| PollResult {
            status,
            sub_tasks,
            failed_sub_tasks,
            error,
            polls,
            elapsed: started.elapsed(),
            stopped,
        };

        loop {
            if self.stop.is_cancelled() {
                return finish(
                    PollStatus::Failed,
                    sub_tasks,
                    Vec::new(),
                    Some("run stopped".into()),
                    polls,
                    true,
                );
            }
            if started.elapsed() + interval > max_wait {
                tracing::warn!(run_id = %run, polls, max_wait_secs = max_wait.as_secs_f64(), "Status polling timed out");
                return finish(
                    PollStatus::Timeout,
                    sub_tasks,
                    Vec::new(),
                    Some(format!("no terminal status within {max_wait:?}")),
                    polls,
                    false,
                );
            }

            polls += 1;
            let service = &self.service;
            match self
                .executor
                .execute(&spec, || service.get_status(run, shape))
                .await
            {
                Ok(body) => match parse_status(shape, &body) {
                    Ok(report) => {
                        for task in &report.sub_tasks {
                            if let Some(run_id) = &task.run_id {
                                sub_tasks.insert(task.name.clone(), run_id.clone());
                            }
                        }
                        match report.status {
                            PollStatus::Success => {
                                tracing::info!(run_id = %run, polls, "Run succeeded");
                                return finish(
                                    PollStatus::Success,
                                    sub_tasks,
                                    Vec::new(),
                                    None,
                                    polls,
                                    false,
                                );
                            }
                            PollStatus::Failed => {
                                let failed: Vec<String> = report
                                    .sub_tasks
                                    .iter()
                                    .filter(|t| t.status == PollStatus::Failed)
                                    .map(|t| t.name.clone())
                                    .collect();
                                let error = report.error.clone().unwrap_or_else(|| {
                                    if failed.is_empty() {
                                        "run reported failure".to_string()
                                    } else {
                                        format!("failed sub-tasks: {}", failed.join(", "))
                                    }
                                });
                                tracing::warn!(run_id = %run, polls, error = %error, "Run failed");
                                return finish(
                                    PollStatus::Failed,
                                    sub_tasks,
                                    failed,
                                    Some(error),
                                    polls,
                                    false,
                                );
                            }
                            PollStatus::Unknown => {
                                if polls % Self::DETAIL_LOG_EVERY == 1 {
                                    tracing::warn!(run_id = %run, polls, status = %report.raw_status, "Unrecognized run status");
                                }
                            }
                            _ => {
                                if polls % Self::PROGRESS_LOG_EVERY == 0 {
                                    tracing::info!(
                                        run_id = %run,
                                        polls,
                                        status = ?report.status,
                                        elapsed_secs = started.elapsed().as_secs(),
                                        "Run in progress"
                                    );
                                }
                            }
                        }
                        if !report.sub_tasks.is_empty() && polls % Self::DETAIL_LOG_EVERY == 0 {
                            let breakdown: Vec<String> = report
                                .sub_tasks
                                .iter()
                                .map(|t| format!("{}={:?}", t.name, t.status))
                                .collect();
                            tracing::debug!(run_id = %run, polls, sub_tasks = %breakdown.join(" "), "Sub-task status");
                        }
                    }
                    Err(reason) => {
                        if polls % Self::PROGRESS_LOG_EVERY == 1 {
                            tracing::warn!(run_id = %run, polls, error = %reason, "Unparseable status document");
                        }
                    }
                },
                Err(failure) if failure.is_stopped() => continue,
                Err(failure) => {
                    if polls % Self::PROGRESS_LOG_EVERY == 1 {
                        tracing::warn!(run_id = %run, polls, error = %failure, "Status request failed");
                    }
                }
            }

            tokio::select! {
                _ = self.stop.cancelled() => {}
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }
}

impl std::fmt::Debug for StatusPoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusPoller")
            .field("executor", &self.executor)
            .finish()
    }
}
