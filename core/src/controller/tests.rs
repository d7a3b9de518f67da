//! Tests for the RunController module

use super::aggregator::{aggregate_worker_stats, AggregatedStats};
use super::builder::RunControllerBuilder;
use crate::config::LoadConfig;
use crate::error::{ErrorKind, LoadError, LoadResult};
use crate::metrics::{names, InMemoryMetrics};
use crate::model::{ActorId, ActorRole};
use crate::pipeline::IterationRecord;
use crate::test_support::{csv_source, fast_config, MockFactory, MockFlowService};
use crate::traits::{FlowService, FlowServiceFactory, ServiceError};
use crate::worker::WorkerStats;

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

// ============================================================================
// Helpers
// ============================================================================

fn collect(mut rx: mpsc::Receiver<IterationRecord>) -> tokio::task::JoinHandle<Vec<IterationRecord>> {
    tokio::spawn(async move {
        let mut records = Vec::new();
        while let Some(record) = rx.recv().await {
            records.push(record);
        }
        records
    })
}

fn builder(config: LoadConfig, service: &Arc<MockFlowService>) -> RunControllerBuilder {
    RunControllerBuilder::new()
        .config(config)
        .factory(Arc::new(MockFactory(service.clone())))
        .source(csv_source(12, 64))
        .run_id("test-run")
}

/// Refuses to open sessions for consumers
struct ProducersOnlyFactory(Arc<MockFlowService>);

impl FlowServiceFactory for ProducersOnlyFactory {
    fn session(&self, actor: &ActorId) -> LoadResult<Arc<dyn FlowService>> {
        if actor.as_str().starts_with("consumer") {
            return Err(LoadError::config("no consumer sessions"));
        }
        Ok(self.0.clone())
    }
}

// ============================================================================
// Aggregation
// ============================================================================

#[test]
fn test_aggregated_stats_default() {
    let stats = AggregatedStats::default();
    assert_eq!(stats.total_workers, 0);
    assert_eq!(stats.total_iterations(), 0);
    assert_eq!(stats.success_rate(), 0.0);
}

#[test]
fn test_aggregated_stats_success_rate() {
    let stats = AggregatedStats {
        completed: 9,
        failed: 1,
        ..Default::default()
    };
    assert_eq!(stats.total_iterations(), 10);
    assert!((stats.success_rate() - 0.9).abs() < 1e-9);
}

#[test]
fn test_aggregate_worker_stats_empty() {
    let stats = aggregate_worker_stats(&[]);
    assert_eq!(stats.total_workers, 0);
    assert_eq!(stats.total_duration, Duration::ZERO);
}

#[test]
fn test_aggregate_worker_stats() {
    let start = Instant::now();

    let mut s1 = WorkerStats::new();
    s1.completed = 4;
    s1.validation_mismatches = 1;
    s1.started_at = Some(start);
    s1.ended_at = Some(start + Duration::from_secs(2));

    let mut s2 = WorkerStats::new();
    s2.completed = 2;
    s2.failed = 2;
    s2.retired = 1;
    s2.discarded = 1;
    s2.started_at = Some(start);
    s2.ended_at = Some(start + Duration::from_secs(4));

    let stats = aggregate_worker_stats(&[s1, s2]);
    assert_eq!(stats.total_workers, 2);
    assert_eq!(stats.completed, 6);
    assert_eq!(stats.failed, 2);
    assert_eq!(stats.validation_mismatches, 1);
    assert_eq!(stats.retired, 1);
    assert_eq!(stats.discarded, 1);
    assert_eq!(stats.total_duration, Duration::from_secs(4));
    assert!((stats.iterations_per_second - 2.0).abs() < 1e-9);
}

// ============================================================================
// Builder
// ============================================================================

#[test]
fn test_builder_missing_factory() {
    let result = RunControllerBuilder::new()
        .config(fast_config())
        .source(csv_source(3, 64))
        .build();

    let err = result.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Config);
    assert!(err.message.contains("factory"));
}

#[test]
fn test_builder_missing_source() {
    let service = Arc::new(MockFlowService::new());
    let result = RunControllerBuilder::new()
        .config(fast_config())
        .factory(Arc::new(MockFactory(service)))
        .build();

    assert!(result.unwrap_err().message.contains("source"));
}

#[test]
fn test_builder_invalid_config() {
    let service = Arc::new(MockFlowService::new());
    let mut config = fast_config();
    config.users.clear();

    let result = builder(config, &service).build();
    assert_eq!(result.unwrap_err().kind, ErrorKind::Config);
}

#[test]
fn test_builder_generates_run_id() {
    let service = Arc::new(MockFlowService::new());
    let (controller, _rx) = RunControllerBuilder::new()
        .config(fast_config())
        .factory(Arc::new(MockFactory(service)))
        .source(csv_source(3, 64))
        .build()
        .unwrap();

    assert!(controller.context().run_id.starts_with("run-"));
    assert_eq!(controller.config().run.producers, 1);
}

// ============================================================================
// Runs
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_run_completes_every_producer_quota() {
    let service = Arc::new(MockFlowService::new());
    let metrics = Arc::new(InMemoryMetrics::new());
    let config = fast_config().with_producers(2).with_iterations(2);

    let (controller, rx) = builder(config, &service)
        .metrics(metrics.clone())
        .build()
        .unwrap();
    let ctx = controller.context().clone();
    let collector = collect(rx);

    let stats = controller.run().await.expect("run failed");
    let records = collector.await.unwrap();

    assert_eq!(stats.total_workers, 2);
    assert_eq!(stats.completed, 4);
    assert_eq!(stats.failed, 0);
    assert_eq!(records.len(), 4);
    assert!(records.iter().all(|r| r.success));

    let completion = ctx.coordinator.stats();
    assert_eq!(completion.completed_actors, 2);
    assert_eq!(completion.total_iterations, 4);
    assert!(ctx.is_stopping());

    assert_eq!(service.calls("authenticate"), 2);
    assert_eq!(service.calls("create_job"), 4);
    assert_eq!(metrics.gauge(names::EXPECTED_ROWS, &[]), Some(12.0));
}

#[tokio::test(start_paused = true)]
async fn test_run_with_consumers_stops_after_producers() {
    let service = Arc::new(MockFlowService::new());
    let mut config = fast_config()
        .with_producers(2)
        .with_consumers(1)
        .with_iterations(2);
    config.secondary.enabled = true;
    config.run.think_time_min_ms = 5;
    config.run.think_time_max_ms = 5;

    let (controller, rx) = builder(config, &service).build().unwrap();
    let ctx = controller.context().clone();
    let collector = collect(rx);

    let stats = controller.run().await.expect("run failed");
    let records = collector.await.unwrap();

    assert_eq!(stats.total_workers, 3);
    assert_eq!(stats.retired, 0);

    let produced: Vec<_> = records
        .iter()
        .filter(|r| r.role == ActorRole::Producer)
        .collect();
    assert_eq!(produced.len(), 4);
    assert!(produced.iter().all(|r| r.artifact.is_some()));
    assert_eq!(ctx.artifacts.count(), 4);

    // Consumers only open what producers published
    let published: Vec<_> = ctx
        .artifacts
        .snapshot()
        .into_iter()
        .map(|a| a.reference)
        .collect();
    for reference in service.opened() {
        assert!(published.contains(&reference), "{reference}");
    }
    // Consumers never count toward the quota
    assert_eq!(ctx.coordinator.stats().total_iterations, 4);
}

#[tokio::test(start_paused = true)]
async fn test_run_ends_when_every_producer_is_retired() {
    let service = Arc::new(MockFlowService::new());
    service.fail(
        "authenticate",
        vec![
            ServiceError::Auth("bad password".into()),
            ServiceError::Auth("bad password".into()),
        ],
    );
    let config = fast_config().with_producers(2).with_iterations(3);

    let (controller, rx) = builder(config, &service).build().unwrap();
    let ctx = controller.context().clone();
    let collector = collect(rx);

    let stats = controller.run().await.unwrap();
    assert_eq!(stats.retired, 2);
    assert_eq!(stats.total_iterations(), 0);
    assert!(collector.await.unwrap().is_empty());
    assert_eq!(ctx.coordinator.stats().completed_actors, 2);
}

#[tokio::test(start_paused = true)]
async fn test_session_failure_spawns_nothing() {
    let service = Arc::new(MockFlowService::new());
    let config = fast_config().with_producers(1).with_consumers(1);

    let (controller, _rx) = RunControllerBuilder::new()
        .config(config)
        .factory(Arc::new(ProducersOnlyFactory(service.clone())))
        .source(csv_source(3, 64))
        .build()
        .unwrap();
    let ctx = controller.context().clone();

    let err = controller.run().await.unwrap_err();
    assert!(err.message.contains("consumer"));
    assert!(ctx.is_stopping());
    assert_eq!(service.calls("authenticate"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_before_run_spawns_idle_workers() {
    let service = Arc::new(MockFlowService::new());
    let config = fast_config().with_producers(2).with_iterations(5);

    let (controller, rx) = builder(config, &service).build().unwrap();
    controller.shutdown();
    let collector = collect(rx);

    let stats = controller.run().await.unwrap();
    assert_eq!(stats.total_workers, 2);
    assert_eq!(stats.total_iterations(), 0);
    assert!(collector.await.unwrap().is_empty());
    assert_eq!(service.calls("create_job"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_run_with_timeout_stops_long_run() {
    let service = Arc::new(MockFlowService::new());
    let mut config = fast_config().with_producers(1).with_iterations(1000);
    config.run.think_time_min_ms = 1000;
    config.run.think_time_max_ms = 1000;

    let (controller, rx) = builder(config, &service).build().unwrap();
    let collector = collect(rx);

    let stats = controller
        .run_with_timeout(Duration::from_secs(10))
        .await
        .unwrap();
    let records = collector.await.unwrap();

    assert!(stats.completed > 0);
    assert!(stats.completed < 1000);
    assert_eq!(records.len(), stats.completed + stats.failed);
}
