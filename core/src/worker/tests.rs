//! Integration tests for the Worker module

use super::*;
use crate::chunk::{summarize, ChunkSource};
use crate::config::LoadConfig;
use crate::context::RunContext;
use crate::coordination::Artifact;
use crate::credentials::Credentials;
use crate::error::ErrorKind;
use crate::metrics::names;
use crate::model::{ActorId, ActorRole};
use crate::pipeline::{IterationRecord, JobOrchestrator, Stage};
use crate::test_support::{csv_source, fast_config, fast_executor, metered_context, MockFlowService};
use crate::traits::ServiceError;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

// ============================================================================
// Helper functions
// ============================================================================

async fn producer(
    index: usize,
    service: &Arc<MockFlowService>,
    ctx: &RunContext,
    config: &LoadConfig,
) -> Box<dyn Actor> {
    let source: Arc<dyn ChunkSource> = csv_source(20, 64);
    let summary = summarize(source.as_ref()).await.unwrap();
    let orchestrator = JobOrchestrator::new(
        ActorId::new(ActorRole::Producer, index),
        "analyst_one",
        service.clone(),
        source,
        summary,
        config,
        ctx,
    );
    Box::new(ProducerActor::new(
        Credentials::new("analyst_one", "secret"),
        service.clone(),
        fast_executor(ctx),
        orchestrator,
        ctx.clone(),
    ))
}

fn consumer(
    index: usize,
    service: &Arc<MockFlowService>,
    ctx: &RunContext,
    wait: Duration,
) -> Box<dyn Actor> {
    Box::new(ConsumerActor::new(
        ActorId::new(ActorRole::Consumer, index),
        Credentials::new("viewer", "secret"),
        service.clone(),
        fast_executor(ctx),
        wait,
        ctx.clone(),
    ))
}

fn worker(
    actor: Box<dyn Actor>,
    ctx: &RunContext,
    think: Duration,
) -> (Worker, mpsc::Receiver<IterationRecord>) {
    let (tx, rx) = mpsc::channel(1000);
    let worker = WorkerBuilder::new()
        .actor(actor)
        .context(ctx.clone())
        .records_tx(tx)
        .think_time(think, think)
        .build()
        .expect("Failed to build worker");
    (worker, rx)
}

fn drain(rx: &mut mpsc::Receiver<IterationRecord>) -> Vec<IterationRecord> {
    let mut records = Vec::new();
    while let Ok(record) = rx.try_recv() {
        records.push(record);
    }
    records
}

// ============================================================================
// Producers
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_producer_runs_quota_then_stops_run() {
    let config = fast_config().with_iterations(3);
    let (ctx, metrics) = metered_context(3);
    ctx.coordinator.setup(1);
    let service = Arc::new(MockFlowService::new());

    let (worker, mut rx) = worker(producer(0, &service, &ctx, &config).await, &ctx, Duration::ZERO);
    let stats = worker.run().await.expect("Worker failed");

    assert_eq!(stats.completed, 3);
    assert_eq!(stats.failed, 0);
    let records = drain(&mut rx);
    assert_eq!(
        records.iter().map(|r| r.iteration).collect::<Vec<_>>(),
        vec![0, 1, 2]
    );
    assert!(ctx.is_stopping());

    let completion = ctx.coordinator.stats();
    assert_eq!(completion.completed_actors, 1);
    assert_eq!(completion.total_iterations, 3);
    assert!(completion.stop_acknowledged);
    assert_eq!(service.calls("authenticate"), 1);
    assert_eq!(
        metrics.gauge(names::ACTIVE_ACTORS, &[("role", "producer".into())]),
        Some(0.0)
    );
}

#[tokio::test(start_paused = true)]
async fn test_failed_iterations_count_toward_quota() {
    let config = fast_config().with_iterations(2);
    let (ctx, _) = metered_context(2);
    ctx.coordinator.setup(1);
    let service = Arc::new(MockFlowService::new());
    service.fail("create_job", vec![ServiceError::status(400, "bad label")]);

    let (worker, mut rx) = worker(producer(0, &service, &ctx, &config).await, &ctx, Duration::ZERO);
    let stats = worker.run().await.unwrap();

    assert_eq!(stats.failed, 1);
    assert_eq!(stats.completed, 1);
    let records = drain(&mut rx);
    assert_eq!(records[0].failure.as_ref().unwrap().stage, Stage::Create);
    assert!(records[1].success);
    assert!(ctx.is_stopping());
}

#[tokio::test(start_paused = true)]
async fn test_run_stops_only_after_every_producer() {
    let config = fast_config().with_iterations(2);
    let (ctx, _) = metered_context(2);
    ctx.coordinator.setup(2);
    let service = Arc::new(MockFlowService::new());

    let (fast, mut fast_rx) = worker(producer(0, &service, &ctx, &config).await, &ctx, Duration::ZERO);
    let (slow, mut slow_rx) = worker(
        producer(1, &service, &ctx, &config).await,
        &ctx,
        Duration::from_secs(2),
    );

    let fast_stats = fast.run().await.unwrap();
    assert_eq!(fast_stats.completed, 2);
    assert!(!ctx.is_stopping(), "one producer must not end the run");

    let slow_stats = slow.run().await.unwrap();
    assert_eq!(slow_stats.completed, 2);
    assert!(ctx.is_stopping());

    assert_eq!(drain(&mut fast_rx).len(), 2);
    assert_eq!(drain(&mut slow_rx).len(), 2);
    assert_eq!(ctx.coordinator.stats().completed_actors, 2);
}

#[tokio::test(start_paused = true)]
async fn test_login_failure_retires_actor() {
    let config = fast_config().with_iterations(5);
    let (ctx, metrics) = metered_context(5);
    ctx.coordinator.setup(1);
    let service = Arc::new(MockFlowService::new());
    service.fail("authenticate", vec![ServiceError::Auth("bad password".into())]);

    let (worker, mut rx) = worker(producer(0, &service, &ctx, &config).await, &ctx, Duration::ZERO);
    let stats = worker.run().await.unwrap();

    assert_eq!(stats.retired, 1);
    assert_eq!(stats.total_iterations(), 0);
    assert!(drain(&mut rx).is_empty());
    assert_eq!(service.calls("create_job"), 0);

    // The only producer retired, so nothing is left to wait for
    assert!(ctx.is_stopping());
    let actor = ActorId::new(ActorRole::Producer, 0);
    assert!(ctx.coordinator.stats().actors[&actor].retired);
    assert_eq!(
        metrics.counter(names::AUTH_ATTEMPTS, &[("outcome", "failure".into())]),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn test_session_loss_mid_run_retires_actor() {
    let config = fast_config().with_iterations(5);
    let (ctx, _) = metered_context(5);
    ctx.coordinator.setup(1);
    let service = Arc::new(MockFlowService::new());
    service.fail("create_job", vec![ServiceError::Auth("session expired".into())]);

    let (worker, mut rx) = worker(producer(0, &service, &ctx, &config).await, &ctx, Duration::ZERO);
    let stats = worker.run().await.unwrap();

    assert_eq!(stats.failed, 1);
    assert_eq!(stats.retired, 1);
    let records = drain(&mut rx);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].failure_kind(), Some(ErrorKind::Authentication));
    assert!(ctx.is_stopping());
}

#[tokio::test(start_paused = true)]
async fn test_result_finishing_after_stop_is_discarded() {
    let config = fast_config().with_iterations(5);
    let (ctx, _) = metered_context(5);
    ctx.coordinator.setup(1);
    let service = Arc::new(MockFlowService::new().with_latency(Duration::from_millis(50)));

    let (worker, mut rx) = worker(producer(0, &service, &ctx, &config).await, &ctx, Duration::ZERO);
    let handle = tokio::spawn(worker.run());

    // Login finishes at 50ms, job creation is in flight until 100ms
    tokio::time::sleep(Duration::from_millis(75)).await;
    ctx.request_stop("test");

    let stats = handle.await.expect("Worker task panicked").unwrap();
    assert_eq!(stats.discarded, 1);
    assert_eq!(stats.total_iterations(), 0);
    assert!(drain(&mut rx).is_empty());
    assert_eq!(service.calls("create_job"), 1);
    assert_eq!(service.calls("get_job_params"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_stop_interrupts_think_time() {
    let config = fast_config().with_iterations(5);
    let (ctx, _) = metered_context(5);
    ctx.coordinator.setup(1);
    let service = Arc::new(MockFlowService::new());

    let (worker, mut rx) = worker(
        producer(0, &service, &ctx, &config).await,
        &ctx,
        Duration::from_secs(3600),
    );
    let handle = tokio::spawn(worker.run());

    tokio::time::sleep(Duration::from_secs(60)).await;
    ctx.request_stop("test");

    let stats = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("worker should leave its think time")
        .unwrap()
        .unwrap();
    assert_eq!(stats.completed, 1);
    assert_eq!(drain(&mut rx).len(), 1);
}

// ============================================================================
// Consumers
// ============================================================================

#[tokio::test]
async fn test_consumer_opens_published_artifacts_until_stop() {
    let (ctx, metrics) = metered_context(1);
    let service = Arc::new(MockFlowService::new());
    ctx.artifacts
        .publish(Artifact::new("https://bi.example/d/1", ActorId::from("producer-0")));
    ctx.artifacts
        .publish(Artifact::new("https://bi.example/d/2", ActorId::from("producer-1")));

    let (worker, mut rx) = worker(
        consumer(0, &service, &ctx, Duration::from_secs(1)),
        &ctx,
        Duration::from_millis(5),
    );
    let handle = tokio::spawn(worker.run());

    tokio::time::sleep(Duration::from_millis(100)).await;
    ctx.request_stop("test");
    let stats = handle.await.unwrap().unwrap();

    assert!(stats.completed >= 2);
    let records = drain(&mut rx);
    assert!(records.iter().all(|r| r.role == ActorRole::Consumer));
    for reference in service.opened() {
        assert!(reference.starts_with("https://bi.example/d/"));
    }
    // Consumers never touch the quota
    assert_eq!(ctx.coordinator.stats().total_iterations, 0);
    assert!(
        metrics.counter(
            names::ITERATIONS,
            &[("role", "consumer".into()), ("outcome", "success".into())]
        ) >= 2
    );
}

#[tokio::test]
async fn test_consumer_wakes_on_first_publish() {
    let (ctx, _) = metered_context(1);
    let service = Arc::new(MockFlowService::new());

    let (worker, mut rx) = worker(
        consumer(0, &service, &ctx, Duration::from_secs(30)),
        &ctx,
        Duration::from_millis(5),
    );
    let handle = tokio::spawn(worker.run());

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(service.opened().is_empty());
    ctx.artifacts
        .publish(Artifact::new("https://bi.example/d/9", ActorId::from("producer-0")));

    tokio::time::sleep(Duration::from_millis(50)).await;
    ctx.request_stop("test");
    handle.await.unwrap().unwrap();

    assert!(!drain(&mut rx).is_empty());
    assert!(service
        .opened()
        .iter()
        .all(|r| r == "https://bi.example/d/9"));
}

#[tokio::test(start_paused = true)]
async fn test_consumer_gives_up_without_artifacts() {
    let (ctx, _) = metered_context(1);
    ctx.coordinator.setup(1);
    let service = Arc::new(MockFlowService::new());

    let (worker, mut rx) = worker(
        consumer(0, &service, &ctx, Duration::from_secs(5)),
        &ctx,
        Duration::ZERO,
    );
    let stats = worker.run().await.unwrap();

    assert_eq!(stats.retired, 1);
    assert!(drain(&mut rx).is_empty());
    // Consumers are not part of the completion count
    assert_eq!(ctx.coordinator.stats().completed_actors, 0);
    assert!(!ctx.is_stopping());
}
