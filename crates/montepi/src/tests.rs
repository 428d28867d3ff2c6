use crate::{
    AggregateOutcome, CalculationService, EngineConfig, Error, Mode, Status, SubmitRequest,
    queue::{ChunkJob, JobQueue},
    sampler::{Sample, sample_with},
    store::Store,
};
use core::time::Duration;
use futures::{StreamExt, future::join_all};
use parking_lot::Mutex;
use rand::{SeedableRng, rngs::StdRng};
use std::collections::HashSet;
use tokio::time::{Instant, sleep};

fn test_config() -> EngineConfig {
    EngineConfig {
        idle_backoff: Duration::from_millis(5),
        job_timeout: Duration::from_secs(30),
        max_attempts: 3,
        shutdown_timeout: Duration::from_secs(1),
        ..EngineConfig::default()
    }
}

fn memory() -> CalculationService {
    CalculationService::in_memory(test_config())
}

async fn sqlite() -> CalculationService {
    CalculationService::connect_sqlite("sqlite::memory:", test_config())
        .await
        .unwrap()
}

/// Deterministic stand-in: exactly three quarters of the points land inside.
fn three_quarters(points: u64) -> Sample {
    Sample {
        inside: points * 3 / 4,
        total: points,
        duration_ms: 2,
    }
}

/// One generator shared by every call, so any split of a budget draws the
/// same points as a single pass over it.
fn seeded(seed: u64) -> impl Fn(u64) -> Sample + Send + Sync + 'static {
    let rng = Mutex::new(StdRng::seed_from_u64(seed));
    move |points| sample_with(&mut *rng.lock(), points)
}

async fn wait_for<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(30);
    while !check().await {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        sleep(Duration::from_millis(10)).await;
    }
}

async fn run_single_mode_completes_inline(service: CalculationService) {
    let submission = service.submit(SubmitRequest::new(100_000)).await.unwrap();
    let calc = submission.calculation;

    assert!(!submission.accepted);
    assert_eq!(calc.mode, Mode::Single);
    assert_eq!(calc.status, Status::Completed);
    assert_eq!(calc.result_total, Some(100_000));
    let inside = calc.result_inside.unwrap();
    assert!(inside <= 100_000);
    let pi = calc.result_pi.unwrap();
    assert!(pi > 0.0 && pi < 4.0, "pi = {pi}");
    assert!(service.chunks(calc.id).await.unwrap().is_empty());
}

async fn run_distributed_completes_in_any_order(service: CalculationService) {
    let service = service.with_sampler(three_quarters);
    let submission = service
        .submit(SubmitRequest::new(500_000).with_mode(Mode::Distributed))
        .await
        .unwrap();
    assert!(submission.accepted);
    assert_eq!(submission.calculation.status, Status::Running);
    let id = submission.calculation.id;

    let chunks = service.chunks(id).await.unwrap();
    assert!((2..=8).contains(&chunks.len()));
    assert_eq!(chunks.iter().map(|c| c.total_points).sum::<u64>(), 500_000);

    let mut deliveries = Vec::new();
    while let Some(d) = service
        .queue()
        .reserve(service.config().visibility())
        .await
        .unwrap()
    {
        deliveries.push(d);
    }
    assert_eq!(deliveries.len(), chunks.len());

    let worker = service.chunk_worker();
    for delivery in deliveries.iter().rev() {
        worker.handle(delivery.job).await.unwrap();
        service.queue().ack(delivery).await.unwrap();
    }

    let calc = service.fetch(id).await.unwrap();
    assert_eq!(calc.status, Status::Completed);
    assert_eq!(calc.result_total, Some(500_000));
    assert_eq!(calc.result_inside, Some(375_000));
    assert_eq!(calc.result_pi, Some(3.0));
    assert_eq!(calc.duration_ms, Some(2 * chunks.len() as u64));
    assert_eq!(service.queue().len().await.unwrap(), 0);
}

async fn run_redelivery_is_harmless(service: CalculationService) {
    let service = service.with_sampler(three_quarters);
    let id = service
        .submit(SubmitRequest::new(200_000).with_mode(Mode::Distributed))
        .await
        .unwrap()
        .calculation
        .id;
    let chunks = service.chunks(id).await.unwrap();
    let worker = service.chunk_worker();

    for _ in 0..3 {
        for chunk in &chunks {
            worker.handle(ChunkJob::from(chunk)).await.unwrap();
        }
    }

    let calc = service.fetch(id).await.unwrap();
    assert_eq!(calc.status, Status::Completed);
    assert_eq!(calc.result_total, Some(200_000));
    let stored = service.chunks(id).await.unwrap();
    assert!(stored.iter().all(|c| c.result_total == Some(c.total_points)));
}

async fn run_concurrent_chunks_complete(service: CalculationService) {
    let service = service.with_sampler(three_quarters);
    for _ in 0..10 {
        let id = service
            .submit(SubmitRequest::new(1_000_000).with_mode(Mode::Distributed))
            .await
            .unwrap()
            .calculation
            .id;
        let handles = service.chunks(id).await.unwrap().into_iter().map(|chunk| {
            let worker = service.chunk_worker();
            tokio::spawn(async move { worker.handle(ChunkJob::from(&chunk)).await })
        });
        for joined in join_all(handles).await {
            joined.unwrap().unwrap();
        }

        let calc = service.fetch(id).await.unwrap();
        assert_eq!(calc.status, Status::Completed);
        assert_eq!(calc.result_total, Some(1_000_000));
        assert_eq!(calc.result_inside, Some(750_000));
    }
}

async fn run_seeded_distributed_matches_single(service: CalculationService) {
    const SEED: u64 = 0x5eed;

    let single = service
        .clone()
        .with_sampler(seeded(SEED))
        .submit(SubmitRequest::new(300_000))
        .await
        .unwrap()
        .calculation;

    let distributed = service.with_sampler(seeded(SEED));
    let id = distributed
        .submit(SubmitRequest::new(300_000).with_mode(Mode::Distributed))
        .await
        .unwrap()
        .calculation
        .id;
    let chunks = distributed.chunks(id).await.unwrap();
    assert!(chunks.len() > 1);
    let worker = distributed.chunk_worker();
    for chunk in &chunks {
        worker.handle(ChunkJob::from(chunk)).await.unwrap();
    }

    let calc = distributed.fetch(id).await.unwrap();
    assert_eq!(calc.status, Status::Completed);
    assert_eq!(calc.result_total, single.result_total);
    assert_eq!(calc.result_inside, single.result_inside);
    assert_eq!(calc.result_pi, single.result_pi);
}

async fn run_history_is_capped(service: CalculationService) {
    let service = service.with_sampler(three_quarters);
    let limit = service.config().history_limit as usize;
    let mut ids = Vec::new();
    for _ in 0..limit + 5 {
        ids.push(
            service
                .submit(SubmitRequest::new(100_000))
                .await
                .unwrap()
                .calculation
                .id,
        );
    }

    let history = service.history().await.unwrap();
    assert_eq!(history.len(), 30);
    let listed: Vec<_> = history.iter().map(|h| h.id).collect();
    let newest: Vec<_> = ids.iter().rev().take(30).copied().collect();
    assert_eq!(listed, newest);
}

async fn run_concurrent_aggregation_writes_once(service: CalculationService) {
    let id = service
        .submit(SubmitRequest::new(1_000_000).with_mode(Mode::Distributed))
        .await
        .unwrap()
        .calculation
        .id;
    for chunk in service.chunks(id).await.unwrap() {
        service
            .store()
            .complete_chunk(id, chunk.chunk_index, three_quarters(chunk.total_points))
            .await
            .unwrap();
    }

    let attempts = (0..16).map(|_| {
        let aggregator = service.aggregator();
        tokio::spawn(async move { aggregator.try_aggregate(id).await })
    });
    let outcomes: Vec<_> = join_all(attempts)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    let writes = outcomes
        .iter()
        .filter(|o| matches!(o, AggregateOutcome::Completed(_)))
        .count();
    assert_eq!(writes, 1, "outcomes: {outcomes:?}");
    assert!(outcomes.iter().all(|o| matches!(
        o,
        AggregateOutcome::Completed(_)
            | AggregateOutcome::LockBusy
            | AggregateOutcome::AlreadyFinalized(Status::Completed)
    )));
    assert_eq!(
        service.fetch(id).await.unwrap().result_total,
        Some(1_000_000)
    );
}

async fn run_invalid_requests_create_nothing(service: CalculationService) {
    for points in [0, 99_999, 10_000_001] {
        let err = service.submit(SubmitRequest::new(points)).await.unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidRequest {
                field: "total_points",
                ..
            }
        ));
    }
    assert!(matches!(
        service.fetch(1).await,
        Err(Error::NotFound { .. })
    ));
    assert!(service.history().await.unwrap().is_empty());
}

async fn run_fetch_by_token_matches_id(service: CalculationService) {
    let calc = service
        .submit(SubmitRequest::new(100_000))
        .await
        .unwrap()
        .calculation;
    assert_eq!(service.fetch(calc.uuid).await.unwrap(), calc);
    assert_eq!(service.fetch(calc.id).await.unwrap(), calc);
    assert_eq!(
        service.fetch(calc.uuid.to_string().parse::<crate::CalculationRef>().unwrap())
            .await
            .unwrap(),
        calc
    );
}

async fn run_history_lists_completed_newest_first(service: CalculationService) {
    let service = service.with_sampler(three_quarters);
    let mut completed = Vec::new();
    for _ in 0..3 {
        completed.push(
            service
                .submit(SubmitRequest::new(100_000))
                .await
                .unwrap()
                .calculation
                .id,
        );
        // Distinct creation timestamps.
        sleep(Duration::from_millis(3)).await;
    }
    service
        .submit(SubmitRequest::new(100_000).with_mode(Mode::Distributed))
        .await
        .unwrap();

    let history = service.history().await.unwrap();
    let ids: Vec<_> = history.iter().map(|h| h.id).collect();
    completed.reverse();
    assert_eq!(ids, completed);
    assert!(history.iter().all(|h| h.result_pi == Some(3.0)));
}

async fn run_stream_on_completed_emits_once(service: CalculationService) {
    let calc = service
        .submit(SubmitRequest::new(100_000))
        .await
        .unwrap()
        .calculation;
    let snapshots: Vec<_> = service.stream(calc.uuid).await.unwrap().collect().await;

    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].status, Status::Completed);
    assert_eq!(snapshots[0].result_pi, calc.result_pi);
    assert_eq!(snapshots[0].total_count, 100_000);
}

async fn run_workers_drain_distributed_calculation(service: CalculationService) {
    let pool = service.spawn_workers(3);
    let id = service
        .submit(SubmitRequest::new(1_000_000).with_mode(Mode::Distributed))
        .await
        .unwrap()
        .calculation
        .id;

    wait_for("completion", || {
        let service = service.clone();
        async move { service.fetch(id).await.unwrap().status == Status::Completed }
    })
    .await;
    pool.shutdown().await.unwrap();

    let calc = service.fetch(id).await.unwrap();
    assert_eq!(calc.result_total, Some(1_000_000));
    let chunks = service.chunks(id).await.unwrap();
    let indices: HashSet<_> = chunks.iter().map(|c| c.chunk_index).collect();
    assert_eq!(indices.len(), chunks.len());
    assert_eq!(
        calc.result_inside,
        Some(chunks.iter().filter_map(|c| c.result_inside).sum())
    );
    assert!(service.dead_letters().await.unwrap().is_empty());
}

async fn run_failing_job_is_dead_lettered(service: CalculationService) {
    let service = service.with_sampler(|_: u64| -> Sample { panic!("sampler exploded") });
    let pool = service.spawn_workers(1);
    let id = service
        .submit(SubmitRequest::new(100_000).with_mode(Mode::Distributed))
        .await
        .unwrap()
        .calculation
        .id;

    wait_for("dead letters", || {
        let service = service.clone();
        async move { service.dead_letters().await.unwrap().len() == 2 }
    })
    .await;
    pool.shutdown().await.unwrap();

    let dead = service.dead_letters().await.unwrap();
    assert!(dead.iter().all(|d| d.attempts == 3));
    assert!(dead.iter().all(|d| d.error.contains("Sampling failed")));
    assert_eq!(service.fetch(id).await.unwrap().status, Status::Failed);
    assert_eq!(service.queue().len().await.unwrap(), 0);
}

async fn run_missing_chunk_is_dead_lettered_immediately(service: CalculationService) {
    service
        .queue()
        .push_batch(&[ChunkJob {
            calculation_id: 4242,
            chunk_index: 0,
            chunk_points: 50_000,
        }])
        .await
        .unwrap();
    let pool = service.spawn_workers(1);

    wait_for("dead letter", || {
        let service = service.clone();
        async move { !service.dead_letters().await.unwrap().is_empty() }
    })
    .await;
    pool.shutdown().await.unwrap();

    let dead = service.dead_letters().await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].attempts, 1);
    assert_eq!(dead[0].job.calculation_id, 4242);
}

// --- in-memory backend ---

#[tokio::test]
async fn memory_single_mode_completes_inline() {
    run_single_mode_completes_inline(memory()).await;
}

#[tokio::test]
async fn memory_distributed_completes_in_any_order() {
    run_distributed_completes_in_any_order(memory()).await;
}

#[tokio::test]
async fn memory_redelivery_is_harmless() {
    run_redelivery_is_harmless(memory()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn memory_concurrent_aggregation_writes_once() {
    run_concurrent_aggregation_writes_once(memory()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn memory_concurrent_chunks_complete() {
    run_concurrent_chunks_complete(memory()).await;
}

#[tokio::test]
async fn memory_seeded_distributed_matches_single() {
    run_seeded_distributed_matches_single(memory()).await;
}

#[tokio::test]
async fn memory_history_is_capped() {
    run_history_is_capped(memory()).await;
}

#[tokio::test]
async fn memory_invalid_requests_create_nothing() {
    run_invalid_requests_create_nothing(memory()).await;
}

#[tokio::test]
async fn memory_fetch_by_token_matches_id() {
    run_fetch_by_token_matches_id(memory()).await;
}

#[tokio::test]
async fn memory_history_lists_completed_newest_first() {
    run_history_lists_completed_newest_first(memory()).await;
}

#[tokio::test]
async fn memory_stream_on_completed_emits_once() {
    run_stream_on_completed_emits_once(memory()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn memory_workers_drain_distributed_calculation() {
    run_workers_drain_distributed_calculation(memory()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn memory_failing_job_is_dead_lettered() {
    run_failing_job_is_dead_lettered(memory()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn memory_missing_chunk_is_dead_lettered_immediately() {
    run_missing_chunk_is_dead_lettered_immediately(memory()).await;
}

// --- SQLite backend ---

#[tokio::test]
async fn sqlite_single_mode_completes_inline() {
    run_single_mode_completes_inline(sqlite().await).await;
}

#[tokio::test]
async fn sqlite_distributed_completes_in_any_order() {
    run_distributed_completes_in_any_order(sqlite().await).await;
}

#[tokio::test]
async fn sqlite_redelivery_is_harmless() {
    run_redelivery_is_harmless(sqlite().await).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sqlite_concurrent_aggregation_writes_once() {
    run_concurrent_aggregation_writes_once(sqlite().await).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sqlite_concurrent_chunks_complete() {
    run_concurrent_chunks_complete(sqlite().await).await;
}

#[tokio::test]
async fn sqlite_seeded_distributed_matches_single() {
    run_seeded_distributed_matches_single(sqlite().await).await;
}

#[tokio::test]
async fn sqlite_history_is_capped() {
    run_history_is_capped(sqlite().await).await;
}

#[tokio::test]
async fn sqlite_invalid_requests_create_nothing() {
    run_invalid_requests_create_nothing(sqlite().await).await;
}

#[tokio::test]
async fn sqlite_fetch_by_token_matches_id() {
    run_fetch_by_token_matches_id(sqlite().await).await;
}

#[tokio::test]
async fn sqlite_history_lists_completed_newest_first() {
    run_history_lists_completed_newest_first(sqlite().await).await;
}

#[tokio::test]
async fn sqlite_stream_on_completed_emits_once() {
    run_stream_on_completed_emits_once(sqlite().await).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sqlite_workers_drain_distributed_calculation() {
    run_workers_drain_distributed_calculation(sqlite().await).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sqlite_failing_job_is_dead_lettered() {
    run_failing_job_is_dead_lettered(sqlite().await).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sqlite_missing_chunk_is_dead_lettered_immediately() {
    run_missing_chunk_is_dead_lettered_immediately(sqlite().await).await;
}
