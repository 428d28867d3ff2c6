use super::{AggregateOutcome, Aggregator};
use crate::{
    Error, Result,
    queue::ChunkJob,
    sampler::{Sample, Sampler},
    store::Store,
};
use std::sync::Arc;

/// What [`ChunkWorker::handle`] did with a job.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ChunkOutcome {
    /// The chunk was already completed by an earlier delivery.
    Skipped,
    /// The chunk was sampled and stored; `aggregate` is the follow-up
    /// aggregation attempt.
    Completed {
        sample: Sample,
        aggregate: AggregateOutcome,
    },
}

/// Executes one chunk job. Safe to run any number of times per job.
///
/// Every delivery ends with an aggregation attempt, skipped ones included.
#[derive(Clone)]
pub struct ChunkWorker {
    store: Arc<dyn Store>,
    aggregator: Aggregator,
    sampler: Arc<dyn Sampler>,
}

impl ChunkWorker {
    pub fn new(store: Arc<dyn Store>, aggregator: Aggregator, sampler: Arc<dyn Sampler>) -> Self {
        Self {
            store,
            aggregator,
            sampler,
        }
    }

    #[tracing::instrument(skip(self), fields(calculation_id = job.calculation_id, chunk_index = job.chunk_index))]
    pub async fn handle(&self, job: ChunkJob) -> Result<ChunkOutcome> {
        let Some(chunk) = self
            .store
            .find_chunk(job.calculation_id, job.chunk_index)
            .await?
        else {
            tracing::error!("chunk job refers to a missing chunk");
            return Err(Error::ChunkMissing {
                calculation_id: job.calculation_id,
                chunk_index: job.chunk_index,
            });
        };

        if chunk.is_completed() {
            tracing::debug!("chunk already completed, skipping");
            self.settle(job.calculation_id).await?;
            return Ok(ChunkOutcome::Skipped);
        }

        if chunk.total_points != job.chunk_points {
            tracing::warn!(
                stored = chunk.total_points,
                queued = job.chunk_points,
                "job size disagrees with stored chunk, sampling stored size"
            );
        }

        let sampler = self.sampler.clone();
        let points = chunk.total_points;
        let sample = tokio::task::spawn_blocking(move || sampler.sample(points)).await?;

        if !self
            .store
            .complete_chunk(job.calculation_id, job.chunk_index, sample)
            .await?
        {
            // A concurrent delivery stored its result first.
            tracing::debug!("chunk completed concurrently, discarding sample");
            self.settle(job.calculation_id).await?;
            return Ok(ChunkOutcome::Skipped);
        }

        tracing::info!(
            monotonic_counter.chunks_completed = 1_u64,
            histogram.chunk_duration_ms = sample.duration_ms,
            inside = sample.inside,
            total = sample.total,
            "chunk completed"
        );

        let aggregate = self.aggregator.try_aggregate(job.calculation_id).await?;
        Ok(ChunkOutcome::Completed { sample, aggregate })
    }

    /// Re-attempts aggregation on behalf of a delivery that had nothing left
    /// to sample, in case the delivery that stored the chunk failed to.
    async fn settle(&self, calculation_id: i64) -> Result<()> {
        let outcome = self.aggregator.try_aggregate(calculation_id).await?;
        tracing::debug!(?outcome, "aggregation after skipped chunk");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        lock::MemoryLock,
        model::{Mode, NewCalculation, Status},
        store::MemoryStore,
    };
    use core::{
        sync::atomic::{AtomicU64, Ordering},
        time::Duration,
    };

    fn fixed(points: u64) -> Sample {
        Sample {
            inside: points * 3 / 4,
            total: points,
            duration_ms: 1,
        }
    }

    async fn setup(sampler: Arc<dyn Sampler>) -> (Arc<MemoryStore>, ChunkWorker, i64) {
        let store = Arc::new(MemoryStore::new());
        let calc = store
            .create_calculation(NewCalculation::new(200_000, Mode::Distributed).unwrap())
            .await
            .unwrap();
        store
            .create_chunks(calc.id, &[100_000, 100_000])
            .await
            .unwrap();
        let aggregator = Aggregator::new(
            store.clone(),
            Arc::new(MemoryLock::new()),
            Duration::from_secs(10),
        );
        (store.clone(), ChunkWorker::new(store, aggregator, sampler), calc.id)
    }

    fn job(calculation_id: i64, chunk_index: u32) -> ChunkJob {
        ChunkJob {
            calculation_id,
            chunk_index,
            chunk_points: 100_000,
        }
    }

    #[tokio::test]
    async fn redelivery_does_not_resample() {
        let calls = Arc::new(AtomicU64::new(0));
        let counter = calls.clone();
        let sampler = Arc::new(move |n: u64| {
            counter.fetch_add(1, Ordering::SeqCst);
            fixed(n)
        });
        let (store, worker, id) = setup(sampler).await;

        let first = worker.handle(job(id, 0)).await.unwrap();
        assert!(matches!(first, ChunkOutcome::Completed { .. }));
        assert_eq!(worker.handle(job(id, 0)).await.unwrap(), ChunkOutcome::Skipped);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let chunk = store.find_chunk(id, 0).await.unwrap().unwrap();
        assert_eq!(chunk.result_inside, Some(75_000));
    }

    #[tokio::test]
    async fn last_chunk_triggers_aggregation() {
        let (store, worker, id) = setup(Arc::new(fixed)).await;

        let ChunkOutcome::Completed { aggregate, .. } = worker.handle(job(id, 0)).await.unwrap()
        else {
            panic!("expected completion");
        };
        assert_eq!(
            aggregate,
            AggregateOutcome::Pending {
                completed: 1,
                total: 2
            }
        );

        let ChunkOutcome::Completed { aggregate, .. } = worker.handle(job(id, 1)).await.unwrap()
        else {
            panic!("expected completion");
        };
        assert!(matches!(aggregate, AggregateOutcome::Completed(_)));

        let calc = store
            .find_calculation(id.into())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(calc.status, Status::Completed);
        assert_eq!(calc.result_total, Some(200_000));
        assert_eq!(calc.result_inside, Some(150_000));
        assert_eq!(calc.result_pi, Some(3.0));
    }

    #[tokio::test]
    async fn missing_chunk_is_an_error() {
        let (_, worker, id) = setup(Arc::new(fixed)).await;
        assert_eq!(
            worker.handle(job(id, 7)).await,
            Err(Error::ChunkMissing {
                calculation_id: id,
                chunk_index: 7
            })
        );
    }

    #[tokio::test]
    async fn samples_the_stored_chunk_size() {
        let (store, worker, id) = setup(Arc::new(fixed)).await;
        let mut stale = job(id, 0);
        stale.chunk_points = 1;
        worker.handle(stale).await.unwrap();

        let chunk = store.find_chunk(id, 0).await.unwrap().unwrap();
        assert_eq!(chunk.result_total, Some(100_000));
    }

    #[tokio::test]
    async fn redelivery_finishes_an_unaggregated_calculation() {
        let (store, worker, id) = setup(Arc::new(fixed)).await;
        // Both chunks stored, but no aggregation ever ran.
        store.complete_chunk(id, 0, fixed(100_000)).await.unwrap();
        store.complete_chunk(id, 1, fixed(100_000)).await.unwrap();

        assert_eq!(worker.handle(job(id, 1)).await.unwrap(), ChunkOutcome::Skipped);

        let calc = store.find_calculation(id.into()).await.unwrap().unwrap();
        assert_eq!(calc.status, Status::Completed);
        assert_eq!(calc.result_inside, Some(150_000));
    }
}
