//! Entry point tying the engine together.
//!
//! [`CalculationService`] validates requests, runs single-mode calculations
//! inline and hands distributed ones to the [`Dispatcher`]. It is cheap to
//! clone; every clone shares the same store, queue and lock.

use crate::{
    EngineConfig, Error, Result,
    common::CHUNK_QUEUE,
    engine::{Aggregator, ChunkWorker, Dispatcher},
    lock::{Lock, MemoryLock, SqliteLock},
    model::{Calculation, CalculationRef, CalculationResult, Chunk, HistoryEntry, Mode, NewCalculation},
    pool::{WorkerContext, WorkerPool},
    progress::{self, Snapshot},
    queue::{DeadLetter, JobQueue, MemoryQueue, SqliteQueue},
    sampler::{self, Sampler},
    store::{MemoryStore, SqliteStore, Store, sqlite},
};
use std::sync::Arc;
use tokio_stream::wrappers::ReceiverStream;

/// A request to start a calculation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitRequest {
    pub total_points: u64,
    pub mode: Mode,
}

impl SubmitRequest {
    /// A single-mode request for `total_points`.
    pub fn new(total_points: u64) -> Self {
        Self {
            total_points,
            mode: Mode::default(),
        }
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }
}

/// Result of [`CalculationService::submit`].
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub calculation: Calculation,
    /// `true` when the work was queued rather than finished inline.
    pub accepted: bool,
}

#[derive(Clone)]
pub struct CalculationService {
    store: Arc<dyn Store>,
    queue: Arc<dyn JobQueue>,
    lock: Arc<dyn Lock>,
    sampler: Arc<dyn Sampler>,
    config: EngineConfig,
}

impl CalculationService {
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<dyn JobQueue>,
        lock: Arc<dyn Lock>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            queue,
            lock,
            sampler: Arc::new(sampler::sample),
            config,
        }
    }

    /// Process-local service. Workers must run in the same process.
    pub fn in_memory(config: EngineConfig) -> Self {
        Self::new(
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryQueue::new()),
            Arc::new(MemoryLock::new()),
            config,
        )
    }

    /// Service backed by the SQLite database at `url`.
    ///
    /// Any number of processes may connect to the same file; each can run
    /// workers, serve requests, or both.
    pub async fn connect_sqlite(url: &str, config: EngineConfig) -> Result<Self> {
        let pool = sqlite::connect(url).await?;
        Ok(Self::new(
            Arc::new(SqliteStore::new(pool.clone())),
            Arc::new(SqliteQueue::new(pool.clone(), CHUNK_QUEUE)),
            Arc::new(SqliteLock::new(pool)),
            config,
        ))
    }

    /// Replaces the sampler used by both modes.
    pub fn with_sampler(mut self, sampler: impl Sampler) -> Self {
        self.sampler = Arc::new(sampler);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<dyn JobQueue> {
        &self.queue
    }

    pub fn aggregator(&self) -> Aggregator {
        Aggregator::new(self.store.clone(), self.lock.clone(), self.config.lock_ttl)
    }

    pub fn chunk_worker(&self) -> ChunkWorker {
        ChunkWorker::new(self.store.clone(), self.aggregator(), self.sampler.clone())
    }

    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(self.store.clone(), self.queue.clone())
    }

    /// Validates and starts a calculation.
    ///
    /// Nothing is persisted when validation fails. Single mode returns the
    /// completed record; distributed mode returns the `running` record with
    /// `accepted` set. Any failure after the record exists leaves it
    /// `failed`.
    #[tracing::instrument(skip(self), fields(total_points = request.total_points, mode = %request.mode))]
    pub async fn submit(&self, request: SubmitRequest) -> Result<Submission> {
        let new = NewCalculation::new(request.total_points, request.mode)?;
        let calculation = self.store.create_calculation(new).await?;
        tracing::info!(
            monotonic_counter.calculations_submitted = 1_u64,
            calculation_id = calculation.id,
            uuid = %calculation.uuid,
            "calculation created"
        );

        match calculation.mode {
            Mode::Single => {
                let calculation = self.run_single(calculation).await?;
                Ok(Submission {
                    calculation,
                    accepted: false,
                })
            }
            Mode::Distributed => {
                self.dispatcher().dispatch(&calculation).await?;
                Ok(Submission {
                    calculation,
                    accepted: true,
                })
            }
        }
    }

    async fn run_single(&self, calculation: Calculation) -> Result<Calculation> {
        let sampler = self.sampler.clone();
        let points = calculation.total_points;

        let finished = async {
            let sample = tokio::task::spawn_blocking(move || sampler.sample(points)).await?;
            let result = CalculationResult::from(sample);
            if !self.store.complete_calculation(calculation.id, result).await? {
                return Err(Error::Storage {
                    context: format!("calculation {} left the running state", calculation.id),
                });
            }
            tracing::info!(pi = result.pi, duration_ms = result.duration_ms, "single calculation completed");
            self.fetch(calculation.id).await
        }
        .await;

        if finished.is_err() {
            if let Err(e) = self.store.fail_calculation(calculation.id).await {
                tracing::warn!("failed to mark calculation failed: {e}");
            }
        }
        finished
    }

    pub async fn fetch(&self, reference: impl Into<CalculationRef>) -> Result<Calculation> {
        let reference = reference.into();
        self.store
            .find_calculation(reference)
            .await?
            .ok_or_else(|| Error::NotFound {
                reference: reference.to_string(),
            })
    }

    pub async fn chunks(&self, reference: impl Into<CalculationRef>) -> Result<Vec<Chunk>> {
        let calculation = self.fetch(reference).await?;
        self.store.chunks(calculation.id).await
    }

    pub async fn snapshot(&self, reference: impl Into<CalculationRef>) -> Result<Snapshot> {
        progress::capture(self.store.as_ref(), reference.into()).await
    }

    /// Progress snapshots of `reference` until it finishes.
    pub async fn stream(
        &self,
        reference: impl Into<CalculationRef>,
    ) -> Result<ReceiverStream<Snapshot>> {
        progress::subscribe(self.store.clone(), reference.into(), &self.config).await
    }

    /// The most recent completed calculations, newest first.
    pub async fn history(&self) -> Result<Vec<HistoryEntry>> {
        let recent = self
            .store
            .recent_completed(self.config.history_limit)
            .await?;
        Ok(recent.iter().map(HistoryEntry::from).collect())
    }

    pub async fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
        self.queue.dead_letters().await
    }

    /// Starts `num_workers` queue workers on the current runtime.
    pub fn spawn_workers(&self, num_workers: usize) -> WorkerPool {
        WorkerPool::spawn(
            num_workers,
            WorkerContext {
                queue: self.queue.clone(),
                store: self.store.clone(),
                worker: self.chunk_worker(),
                config: self.config.clone(),
            },
        )
    }
}
