use crate::{
    Result,
    model::{Calculation, Chunk},
    planner,
    queue::{ChunkJob, JobQueue},
    store::Store,
};
use std::sync::Arc;

/// Splits a distributed calculation into chunks and enqueues one job each.
#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<dyn Store>,
    queue: Arc<dyn JobQueue>,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn Store>, queue: Arc<dyn JobQueue>) -> Self {
        Self { store, queue }
    }

    /// Persists the chunk plan, then publishes its jobs.
    ///
    /// Chunks are written in one transaction before any job is pushed, so no
    /// job ever names an unpersisted chunk. If publishing fails the chunks are
    /// removed and the calculation is marked `failed`; the original error is
    /// returned.
    #[tracing::instrument(skip_all, fields(calculation_id = calculation.id))]
    pub async fn dispatch(&self, calculation: &Calculation) -> Result<Vec<Chunk>> {
        let sizes = planner::plan(calculation.total_points)?;
        let chunks = match self.store.create_chunks(calculation.id, &sizes).await {
            Ok(chunks) => chunks,
            Err(e) => {
                self.abandon(calculation.id, false).await;
                return Err(e);
            }
        };

        let jobs: Vec<ChunkJob> = chunks.iter().map(ChunkJob::from).collect();
        if let Err(e) = self.queue.push_batch(&jobs).await {
            tracing::error!("failed to enqueue chunk jobs: {e}");
            self.abandon(calculation.id, true).await;
            return Err(e);
        }

        tracing::info!(
            monotonic_counter.chunks_dispatched = jobs.len() as u64,
            chunks = jobs.len(),
            "calculation dispatched"
        );
        Ok(chunks)
    }

    async fn abandon(&self, calculation_id: i64, drop_chunks: bool) {
        if drop_chunks {
            if let Err(e) = self.store.delete_chunks(calculation_id).await {
                tracing::warn!("failed to remove chunks of abandoned calculation: {e}");
            }
        }
        if let Err(e) = self.store.fail_calculation(calculation_id).await {
            tracing::warn!("failed to mark calculation failed: {e}");
        }
    }
}
