use crate::{
    Result,
    common::aggregate_lock_key,
    lock::{Lock, LockGuard},
    model::{CalculationRef, CalculationResult, Status},
    store::Store,
};
use core::{panic::AssertUnwindSafe, time::Duration};
use futures::FutureExt;
use std::sync::Arc;

/// What a call to [`Aggregator::try_aggregate`] did.
///
/// Only `Completed` means this caller performed the terminal write. Every
/// other variant is an expected, silent no-op.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AggregateOutcome {
    /// Another caller holds the aggregation lock.
    LockBusy,
    /// The calculation no longer exists.
    Missing,
    /// The calculation is already terminal.
    AlreadyFinalized(Status),
    /// Some chunks have not completed yet.
    Pending { completed: usize, total: usize },
    /// This call wrote the final result.
    Completed(CalculationResult),
}

/// Single-writer summary of a distributed calculation.
///
/// Any number of workers may call [`try_aggregate`](Self::try_aggregate)
/// concurrently. The named lock serializes them without blocking, and the
/// "still running, nothing pending" recheck performed *under* the lock closes
/// the window where two workers both observe the last chunk completing.
#[derive(Clone)]
pub struct Aggregator {
    store: Arc<dyn Store>,
    lock: Arc<dyn Lock>,
    lock_ttl: Duration,
}

impl Aggregator {
    pub fn new(store: Arc<dyn Store>, lock: Arc<dyn Lock>, lock_ttl: Duration) -> Self {
        Self {
            store,
            lock,
            lock_ttl,
        }
    }

    /// Writes the calculation's final result if every chunk is done.
    ///
    /// Returns immediately when the lock is held elsewhere. The lock is
    /// released on every path out of the critical section, including errors,
    /// panics and cancellation of this future.
    ///
    /// A chunk that completes while the lock is held here gets `LockBusy` and
    /// leaves the final write to the holder, so a `Pending` result is checked
    /// again after release and retried once nothing is left pending.
    #[tracing::instrument(skip(self))]
    pub async fn try_aggregate(&self, calculation_id: i64) -> Result<AggregateOutcome> {
        let key = aggregate_lock_key(calculation_id);
        loop {
            let outcome = self.aggregate_once(&key, calculation_id).await?;
            if matches!(outcome, AggregateOutcome::Pending { .. })
                && self.all_chunks_completed(calculation_id).await?
            {
                tracing::debug!("chunks completed while locked, retrying");
                continue;
            }
            return Ok(outcome);
        }
    }

    async fn aggregate_once(&self, key: &str, calculation_id: i64) -> Result<AggregateOutcome> {
        let Some(guard) = LockGuard::try_acquire(self.lock.clone(), key, self.lock_ttl).await?
        else {
            tracing::debug!("aggregation lock busy");
            return Ok(AggregateOutcome::LockBusy);
        };

        let outcome = AssertUnwindSafe(self.aggregate_locked(calculation_id))
            .catch_unwind()
            .await;

        match guard.release().await {
            Ok(true) => {}
            Ok(false) => tracing::warn!("aggregation lock expired before release"),
            Err(e) => tracing::warn!("failed to release aggregation lock: {e}"),
        }

        match outcome {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    async fn all_chunks_completed(&self, calculation_id: i64) -> Result<bool> {
        let chunks = self.store.chunks(calculation_id).await?;
        Ok(!chunks.is_empty() && chunks.iter().all(|c| c.is_completed()))
    }

    async fn aggregate_locked(&self, calculation_id: i64) -> Result<AggregateOutcome> {
        let Some(calculation) = self
            .store
            .find_calculation(CalculationRef::Id(calculation_id))
            .await?
        else {
            tracing::debug!("calculation no longer exists");
            return Ok(AggregateOutcome::Missing);
        };
        if calculation.status != Status::Running {
            tracing::debug!(status = %calculation.status, "calculation already finalized");
            return Ok(AggregateOutcome::AlreadyFinalized(calculation.status));
        }

        let chunks = self.store.chunks(calculation_id).await?;
        let completed = chunks.iter().filter(|c| c.is_completed()).count();
        if chunks.is_empty() || completed < chunks.len() {
            tracing::debug!(completed, total = chunks.len(), "chunks still pending");
            return Ok(AggregateOutcome::Pending {
                completed,
                total: chunks.len(),
            });
        }

        let (inside, total, duration_ms) = chunks.iter().fold((0, 0, 0), |acc, c| {
            (
                acc.0 + c.result_inside.unwrap_or_default(),
                acc.1 + c.result_total.unwrap_or_default(),
                acc.2 + c.duration_ms.unwrap_or_default(),
            )
        });
        let result = CalculationResult::from_counts(inside, total, duration_ms);

        if !self.store.complete_calculation(calculation_id, result).await? {
            let status = self
                .store
                .find_calculation(CalculationRef::Id(calculation_id))
                .await?
                .map_or(Status::Completed, |c| c.status);
            tracing::debug!(%status, "lost the final write to a concurrent aggregator");
            return Ok(AggregateOutcome::AlreadyFinalized(status));
        }

        tracing::info!(
            monotonic_counter.aggregations = 1_u64,
            pi = result.pi,
            inside,
            total,
            duration_ms,
            chunks = chunks.len(),
            "calculation aggregated"
        );
        Ok(AggregateOutcome::Completed(result))
    }
}
