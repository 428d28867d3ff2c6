use crate::{
    EngineConfig, Error,
    engine::ChunkWorker,
    queue::{Delivery, JobQueue},
    store::Store,
};
use std::sync::Arc;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

/// Everything a worker task needs, shared by all workers of a pool.
#[derive(Clone)]
pub struct WorkerContext {
    pub queue: Arc<dyn JobQueue>,
    pub store: Arc<dyn Store>,
    pub worker: ChunkWorker,
    pub config: EngineConfig,
}

/// Worker task that drains the chunk queue until `shutdown` is cancelled.
///
/// An empty queue is polled again after `idle_backoff`. Queue errors are
/// logged and retried after the same backoff.
///
/// On cancellation a job in progress is released back to the queue instead
/// of being dropped. If even that fails, its reservation expires and the job
/// is redelivered.
pub async fn worker_loop(worker_id: usize, ctx: WorkerContext, shutdown: CancellationToken) {
    tracing::trace!("Worker {worker_id} started");
    let visibility = ctx.config.visibility();

    loop {
        let reserved = tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            reserved = ctx.queue.reserve(visibility) => reserved,
        };

        match reserved {
            Ok(Some(delivery)) => process(worker_id, &ctx, &shutdown, delivery).await,
            Ok(None) => {
                tokio::select! {
                    biased;
                    () = shutdown.cancelled() => break,
                    () = sleep(ctx.config.idle_backoff) => {}
                }
            }
            Err(e) => {
                tracing::warn!("Worker {worker_id} failed to reserve a job: {e}");
                tokio::select! {
                    biased;
                    () = shutdown.cancelled() => break,
                    () = sleep(ctx.config.idle_backoff) => {}
                }
            }
        }
    }

    tracing::trace!("Worker {worker_id} stopped");
}

#[tracing::instrument(
    skip_all,
    fields(
        worker_id = worker_id,
        job_id = delivery.id,
        attempt = delivery.attempts,
        calculation_id = delivery.job.calculation_id,
        chunk_index = delivery.job.chunk_index,
    )
)]
async fn process(
    worker_id: usize,
    ctx: &WorkerContext,
    shutdown: &CancellationToken,
    delivery: Delivery,
) {
    let job_timeout = ctx.config.job_timeout;
    let result = tokio::select! {
        biased;
        () = shutdown.cancelled() => {
            tracing::debug!("shutdown during job, releasing it");
            if let Err(e) = ctx.queue.release(&delivery).await {
                tracing::warn!("failed to release job on shutdown: {e}");
            }
            return;
        }
        result = timeout(job_timeout, ctx.worker.handle(delivery.job)) => result,
    };

    let failure = match result {
        Ok(Ok(outcome)) => {
            tracing::trace!(?outcome, "job done");
            if let Err(e) = ctx.queue.ack(&delivery).await {
                tracing::warn!("failed to acknowledge job: {e}");
            }
            return;
        }
        Ok(Err(e)) => e,
        Err(_) => Error::Timeout {
            seconds: job_timeout.as_secs(),
        },
    };

    let permanent = matches!(failure, Error::ChunkMissing { .. });
    if permanent || delivery.attempts >= ctx.config.max_attempts {
        bury(ctx, &delivery, &failure).await;
    } else {
        tracing::warn!("job failed, releasing for retry: {failure}");
        if let Err(e) = ctx.queue.release(&delivery).await {
            tracing::warn!("failed to release job: {e}");
        }
    }
}

async fn bury(ctx: &WorkerContext, delivery: &Delivery, failure: &Error) {
    tracing::error!(
        monotonic_counter.jobs_dead_lettered = 1_u64,
        "job dead-lettered: {failure}"
    );
    if let Err(e) = ctx.queue.bury(delivery, &failure.to_string()).await {
        tracing::error!("failed to dead-letter job: {e}");
    }
    // A chunk that never completes would leave the calculation running forever.
    match ctx.store.fail_calculation(delivery.job.calculation_id).await {
        Ok(true) => tracing::warn!("calculation marked failed"),
        Ok(false) => {}
        Err(e) => tracing::error!("failed to mark calculation failed: {e}"),
    }
}
