use super::worker::{WorkerContext, worker_loop};
use crate::{Error, Result};
use core::time::Duration;
use parking_lot::Mutex;
use tokio::{task::JoinHandle, time::timeout};
use tokio_util::sync::CancellationToken;

/// A set of [`worker_loop`] tasks with coordinated shutdown.
pub struct WorkerPool {
    handles: Mutex<Vec<(usize, JoinHandle<()>)>>,
    shutdown_token: CancellationToken,
    shutdown_timeout: Duration,
}

impl WorkerPool {
    /// Spawns `num_workers` workers (at least one) on the current runtime.
    pub fn spawn(num_workers: usize, ctx: WorkerContext) -> Self {
        let shutdown_token = CancellationToken::new();
        let shutdown_timeout = ctx.config.shutdown_timeout;

        let handles = (0..num_workers.max(1))
            .map(|worker_id| {
                let handle = tokio::spawn(worker_loop(
                    worker_id,
                    ctx.clone(),
                    shutdown_token.child_token(),
                ));
                (worker_id, handle)
            })
            .collect();

        tracing::info!(num_workers = num_workers.max(1), "worker pool started");

        Self {
            handles: Mutex::new(handles),
            shutdown_token,
            shutdown_timeout,
        }
    }

    pub fn len(&self) -> usize {
        self.handles.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.lock().is_empty()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    /// Stops every worker.
    ///
    /// Cancels the shared token, then waits up to `shutdown_timeout` for each
    /// worker to finish. A worker that does not stop in time is aborted; any
    /// job it held is redelivered once its reservation expires.
    ///
    /// Calling this more than once is harmless.
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("Stopping workers");
        self.shutdown_token.cancel();

        let handles = core::mem::take(&mut *self.handles.lock());
        let waits = handles.into_iter().map(|(id, mut handle)| async move {
            match timeout(self.shutdown_timeout, &mut handle).await {
                Ok(Ok(())) => {
                    tracing::trace!("Worker {id} shutdown acknowledged");
                    Ok(())
                }
                Ok(Err(e)) => {
                    tracing::error!("Worker {id} returned error: {e}");
                    Err(Error::from(e))
                }
                Err(_) => {
                    tracing::warn!("Worker {id} shutdown timed out");
                    handle.abort();
                    Ok(())
                }
            }
        });

        let results = futures::future::join_all(waits).await;
        tracing::info!("Worker pool shutdown complete");
        results.into_iter().collect()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown_token.cancel();
    }
}
