//! Periodic progress snapshots for a single calculation.
//!
//! [`capture`] builds one read-only [`Snapshot`] from the store. [`subscribe`]
//! spawns a feed task that captures a snapshot every `stream_interval`, pushes
//! it into a bounded channel and stops when the calculation reaches a terminal
//! state, when `stream_max_ticks` snapshots have been sent, or when the
//! subscriber goes away. Publishing never writes to the store.

use crate::{
    EngineConfig, Error, Result,
    model::{Calculation, CalculationRef, Status},
    sampler::estimate_pi,
    store::Store,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::{
    sync::mpsc,
    time::{MissedTickBehavior, interval},
};
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

/// Point-in-time view of a calculation's progress.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    pub id: i64,
    pub uuid: Uuid,
    pub status: Status,
    pub completed_chunks: usize,
    pub total_chunks: usize,
    /// Estimate over the completed chunks so far, `0.0` before any complete.
    pub partial_pi: f64,
    pub inside_count: u64,
    pub total_count: u64,
    pub result_pi: Option<f64>,
    pub duration_ms: Option<u64>,
}

impl Snapshot {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Captures the current progress of `reference`.
pub async fn capture(store: &dyn Store, reference: CalculationRef) -> Result<Snapshot> {
    let calculation = store
        .find_calculation(reference)
        .await?
        .ok_or_else(|| Error::NotFound {
            reference: reference.to_string(),
        })?;
    snapshot_of(store, calculation).await
}

async fn snapshot_of(store: &dyn Store, calculation: Calculation) -> Result<Snapshot> {
    let chunks = store.chunks(calculation.id).await?;

    let (completed_chunks, inside_count, total_count) = if chunks.is_empty() {
        // Single mode keeps its counts on the calculation itself.
        (
            0,
            calculation.result_inside.unwrap_or_default(),
            calculation.result_total.unwrap_or_default(),
        )
    } else {
        chunks
            .iter()
            .filter(|c| c.is_completed())
            .fold((0, 0, 0), |(n, inside, total), c| {
                (
                    n + 1,
                    inside + c.result_inside.unwrap_or_default(),
                    total + c.result_total.unwrap_or_default(),
                )
            })
    };

    Ok(Snapshot {
        id: calculation.id,
        uuid: calculation.uuid,
        status: calculation.status,
        completed_chunks,
        total_chunks: chunks.len(),
        partial_pi: estimate_pi(inside_count, total_count),
        inside_count,
        total_count,
        result_pi: calculation.result_pi,
        duration_ms: calculation.duration_ms,
    })
}

/// Starts publishing snapshots of `reference`.
///
/// The calculation is resolved up front so an unknown reference fails here
/// rather than producing an empty stream. The first snapshot is sent
/// immediately.
pub async fn subscribe(
    store: Arc<dyn Store>,
    reference: CalculationRef,
    config: &EngineConfig,
) -> Result<ReceiverStream<Snapshot>> {
    let first = capture(store.as_ref(), reference).await?;
    let (tx, rx) = mpsc::channel(config.stream_buffer_size.max(1));

    let fut = feed_snapshots(
        store,
        CalculationRef::Id(first.id),
        first,
        tx,
        config.clone(),
    );
    let fut = {
        use tracing::Instrument;
        let span = tracing::info_span!("progress", calculation = %reference);
        fut.instrument(span)
    };
    tokio::spawn(fut);

    Ok(ReceiverStream::new(rx))
}

async fn feed_snapshots(
    store: Arc<dyn Store>,
    reference: CalculationRef,
    first: Snapshot,
    tx: mpsc::Sender<Snapshot>,
    config: EngineConfig,
) {
    let mut ticker = interval(config.stream_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately and stands for `first`.
    ticker.tick().await;

    let mut snapshot = first;
    let mut sent = 0;

    loop {
        let terminal = snapshot.is_terminal();
        if tx.send(snapshot).await.is_err() {
            tracing::debug!("subscriber went away");
            return;
        }
        sent += 1;
        if terminal {
            tracing::debug!(sent, "calculation finished, closing stream");
            return;
        }
        if sent >= config.stream_max_ticks {
            tracing::debug!(sent, "snapshot limit reached, closing stream");
            return;
        }

        tokio::select! {
            _ = ticker.tick() => {}
            () = tx.closed() => {
                tracing::debug!("subscriber went away");
                return;
            }
        }

        snapshot = match capture(store.as_ref(), reference).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!("progress capture failed: {e}");
                return;
            }
        };
    }
}
