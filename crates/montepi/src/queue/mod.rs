//! Durable chunk-job queue with at-least-once delivery.
//!
//! A job is *reserved* by a worker for a visibility window. If the worker
//! neither acknowledges nor releases it before the window closes (crash,
//! hang), the job becomes deliverable again. Consumers must therefore be
//! idempotent. Jobs that keep failing are moved to a dead-letter list.
//!
//! ## Lifecycle
//!
//! - [`JobQueue::push_batch`] enqueues all jobs of one dispatch atomically.
//! - [`JobQueue::reserve`] hands out the oldest deliverable job and bumps its
//!   attempt counter.
//! - [`JobQueue::ack`] deletes a finished job.
//! - [`JobQueue::release`] makes a failed job deliverable again.
//! - [`JobQueue::bury`] moves a job to the dead-letter list.
//!
//! The last three act only while the job is still on the delivery's attempt.
//! A worker whose window lapsed cannot touch the job once it was reserved
//! again.

mod memory;
mod sqlite;

pub use memory::MemoryQueue;
pub use sqlite::SqliteQueue;

use crate::{Result, model::Chunk};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use core::time::Duration;
use serde::{Deserialize, Serialize};

/// Work item for one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkJob {
    pub calculation_id: i64,
    pub chunk_index: u32,
    pub chunk_points: u64,
}

impl From<&Chunk> for ChunkJob {
    fn from(chunk: &Chunk) -> Self {
        Self {
            calculation_id: chunk.calculation_id,
            chunk_index: chunk.chunk_index,
            chunk_points: chunk.total_points,
        }
    }
}

/// A reserved job. `attempts` counts this delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub id: i64,
    pub job: ChunkJob,
    pub attempts: u32,
}

/// A job that exhausted its retries or failed permanently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub job: ChunkJob,
    pub attempts: u32,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

#[async_trait]
pub trait JobQueue: Send + Sync + 'static {
    /// Enqueues every job or none of them.
    async fn push_batch(&self, jobs: &[ChunkJob]) -> Result<()>;

    /// Reserves the oldest deliverable job for `visibility`.
    ///
    /// Jobs whose previous reservation is older than `visibility` count as
    /// deliverable again.
    async fn reserve(&self, visibility: Duration) -> Result<Option<Delivery>>;

    async fn ack(&self, delivery: &Delivery) -> Result<()>;

    async fn release(&self, delivery: &Delivery) -> Result<()>;

    async fn bury(&self, delivery: &Delivery, error: &str) -> Result<()>;

    /// Jobs not yet acknowledged or buried, reserved ones included.
    async fn len(&self) -> Result<usize>;

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>>;
}
