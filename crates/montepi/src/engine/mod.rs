//! Distributed execution: dispatch, chunk workers and aggregation.
//!
//! A distributed calculation flows through three stages:
//!
//! 1. [`Dispatcher`] persists the chunk plan and enqueues one job per chunk.
//! 2. [`ChunkWorker`] samples a chunk and stores its result, at most once per
//!    chunk no matter how often the job is delivered.
//! 3. [`Aggregator`] sums the chunks into the calculation's final result,
//!    exactly once, after the last chunk lands.

mod aggregator;
mod dispatch;
mod worker;

pub use aggregator::{AggregateOutcome, Aggregator};
pub use dispatch::Dispatcher;
pub use worker::{ChunkOutcome, ChunkWorker};
