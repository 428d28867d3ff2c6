#![doc = include_str!("../README.md")]

mod common;
pub mod engine;
pub mod lock;
pub mod model;
pub mod planner;
pub mod pool;
pub mod progress;
pub mod queue;
pub mod sampler;
mod service;
pub mod store;

#[cfg(test)]
mod tests;

pub use common::*;
pub use engine::{AggregateOutcome, ChunkOutcome};
pub use model::{Calculation, CalculationRef, CalculationResult, Chunk, HistoryEntry, Mode, Status};
pub use pool::WorkerPool;
pub use progress::Snapshot;
pub use service::{CalculationService, SubmitRequest, Submission};
