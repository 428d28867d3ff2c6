//! Error types for the estimation engine.
//!
//! This module defines the central `Error` enum, which captures every
//! reportable failure inside the engine: request validation, storage and queue
//! failures, worker execution failures and shutdown. Expected races during
//! aggregation (lock contention, chunks still pending, already finalized) are
//! *not* errors; they are reported through
//! [`AggregateOutcome`](crate::engine::AggregateOutcome).
//!
//! ## Error Cases
//! - `InvalidRequest`: the caller supplied an out-of-bounds point count or an
//!   unknown mode. Raised before any state is created.
//! - `NotFound`: no calculation matches the given id or token.
//! - `ChunkMissing`: a queued job refers to a chunk row that does not exist.
//!   This indicates state corruption and is never swallowed.
//! - `Storage` / `Queue`: the backing collaborator failed.
//! - `Sampling`: the blocking sampler task panicked or was cancelled.
//! - `Timeout`: a job exceeded its execution budget.
//! - `ServiceShutdown`: work arrived while the service was shutting down.

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the estimation engine.
#[derive(Clone, thiserror::Error, Debug, PartialEq)]
pub enum Error {
    /// The caller's request was malformed or out of bounds.
    #[error("Invalid request: {field}: {reason}")]
    InvalidRequest { field: &'static str, reason: String },

    /// No calculation matches the reference.
    #[error("Calculation {reference} not found")]
    NotFound { reference: String },

    /// A job referenced a chunk row that does not exist.
    #[error("Chunk {chunk_index} of calculation {calculation_id} is missing")]
    ChunkMissing {
        calculation_id: i64,
        chunk_index: u32,
    },

    /// The persistence layer failed.
    #[error("Storage error: {context}")]
    Storage { context: String },

    /// The job queue failed.
    #[error("Queue error: {context}")]
    Queue { context: String },

    /// The sampler task could not run to completion.
    #[error("Sampling failed: {context}")]
    Sampling { context: String },

    /// A job ran past its execution budget.
    #[error("Job timed out after {seconds}s")]
    Timeout { seconds: u64 },

    /// The service is in the process of shutting down.
    #[error("Service is shutting down")]
    ServiceShutdown,
}

impl Error {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            field,
            reason: reason.into(),
        }
    }

    /// Whether the error was caused by the caller rather than the system.
    pub const fn is_client_error(&self) -> bool {
        matches!(self, Self::InvalidRequest { .. } | Self::NotFound { .. })
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Self::Storage {
            context: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Queue {
            context: format!("payload encoding: {err}"),
        }
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Sampling {
            context: err.to_string(),
        }
    }
}
