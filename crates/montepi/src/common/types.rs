//! # Shared constants and engine configuration
//!
//! Bounds and tuning knobs shared by the planner, workers, aggregator and
//! progress publisher. Every duration and limit used at runtime lives in
//! [`EngineConfig`]; the constants are its defaults and the hard validation
//! bounds.

use core::time::Duration;

/// Smallest point budget a calculation may request.
pub const MIN_POINTS: u64 = 100_000;

/// Largest point budget a calculation may request.
pub const MAX_POINTS: u64 = 10_000_000;

/// Smallest chunk the planner will produce when splitting is possible.
pub const MIN_CHUNK_POINTS: u64 = 50_000;

/// Target number of points per chunk before clamping to the chunk range.
pub const TARGET_CHUNK_POINTS: u64 = 500_000;

/// Lower bound on chunk count for totals large enough to split.
pub const MIN_CHUNKS: u64 = 2;

/// Upper bound on chunk count.
pub const MAX_CHUNKS: u64 = 8;

/// Prefix of the lock key guarding aggregation of one calculation.
pub const AGGREGATE_LOCK_PREFIX: &str = "calculation_aggregate_";

/// Queue name chunk jobs are pushed to.
pub const CHUNK_QUEUE: &str = "chunks";

/// Runtime tuning for the engine.
///
/// Defaults mirror production settings: a short aggregation lock, a generous
/// job timeout, a one-second progress cadence capped at five minutes.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Time-to-live of the aggregation lock.
    pub lock_ttl: Duration,
    /// Execution budget of one chunk job before it is released for retry.
    pub job_timeout: Duration,
    /// Deliveries of one job before it is dead-lettered.
    pub max_attempts: u32,
    /// How long an idle worker waits before polling the queue again.
    pub idle_backoff: Duration,
    /// Cadence of progress snapshots.
    pub stream_interval: Duration,
    /// Hard ceiling on progress snapshots per stream.
    pub stream_max_ticks: u32,
    /// Buffered snapshots per stream before the publisher waits.
    pub stream_buffer_size: usize,
    /// Entries returned by history queries.
    pub history_limit: u32,
    /// How long shutdown waits for each worker to acknowledge.
    pub shutdown_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(10),
            job_timeout: Duration::from_secs(600),
            max_attempts: 3,
            idle_backoff: Duration::from_millis(200),
            stream_interval: Duration::from_secs(1),
            stream_max_ticks: 300,
            stream_buffer_size: 4,
            history_limit: 30,
            shutdown_timeout: Duration::from_secs(3),
        }
    }
}

impl EngineConfig {
    /// How long a reserved job stays invisible to other workers.
    ///
    /// Slightly longer than the job timeout so a live worker always times out
    /// and releases its job before anyone else can reserve it.
    pub fn visibility(&self) -> Duration {
        self.job_timeout + Duration::from_secs(30)
    }
}

/// Lock key guarding aggregation of `calculation_id`.
pub fn aggregate_lock_key(calculation_id: i64) -> String {
    format!("{AGGREGATE_LOCK_PREFIX}{calculation_id}")
}

/// Ensures a requested point budget lies within `[MIN_POINTS, MAX_POINTS]`.
pub fn validate_points(total_points: u64) -> crate::Result<u64> {
    if !(MIN_POINTS..=MAX_POINTS).contains(&total_points) {
        return Err(crate::Error::invalid(
            "total_points",
            format!("Total points must be between {MIN_POINTS} and {MAX_POINTS}"),
        ));
    }
    Ok(total_points)
}
