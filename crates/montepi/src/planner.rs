//! Partitioning of a point budget into chunks.
//!
//! The planner targets roughly [`TARGET_CHUNK_POINTS`] per chunk, clamps the
//! chunk count to `[MIN_CHUNKS, MAX_CHUNKS]`, then caps it so no chunk falls
//! below [`MIN_CHUNK_POINTS`]. Budgets too small for two minimum-sized chunks
//! degrade to a single chunk. Sizes differ by at most one point and always
//! sum to the budget.

use crate::{
    Result,
    common::{MAX_CHUNKS, MIN_CHUNK_POINTS, MIN_CHUNKS, TARGET_CHUNK_POINTS, validate_points},
};

/// Number of chunks for a budget of `total_points`.
pub fn chunk_count(total_points: u64) -> u64 {
    let by_target = total_points
        .div_ceil(TARGET_CHUNK_POINTS)
        .clamp(MIN_CHUNKS, MAX_CHUNKS);
    let by_floor = (total_points / MIN_CHUNK_POINTS).max(1);
    by_target.min(by_floor)
}

/// Splits `total_points` into index-aligned chunk sizes.
///
/// The first `total_points % k` chunks carry one extra point.
///
/// # Errors
///
/// Returns [`Error::InvalidRequest`](crate::Error::InvalidRequest) when the
/// budget lies outside `[MIN_POINTS, MAX_POINTS]`.
pub fn plan(total_points: u64) -> Result<Vec<u64>> {
    let total_points = validate_points(total_points)?;
    Ok(split(total_points, chunk_count(total_points)))
}

fn split(total_points: u64, chunks: u64) -> Vec<u64> {
    let base = total_points / chunks;
    let remainder = total_points - base * chunks;
    (0..chunks)
        .map(|i| base + u64::from(i < remainder))
        .collect()
}
