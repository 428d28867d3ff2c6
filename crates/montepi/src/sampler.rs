//! Monte Carlo sampling of the unit quarter-circle.
//!
//! A pure leaf routine: draw `n` points uniformly from `[0, 1)²` and count
//! how many fall inside `x² + y² <= 1`. Nothing here touches shared state, so
//! both the single-mode path and every chunk worker call the same code.

use crate::{Result, common::validate_points};
use rand::Rng;
use serde::Serialize;
use std::time::Instant;

/// Outcome of sampling a fixed number of points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Sample {
    pub inside: u64,
    pub total: u64,
    pub duration_ms: u64,
}

impl Sample {
    pub fn pi(&self) -> f64 {
        estimate_pi(self.inside, self.total)
    }
}

/// `4 * inside / total`, or `0.0` when nothing has been sampled.
pub fn estimate_pi(inside: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    4.0 * inside as f64 / total as f64
}

/// Counts the points inside the quarter-circle among `n` draws from `rng`.
pub fn count_inside<R: Rng + ?Sized>(rng: &mut R, n: u64) -> u64 {
    let mut inside = 0;
    for _ in 0..n {
        let x: f64 = rng.random();
        let y: f64 = rng.random();
        if x * x + y * y <= 1.0 {
            inside += 1;
        }
    }
    inside
}

/// Samples `n` points from `rng` and times the run.
pub fn sample_with<R: Rng + ?Sized>(rng: &mut R, n: u64) -> Sample {
    let start = Instant::now();
    let inside = count_inside(rng, n);
    Sample {
        inside,
        total: n,
        duration_ms: start.elapsed().as_millis() as u64,
    }
}

/// Samples `n` points from the thread-local generator.
pub fn sample(n: u64) -> Sample {
    sample_with(&mut rand::rng(), n)
}

/// Source of samples used by workers and the single-mode path.
///
/// Any `Fn(u64) -> Sample` qualifies, which lets callers swap in a seeded
/// generator. The default is [`sample`].
pub trait Sampler: Send + Sync + 'static {
    fn sample(&self, points: u64) -> Sample;
}

impl<F> Sampler for F
where
    F: Fn(u64) -> Sample + Send + Sync + 'static,
{
    fn sample(&self, points: u64) -> Sample {
        self(points)
    }
}

/// Single-pass estimation over a validated point budget.
///
/// This is the reference path distributed results are compared against.
pub fn calculate(total_points: u64) -> Result<Sample> {
    let total_points = validate_points(total_points)?;
    Ok(sample(total_points))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{MAX_POINTS, MIN_POINTS};
    use rand::{SeedableRng, rngs::StdRng};

    #[test]
    fn calculate_returns_counts_for_budget() {
        let sample = calculate(100_000).unwrap();
        assert_eq!(sample.total, 100_000);
        assert!(sample.inside <= sample.total);
        let pi = sample.pi();
        assert!(pi > 2.8 && pi < 3.5, "pi = {pi}");
    }

    #[test]
    fn large_sample_is_close() {
        let pi = calculate(1_000_000).unwrap().pi();
        assert!(pi > 3.0 && pi < 3.3, "pi = {pi}");
    }

    #[test]
    fn calculate_rejects_out_of_bounds() {
        assert!(calculate(MIN_POINTS - 1).is_err());
        assert!(calculate(MAX_POINTS + 1).is_err());
        assert!(calculate(50_000).is_err());
    }

    #[test]
    fn zero_points_estimate_zero() {
        let sample = sample(0);
        assert_eq!(sample.inside, 0);
        assert_eq!(sample.pi(), 0.0);
        assert!(!estimate_pi(0, 0).is_nan());
    }

    #[test]
    fn seeded_runs_split_like_one_run() {
        let mut whole = StdRng::seed_from_u64(7);
        let single = count_inside(&mut whole, 30_000);

        let mut split = StdRng::seed_from_u64(7);
        let parts: u64 = [10_001, 9_999, 10_000]
            .into_iter()
            .map(|n| count_inside(&mut split, n))
            .sum();

        assert_eq!(single, parts);
    }
}
