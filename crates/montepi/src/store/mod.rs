//! Persistence of calculations and chunks.
//!
//! The [`Store`] trait is the only way the engine reads or writes state.
//! Every mutating method is a single atomic, *conditional* update: it reports
//! whether the row was actually in the expected prior state. This is what
//! makes redelivered jobs and racing aggregators harmless.
//!
//! - [`MemoryStore`] - process-local, for tests and single-node deployments.
//! - [`SqliteStore`] - shared SQLite database; several processes may run
//!   workers against the same file.

mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::{
    Result,
    model::{Calculation, CalculationRef, CalculationResult, Chunk, NewCalculation},
    sampler::Sample,
};
use async_trait::async_trait;

#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Inserts a calculation in the `running` state with a fresh token.
    async fn create_calculation(&self, new: NewCalculation) -> Result<Calculation>;

    async fn find_calculation(&self, reference: CalculationRef) -> Result<Option<Calculation>>;

    /// Writes the terminal `completed` state if the calculation is still
    /// `running`. Returns `false` when another writer got there first.
    async fn complete_calculation(&self, id: i64, result: CalculationResult) -> Result<bool>;

    /// Moves a non-terminal calculation to `failed`.
    async fn fail_calculation(&self, id: i64) -> Result<bool>;

    /// Removes a calculation together with its chunks.
    async fn delete_calculation(&self, id: i64) -> Result<bool>;

    /// Creates one `pending` chunk per entry of `sizes`, indexed from zero.
    ///
    /// All-or-nothing: on error no chunk row for the calculation is left
    /// behind by this call.
    async fn create_chunks(&self, calculation_id: i64, sizes: &[u64]) -> Result<Vec<Chunk>>;

    async fn delete_chunks(&self, calculation_id: i64) -> Result<u64>;

    async fn find_chunk(&self, calculation_id: i64, chunk_index: u32) -> Result<Option<Chunk>>;

    /// Stores a chunk's result if the chunk is still `pending`.
    async fn complete_chunk(
        &self,
        calculation_id: i64,
        chunk_index: u32,
        sample: Sample,
    ) -> Result<bool>;

    /// All chunks of a calculation ordered by index.
    async fn chunks(&self, calculation_id: i64) -> Result<Vec<Chunk>>;

    /// Completed calculations, newest first.
    async fn recent_completed(&self, limit: u32) -> Result<Vec<Calculation>>;
}
