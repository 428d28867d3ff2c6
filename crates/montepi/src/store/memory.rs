use super::Store;
use crate::{
    Error, Result,
    model::{
        Calculation, CalculationRef, CalculationResult, Chunk, ChunkStatus, NewCalculation,
        Status,
    },
    sampler::Sample,
};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Default)]
struct Tables {
    next_id: i64,
    calculations: BTreeMap<i64, Calculation>,
    chunks: BTreeMap<(i64, u32), Chunk>,
}

/// Process-local [`Store`] guarded by a single mutex.
///
/// Every method holds the lock for the whole read-check-write, which gives
/// the same atomicity the SQL conditional updates provide.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_calculation(&self, new: NewCalculation) -> Result<Calculation> {
        let mut tables = self.tables.lock();
        tables.next_id += 1;
        let now = Utc::now();
        let calculation = Calculation {
            id: tables.next_id,
            uuid: Uuid::new_v4(),
            total_points: new.total_points,
            mode: new.mode,
            status: Status::Running,
            result_pi: None,
            result_inside: None,
            result_total: None,
            duration_ms: None,
            created_at: now,
            updated_at: now,
        };
        tables
            .calculations
            .insert(calculation.id, calculation.clone());
        Ok(calculation)
    }

    async fn find_calculation(&self, reference: CalculationRef) -> Result<Option<Calculation>> {
        let tables = self.tables.lock();
        let found = match reference {
            CalculationRef::Id(id) => tables.calculations.get(&id),
            CalculationRef::Token(uuid) => tables.calculations.values().find(|c| c.uuid == uuid),
        };
        Ok(found.cloned())
    }

    async fn complete_calculation(&self, id: i64, result: CalculationResult) -> Result<bool> {
        let mut tables = self.tables.lock();
        let Some(calculation) = tables.calculations.get_mut(&id) else {
            return Ok(false);
        };
        if calculation.status != Status::Running {
            return Ok(false);
        }
        calculation.status = Status::Completed;
        calculation.result_pi = Some(result.pi);
        calculation.result_inside = Some(result.inside);
        calculation.result_total = Some(result.total);
        calculation.duration_ms = Some(result.duration_ms);
        calculation.updated_at = Utc::now();
        Ok(true)
    }

    async fn fail_calculation(&self, id: i64) -> Result<bool> {
        let mut tables = self.tables.lock();
        let Some(calculation) = tables.calculations.get_mut(&id) else {
            return Ok(false);
        };
        if !calculation.status.can_transition_to(Status::Failed) {
            return Ok(false);
        }
        calculation.status = Status::Failed;
        calculation.updated_at = Utc::now();
        Ok(true)
    }

    async fn delete_calculation(&self, id: i64) -> Result<bool> {
        let mut tables = self.tables.lock();
        tables.chunks.retain(|(owner, _), _| *owner != id);
        Ok(tables.calculations.remove(&id).is_some())
    }

    async fn create_chunks(&self, calculation_id: i64, sizes: &[u64]) -> Result<Vec<Chunk>> {
        let mut tables = self.tables.lock();
        if !tables.calculations.contains_key(&calculation_id) {
            return Err(Error::Storage {
                context: format!("calculation {calculation_id} does not exist"),
            });
        }
        if tables.chunks.keys().any(|(owner, _)| *owner == calculation_id) {
            return Err(Error::Storage {
                context: format!("calculation {calculation_id} already has chunks"),
            });
        }

        let mut created = Vec::with_capacity(sizes.len());
        for (index, &points) in sizes.iter().enumerate() {
            let index = u32::try_from(index).map_err(|_| Error::Storage {
                context: "chunk index overflow".to_string(),
            })?;
            created.push(Chunk::pending(calculation_id, index, points));
        }
        for chunk in &created {
            tables
                .chunks
                .insert((calculation_id, chunk.chunk_index), chunk.clone());
        }
        Ok(created)
    }

    async fn delete_chunks(&self, calculation_id: i64) -> Result<u64> {
        let mut tables = self.tables.lock();
        let before = tables.chunks.len();
        tables.chunks.retain(|(owner, _), _| *owner != calculation_id);
        Ok((before - tables.chunks.len()) as u64)
    }

    async fn find_chunk(&self, calculation_id: i64, chunk_index: u32) -> Result<Option<Chunk>> {
        Ok(self
            .tables
            .lock()
            .chunks
            .get(&(calculation_id, chunk_index))
            .cloned())
    }

    async fn complete_chunk(
        &self,
        calculation_id: i64,
        chunk_index: u32,
        sample: Sample,
    ) -> Result<bool> {
        let mut tables = self.tables.lock();
        let Some(chunk) = tables.chunks.get_mut(&(calculation_id, chunk_index)) else {
            return Ok(false);
        };
        if chunk.is_completed() {
            return Ok(false);
        }
        chunk.result_inside = Some(sample.inside);
        chunk.result_total = Some(sample.total);
        chunk.duration_ms = Some(sample.duration_ms);
        chunk.status = ChunkStatus::Completed;
        Ok(true)
    }

    async fn chunks(&self, calculation_id: i64) -> Result<Vec<Chunk>> {
        let tables = self.tables.lock();
        Ok(tables
            .chunks
            .range((calculation_id, 0)..=(calculation_id, u32::MAX))
            .map(|(_, chunk)| chunk.clone())
            .collect())
    }

    async fn recent_completed(&self, limit: u32) -> Result<Vec<Calculation>> {
        let tables = self.tables.lock();
        let mut completed: Vec<_> = tables
            .calculations
            .values()
            .filter(|c| c.status == Status::Completed)
            .cloned()
            .collect();
        completed.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        completed.truncate(limit as usize);
        Ok(completed)
    }
}
