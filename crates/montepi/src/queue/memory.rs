use super::{ChunkJob, DeadLetter, Delivery, JobQueue};
use crate::Result;
use async_trait::async_trait;
use chrono::Utc;
use core::time::Duration;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use tokio::time::Instant;

struct Envelope {
    id: i64,
    job: ChunkJob,
    attempts: u32,
}

#[derive(Default)]
struct Lanes {
    next_id: i64,
    ready: VecDeque<Envelope>,
    reserved: BTreeMap<i64, (Envelope, Instant)>,
    dead: Vec<DeadLetter>,
}

impl Lanes {
    /// Moves reservations older than `visibility` back to the head of the
    /// ready lane, oldest job first.
    fn reclaim_expired(&mut self, now: Instant, visibility: Duration) {
        let expired: Vec<i64> = self
            .reserved
            .iter()
            .filter(|(_, (_, reserved_at))| *reserved_at + visibility <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired.into_iter().rev() {
            if let Some((envelope, _)) = self.reserved.remove(&id) {
                tracing::debug!(job_id = id, "reservation expired, redelivering");
                self.ready.push_front(envelope);
            }
        }
    }

    /// Removes the job `delivery` refers to, unless it has been reserved
    /// again since.
    fn take(&mut self, delivery: &Delivery) -> Option<Envelope> {
        match self.reserved.get(&delivery.id).map(|(e, _)| e.attempts) {
            Some(attempts) if attempts == delivery.attempts => {
                return self.reserved.remove(&delivery.id).map(|(e, _)| e);
            }
            Some(_) => return None,
            None => {}
        }
        let position = self
            .ready
            .iter()
            .position(|e| e.id == delivery.id && e.attempts == delivery.attempts)?;
        self.ready.remove(position)
    }
}

/// Process-local [`JobQueue`].
#[derive(Default)]
pub struct MemoryQueue {
    lanes: Mutex<Lanes>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn push_batch(&self, jobs: &[ChunkJob]) -> Result<()> {
        let mut lanes = self.lanes.lock();
        for &job in jobs {
            lanes.next_id += 1;
            let id = lanes.next_id;
            lanes.ready.push_back(Envelope {
                id,
                job,
                attempts: 0,
            });
        }
        Ok(())
    }

    async fn reserve(&self, visibility: Duration) -> Result<Option<Delivery>> {
        let now = Instant::now();
        let mut lanes = self.lanes.lock();
        lanes.reclaim_expired(now, visibility);

        let Some(mut envelope) = lanes.ready.pop_front() else {
            return Ok(None);
        };
        envelope.attempts += 1;
        let delivery = Delivery {
            id: envelope.id,
            job: envelope.job,
            attempts: envelope.attempts,
        };
        lanes.reserved.insert(envelope.id, (envelope, now));
        Ok(Some(delivery))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        if self.lanes.lock().take(delivery).is_none() {
            tracing::debug!(job_id = delivery.id, "stale ack ignored");
        }
        Ok(())
    }

    async fn release(&self, delivery: &Delivery) -> Result<()> {
        let mut lanes = self.lanes.lock();
        let current = lanes
            .reserved
            .get(&delivery.id)
            .is_some_and(|(envelope, _)| envelope.attempts == delivery.attempts);
        if current {
            if let Some((envelope, _)) = lanes.reserved.remove(&delivery.id) {
                lanes.ready.push_back(envelope);
            }
        }
        Ok(())
    }

    async fn bury(&self, delivery: &Delivery, error: &str) -> Result<()> {
        let mut lanes = self.lanes.lock();
        let Some(envelope) = lanes.take(delivery) else {
            tracing::debug!(job_id = delivery.id, "stale bury ignored");
            return Ok(());
        };
        lanes.dead.push(DeadLetter {
            job: envelope.job,
            attempts: envelope.attempts,
            error: error.to_string(),
            failed_at: Utc::now(),
        });
        Ok(())
    }

    async fn len(&self) -> Result<usize> {
        let lanes = self.lanes.lock();
        Ok(lanes.ready.len() + lanes.reserved.len())
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
        Ok(self.lanes.lock().dead.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VISIBILITY: Duration = Duration::from_secs(600);

    fn job(index: u32) -> ChunkJob {
        ChunkJob {
            calculation_id: 1,
            chunk_index: index,
            chunk_points: 50_000,
        }
    }

    #[tokio::test]
    async fn delivers_in_fifo_order_once_until_acked() {
        let queue = MemoryQueue::new();
        queue.push_batch(&[job(0), job(1)]).await.unwrap();

        let first = queue.reserve(VISIBILITY).await.unwrap().unwrap();
        let second = queue.reserve(VISIBILITY).await.unwrap().unwrap();
        assert_eq!(first.job.chunk_index, 0);
        assert_eq!(second.job.chunk_index, 1);
        assert!(queue.reserve(VISIBILITY).await.unwrap().is_none());

        queue.ack(&first).await.unwrap();
        queue.ack(&second).await.unwrap();
        assert_eq!(queue.len().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unacked_job_is_redelivered_after_visibility() {
        let queue = MemoryQueue::new();
        queue.push_batch(&[job(0)]).await.unwrap();

        let first = queue.reserve(VISIBILITY).await.unwrap().unwrap();
        assert!(queue.reserve(VISIBILITY).await.unwrap().is_none());

        tokio::time::advance(VISIBILITY).await;
        let again = queue.reserve(VISIBILITY).await.unwrap().unwrap();
        assert_eq!(again.id, first.id);
        assert_eq!(again.attempts, 2);
    }

    #[tokio::test]
    async fn released_job_returns_with_attempts_kept() {
        let queue = MemoryQueue::new();
        queue.push_batch(&[job(0)]).await.unwrap();

        let first = queue.reserve(VISIBILITY).await.unwrap().unwrap();
        queue.release(&first).await.unwrap();
        let second = queue.reserve(VISIBILITY).await.unwrap().unwrap();
        assert_eq!(second.attempts, 2);

        queue.bury(&second, "boom").await.unwrap();
        assert_eq!(queue.len().await.unwrap(), 0);
        let dead = queue.dead_letters().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].attempts, 2);
        assert_eq!(dead[0].error, "boom");
    }

    #[tokio::test(start_paused = true)]
    async fn stale_delivery_cannot_touch_a_redelivered_job() {
        let queue = MemoryQueue::new();
        queue.push_batch(&[job(0)]).await.unwrap();

        let stale = queue.reserve(VISIBILITY).await.unwrap().unwrap();
        tokio::time::advance(VISIBILITY).await;
        let current = queue.reserve(VISIBILITY).await.unwrap().unwrap();
        assert_eq!(stale.id, current.id);

        queue.ack(&stale).await.unwrap();
        queue.release(&stale).await.unwrap();
        queue.bury(&stale, "late").await.unwrap();
        assert_eq!(queue.len().await.unwrap(), 1);
        assert!(queue.dead_letters().await.unwrap().is_empty());
        assert!(queue.reserve(VISIBILITY).await.unwrap().is_none());

        queue.ack(&current).await.unwrap();
        assert_eq!(queue.len().await.unwrap(), 0);
    }
}
