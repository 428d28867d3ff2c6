use super::{ChunkJob, DeadLetter, Delivery, JobQueue};
use crate::{
    Error, Result,
    store::sqlite::{from_millis, now_millis},
};
use async_trait::async_trait;
use core::time::Duration;
use sqlx::{Row, SqlitePool};

/// [`JobQueue`] over the `jobs` / `failed_jobs` tables.
///
/// Reservation is one `UPDATE ... RETURNING` statement, so two processes can
/// never reserve the same job within one visibility window.
#[derive(Clone)]
pub struct SqliteQueue {
    pool: SqlitePool,
    queue: String,
}

impl SqliteQueue {
    pub fn new(pool: SqlitePool, queue: impl Into<String>) -> Self {
        Self {
            pool,
            queue: queue.into(),
        }
    }
}

fn attempts_from_db(attempts: i64) -> Result<u32> {
    u32::try_from(attempts).map_err(|_| Error::Queue {
        context: format!("invalid attempt count {attempts}"),
    })
}

#[async_trait]
impl JobQueue for SqliteQueue {
    async fn push_batch(&self, jobs: &[ChunkJob]) -> Result<()> {
        let now = now_millis();
        let mut tx = self.pool.begin().await?;
        for job in jobs {
            sqlx::query(
                "INSERT INTO jobs (queue, payload, attempts, available_at, created_at) \
                 VALUES (?, ?, 0, ?, ?)",
            )
            .bind(self.queue.as_str())
            .bind(serde_json::to_string(job)?)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn reserve(&self, visibility: Duration) -> Result<Option<Delivery>> {
        let now = now_millis();
        let window = i64::try_from(visibility.as_millis()).unwrap_or(i64::MAX);
        let row = sqlx::query(
            "UPDATE jobs SET reserved_at = ?, attempts = attempts + 1 \
             WHERE id = (SELECT id FROM jobs WHERE queue = ? AND available_at <= ? \
                 AND (reserved_at IS NULL OR reserved_at <= ?) ORDER BY id LIMIT 1) \
             RETURNING id, payload, attempts",
        )
        .bind(now)
        .bind(self.queue.as_str())
        .bind(now)
        .bind(now.saturating_sub(window))
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let payload: String = row.try_get("payload")?;
        Ok(Some(Delivery {
            id: row.try_get("id")?,
            job: serde_json::from_str(&payload)?,
            attempts: attempts_from_db(row.try_get("attempts")?)?,
        }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let acked = sqlx::query("DELETE FROM jobs WHERE id = ? AND attempts = ?")
            .bind(delivery.id)
            .bind(i64::from(delivery.attempts))
            .execute(&self.pool)
            .await?;
        if acked.rows_affected() == 0 {
            tracing::debug!(job_id = delivery.id, "stale ack ignored");
        }
        Ok(())
    }

    async fn release(&self, delivery: &Delivery) -> Result<()> {
        sqlx::query(
            "UPDATE jobs SET reserved_at = NULL, available_at = ? WHERE id = ? AND attempts = ?",
        )
        .bind(now_millis())
        .bind(delivery.id)
        .bind(i64::from(delivery.attempts))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn bury(&self, delivery: &Delivery, error: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let taken = sqlx::query("DELETE FROM jobs WHERE id = ? AND attempts = ?")
            .bind(delivery.id)
            .bind(i64::from(delivery.attempts))
            .execute(&mut *tx)
            .await?;
        if taken.rows_affected() == 0 {
            tracing::debug!(job_id = delivery.id, "stale bury ignored");
            return Ok(());
        }
        sqlx::query(
            "INSERT INTO failed_jobs (queue, payload, attempts, error, failed_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(self.queue.as_str())
        .bind(serde_json::to_string(&delivery.job)?)
        .bind(i64::from(delivery.attempts))
        .bind(error)
        .bind(now_millis())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn len(&self) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE queue = ?")
            .bind(self.queue.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
        let rows = sqlx::query(
            "SELECT payload, attempts, error, failed_at FROM failed_jobs \
             WHERE queue = ? ORDER BY id",
        )
        .bind(self.queue.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let payload: String = row.try_get("payload")?;
                Ok(DeadLetter {
                    job: serde_json::from_str(&payload)?,
                    attempts: attempts_from_db(row.try_get("attempts")?)?,
                    error: row.try_get("error")?,
                    failed_at: from_millis(row.try_get("failed_at")?)?,
                })
            })
            .collect()
    }
}
