use super::{Lock, LockToken};
use crate::{Result, store::sqlite::now_millis};
use async_trait::async_trait;
use core::time::Duration;
use sqlx::SqlitePool;

/// [`Lock`] stored as one row per key in `cache_locks`.
///
/// Acquisition is a single upsert that only overwrites an expired row, so
/// concurrent processes race on SQLite's write lock rather than on a
/// read-then-write.
#[derive(Clone)]
pub struct SqliteLock {
    pool: SqlitePool,
}

impl SqliteLock {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Lock for SqliteLock {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockToken>> {
        let token = LockToken::new(key);
        let now = now_millis();
        let expires_at = now.saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX));

        let acquired = sqlx::query(
            "INSERT INTO cache_locks (key, owner, expires_at) VALUES (?, ?, ?) \
             ON CONFLICT (key) DO UPDATE SET owner = excluded.owner, \
             expires_at = excluded.expires_at WHERE cache_locks.expires_at <= ?",
        )
        .bind(key)
        .bind(token.owner())
        .bind(expires_at)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok((acquired.rows_affected() == 1).then_some(token))
    }

    async fn release(&self, token: &LockToken) -> Result<bool> {
        let released = sqlx::query("DELETE FROM cache_locks WHERE key = ? AND owner = ?")
            .bind(token.key())
            .bind(token.owner())
            .execute(&self.pool)
            .await?;
        Ok(released.rows_affected() == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::sqlite::connect;

    #[tokio::test]
    async fn one_holder_at_a_time() {
        let lock = SqliteLock::new(connect("sqlite::memory:").await.unwrap());
        let ttl = Duration::from_secs(10);

        let token = lock.try_acquire("agg", ttl).await.unwrap().unwrap();
        assert!(lock.try_acquire("agg", ttl).await.unwrap().is_none());

        assert!(lock.release(&token).await.unwrap());
        assert!(!lock.release(&token).await.unwrap());
        assert!(lock.try_acquire("agg", ttl).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn zero_ttl_lock_is_immediately_reclaimable() {
        let lock = SqliteLock::new(connect("sqlite::memory:").await.unwrap());

        let stale = lock.try_acquire("agg", Duration::ZERO).await.unwrap().unwrap();
        let fresh = lock
            .try_acquire("agg", Duration::from_secs(10))
            .await
            .unwrap()
            .unwrap();

        assert!(!lock.release(&stale).await.unwrap());
        assert!(lock.release(&fresh).await.unwrap());
    }
}
