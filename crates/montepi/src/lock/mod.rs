//! Named mutual-exclusion locks with a time-to-live.
//!
//! `try_acquire` never waits: it either takes the lock or reports that
//! someone else holds it. Every acquisition is tagged with a random owner so
//! a holder whose TTL already expired cannot release a lock that has since
//! been taken by someone else. An expired lock is free for the next caller,
//! which bounds the damage of a holder that crashed without releasing.

mod memory;
mod sqlite;

pub use memory::MemoryLock;
pub use sqlite::SqliteLock;

use crate::Result;
use async_trait::async_trait;
use core::time::Duration;
use std::sync::Arc;
use uuid::Uuid;

/// Proof of ownership returned by a successful acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    key: String,
    owner: String,
}

impl LockToken {
    pub(crate) fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            owner: Uuid::new_v4().to_string(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }
}

#[async_trait]
pub trait Lock: Send + Sync + 'static {
    /// Takes `key` for at most `ttl`, or returns `None` if it is held.
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockToken>>;

    /// Releases the lock if `token` still owns it.
    ///
    /// Returns `false` when the lock had expired and changed hands.
    async fn release(&self, token: &LockToken) -> Result<bool>;
}

/// An acquired lock that is released when dropped.
///
/// [`release`](Self::release) is the normal exit. A guard dropped without it,
/// for example inside a cancelled future, spawns the release onto the current
/// runtime instead of leaving the key held until its TTL runs out.
pub struct LockGuard {
    lock: Arc<dyn Lock>,
    token: Option<LockToken>,
}

impl LockGuard {
    /// Takes `key` on `lock`, or returns `None` if it is held.
    pub async fn try_acquire(
        lock: Arc<dyn Lock>,
        key: &str,
        ttl: Duration,
    ) -> Result<Option<Self>> {
        let token = lock.try_acquire(key, ttl).await?;
        Ok(token.map(|token| Self {
            lock,
            token: Some(token),
        }))
    }

    /// Releases the lock now. See [`Lock::release`] for the return value.
    pub async fn release(mut self) -> Result<bool> {
        let Some(token) = self.token.clone() else {
            return Ok(false);
        };
        // Cancelled mid-release, the token is still set and `Drop` retries.
        let released = self.lock.release(&token).await;
        self.token = None;
        released
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let Some(token) = self.token.take() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(key = token.key(), "no runtime to release dropped lock, left to expire");
            return;
        };
        let lock = self.lock.clone();
        runtime.spawn(async move {
            match lock.release(&token).await {
                Ok(_) => tracing::debug!(key = token.key(), "released dropped lock"),
                Err(e) => tracing::warn!(key = token.key(), "failed to release dropped lock: {e}"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(10);

    async fn eventually_free(lock: &dyn Lock, key: &str) -> bool {
        for _ in 0..16 {
            if let Some(token) = lock.try_acquire(key, TTL).await.unwrap() {
                lock.release(&token).await.unwrap();
                return true;
            }
            tokio::task::yield_now().await;
        }
        false
    }

    #[tokio::test]
    async fn release_frees_the_key() {
        let lock: Arc<dyn Lock> = Arc::new(MemoryLock::new());
        let guard = LockGuard::try_acquire(lock.clone(), "k", TTL)
            .await
            .unwrap()
            .unwrap();
        assert!(
            LockGuard::try_acquire(lock.clone(), "k", TTL)
                .await
                .unwrap()
                .is_none()
        );

        assert!(guard.release().await.unwrap());
        assert!(lock.try_acquire("k", TTL).await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_holder_releases_on_drop() {
        let lock: Arc<dyn Lock> = Arc::new(MemoryLock::new());
        let holder = {
            let lock = lock.clone();
            async move {
                let _guard = LockGuard::try_acquire(lock, "k", TTL).await.unwrap().unwrap();
                std::future::pending::<()>().await;
            }
        };

        assert!(
            tokio::time::timeout(Duration::from_millis(50), holder)
                .await
                .is_err()
        );
        assert!(eventually_free(lock.as_ref(), "k").await);
    }
}
