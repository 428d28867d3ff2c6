use super::{Lock, LockToken};
use crate::Result;
use async_trait::async_trait;
use core::time::Duration;
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::time::Instant;

struct Held {
    owner: String,
    expires_at: Instant,
}

/// Process-local [`Lock`] keyed by name.
#[derive(Default)]
pub struct MemoryLock {
    held: Mutex<HashMap<String, Held>>,
}

impl MemoryLock {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Lock for MemoryLock {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockToken>> {
        let now = Instant::now();
        let mut held = self.held.lock();
        if held.get(key).is_some_and(|h| h.expires_at > now) {
            return Ok(None);
        }

        let token = LockToken::new(key);
        held.insert(
            key.to_string(),
            Held {
                owner: token.owner().to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(Some(token))
    }

    async fn release(&self, token: &LockToken) -> Result<bool> {
        let mut held = self.held.lock();
        match held.get(token.key()) {
            Some(h) if h.owner == token.owner() => {
                held.remove(token.key());
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
