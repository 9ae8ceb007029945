//! Per-entity advisory locks over the KV store. One worker at a time may
//! hold the lock for a given entity; contenders skip their work rather
//! than block, since a fresh job for the same entity will be enqueued by
//! whatever caused the contention.

use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use grantcast_store::kv::KvStore;

pub const STORY_GRANT_LOCK: &str = "story-grant-lock";
pub const BUILDER_PROFILE_LOCK: &str = "builder-profile-lock";

/// Two hours. Generous enough for the longest multi-chunk profile run.
pub const ENTITY_LOCK_TTL_MS: i64 = 2 * 60 * 60 * 1000;

#[derive(Clone)]
pub struct LockManager {
    kv: Arc<dyn KvStore>,
}

impl LockManager {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Try to take the lock for `entity`. Returns false when another
    /// worker already holds it; the caller should skip, not wait.
    pub async fn acquire(&self, scope: &str, entity: &str, ttl_ms: i64) -> Result<bool> {
        let acquired = self
            .kv
            .set_nx(&Self::key(scope, entity), "locked", ttl_ms)
            .await?;
        if !acquired {
            info!(scope, entity, "entity already locked, skipping");
        }
        Ok(acquired)
    }

    pub async fn release(&self, scope: &str, entity: &str) -> Result<()> {
        self.kv.del(&Self::key(scope, entity)).await
    }

    fn key(scope: &str, entity: &str) -> String {
        format!("{scope}:{entity}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grantcast_store::memory::MemoryKv;

    #[tokio::test]
    async fn second_acquire_is_refused_until_release() {
        let locks = LockManager::new(Arc::new(MemoryKv::new()));

        assert!(locks.acquire(STORY_GRANT_LOCK, "grant-1", 60_000).await.unwrap());
        assert!(!locks.acquire(STORY_GRANT_LOCK, "grant-1", 60_000).await.unwrap());

        // A different entity is independent.
        assert!(locks.acquire(STORY_GRANT_LOCK, "grant-2", 60_000).await.unwrap());

        locks.release(STORY_GRANT_LOCK, "grant-1").await.unwrap();
        assert!(locks.acquire(STORY_GRANT_LOCK, "grant-1", 60_000).await.unwrap());
    }

    #[tokio::test]
    async fn scopes_do_not_collide() {
        let locks = LockManager::new(Arc::new(MemoryKv::new()));

        assert!(locks.acquire(STORY_GRANT_LOCK, "42", 60_000).await.unwrap());
        assert!(locks.acquire(BUILDER_PROFILE_LOCK, "42", 60_000).await.unwrap());
    }
}
