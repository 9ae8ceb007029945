use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;

/// Key-value store with optional TTL and atomic set-if-absent.
///
/// The pipeline's dedup state, result caches, and entity locks all live
/// behind this trait; the backend is a delegated external concern.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str, ttl_ms: Option<i64>) -> Result<()>;
    async fn del(&self, key: &str) -> Result<()>;
    /// Atomic set-if-absent. Returns true when this call created the entry.
    async fn set_nx(&self, key: &str, value: &str, ttl_ms: i64) -> Result<bool>;
}

/// Postgres-backed KV store. Expired rows are treated as absent on read
/// and overwritten on write; `set_nx` is atomic via a conditional upsert.
pub struct PgKvStore {
    pool: PgPool,
}

impl PgKvStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn expiry(ttl_ms: Option<i64>) -> Option<DateTime<Utc>> {
        ttl_ms.map(|ms| Utc::now() + Duration::milliseconds(ms))
    }
}

#[async_trait]
impl KvStore for PgKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT value FROM kv_cache
             WHERE key = $1 AND (expires_at IS NULL OR expires_at > now())",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(v,)| v))
    }

    async fn set(&self, key: &str, value: &str, ttl_ms: Option<i64>) -> Result<()> {
        sqlx::query(
            "INSERT INTO kv_cache (key, value, expires_at)
             VALUES ($1, $2, $3)
             ON CONFLICT (key)
             DO UPDATE SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at",
        )
        .bind(key)
        .bind(value)
        .bind(Self::expiry(ttl_ms))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM kv_cache WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl_ms: i64) -> Result<bool> {
        // The conditional DO UPDATE only fires when the existing entry has
        // expired, so a live entry wins and the insert reports 0 rows.
        let result = sqlx::query(
            "INSERT INTO kv_cache (key, value, expires_at)
             VALUES ($1, $2, $3)
             ON CONFLICT (key) DO UPDATE
               SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at
               WHERE kv_cache.expires_at IS NOT NULL AND kv_cache.expires_at <= now()",
        )
        .bind(key)
        .bind(value)
        .bind(Self::expiry(Some(ttl_ms)))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
