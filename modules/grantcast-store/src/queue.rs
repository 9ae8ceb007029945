use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

/// The fixed set of pipeline queues. Topology between them is wired by the
/// orchestrator; nothing here knows which queue feeds which.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueName {
    Embeddings,
    Deletions,
    BulkEmbeddings,
    GrantUpdates,
    Stories,
    BuilderProfiles,
    AgentReplies,
}

impl QueueName {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::Embeddings => "embeddings",
            QueueName::Deletions => "deletions",
            QueueName::BulkEmbeddings => "bulk-embeddings",
            QueueName::GrantUpdates => "grant-updates",
            QueueName::Stories => "stories",
            QueueName::BuilderProfiles => "builder-profiles",
            QueueName::AgentReplies => "agent-replies",
        }
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A claimed job. The claim lock must be renewed within its window or the
/// queue treats the job as stalled and redelivers it — handlers therefore
/// get at-least-once delivery, never exactly-once.
#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub id: Uuid,
    pub queue: QueueName,
    pub payload: serde_json::Value,
    pub attempts: i32,
    pub enqueued_at: DateTime<Utc>,
}

/// Durable queue interface. Backed by an external store; the pipeline core
/// only ever sees this trait.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, queue: QueueName, payload: serde_json::Value) -> Result<Uuid>;

    /// Atomically claim the next available job, locking it for `lock_ms`.
    async fn claim(&self, queue: QueueName, lock_ms: i64) -> Result<Option<QueuedJob>>;

    /// Extend the claim lock on an in-flight job.
    async fn renew(&self, job_id: Uuid, lock_ms: i64) -> Result<()>;

    async fn complete(&self, job_id: Uuid) -> Result<()>;

    /// Record a failure. Releases the claim for redelivery until
    /// `max_attempts` is reached, then dead-letters the job.
    async fn fail(&self, job_id: Uuid, error: &str, max_attempts: i32) -> Result<()>;

    /// Report handler progress (0–100) for queue dashboards.
    async fn set_progress(&self, job_id: Uuid, percent: i16) -> Result<()>;
}

/// Postgres-backed queue. Claims use a CTE + FOR UPDATE SKIP LOCKED so
/// concurrent workers never double-claim; expired locks make a job
/// claimable again.
pub struct PgJobQueue {
    pool: PgPool,
}

impl PgJobQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobQueue for PgJobQueue {
    async fn enqueue(&self, queue: QueueName, payload: serde_json::Value) -> Result<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO jobs (id, queue, payload) VALUES ($1, $2, $3)",
        )
        .bind(id)
        .bind(queue.as_str())
        .bind(&payload)
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    async fn claim(&self, queue: QueueName, lock_ms: i64) -> Result<Option<QueuedJob>> {
        let row: Option<(Uuid, serde_json::Value, i32, DateTime<Utc>)> = sqlx::query_as(
            "WITH claimable AS (
                 SELECT id FROM jobs
                 WHERE queue = $1
                   AND completed_at IS NULL
                   AND dead_at IS NULL
                   AND (locked_until IS NULL OR locked_until < now())
                 ORDER BY enqueued_at
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED
             )
             UPDATE jobs j
             SET locked_until = now() + ($2 * interval '1 millisecond'),
                 attempts = attempts + 1
             FROM claimable c
             WHERE j.id = c.id
             RETURNING j.id, j.payload, j.attempts, j.enqueued_at",
        )
        .bind(queue.as_str())
        .bind(lock_ms)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(id, payload, attempts, enqueued_at)| QueuedJob {
            id,
            queue,
            payload,
            attempts,
            enqueued_at,
        }))
    }

    async fn renew(&self, job_id: Uuid, lock_ms: i64) -> Result<()> {
        sqlx::query(
            "UPDATE jobs
             SET locked_until = now() + ($2 * interval '1 millisecond')
             WHERE id = $1 AND completed_at IS NULL",
        )
        .bind(job_id)
        .bind(lock_ms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn complete(&self, job_id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE jobs SET completed_at = now(), locked_until = NULL, progress = 100
             WHERE id = $1",
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fail(&self, job_id: Uuid, error: &str, max_attempts: i32) -> Result<()> {
        sqlx::query(
            "UPDATE jobs
             SET locked_until = NULL,
                 last_error = $2,
                 dead_at = CASE WHEN attempts >= $3 THEN now() ELSE NULL END
             WHERE id = $1",
        )
        .bind(job_id)
        .bind(error)
        .bind(max_attempts)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_progress(&self, job_id: Uuid, percent: i16) -> Result<()> {
        sqlx::query("UPDATE jobs SET progress = $2 WHERE id = $1")
            .bind(job_id)
            .bind(percent)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
