//! Embedding stage: turn a content submission into a persisted embedding
//! record, with content-hash dedup in front of every model call.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;

use grantcast_common::{
    compute_content_hash, BulkJob, EmbeddingRecord, GrantcastError, JobBody, EMBEDDING_DIM,
    EMBEDDING_VERSION,
};
use grantcast_store::queue::{QueueName, QueuedJob};

use crate::deps::{PipelineDeps, EMBEDDING_MODEL};
use crate::invoker::invoke_with_fallback;
use crate::stages::{parse_payload, StageWorker};

pub struct EmbeddingWorker {
    deps: PipelineDeps,
}

impl EmbeddingWorker {
    pub fn new(deps: PipelineDeps) -> Self {
        Self { deps }
    }

    /// Process one submission end to end. Returns false when the content
    /// hash was already processed and nothing was recomputed.
    pub async fn process_submission(&self, mut body: JobBody, job_id: &str) -> Result<bool> {
        body.validate()?;
        body.normalize();

        let content_hash = compute_content_hash(
            body.content_type,
            &body.content,
            body.hash_suffix.as_deref(),
            body.urls.as_deref(),
        );

        if let Some(existing) = self.deps.dedup.existing_job(&content_hash).await? {
            debug!(
                content_hash,
                existing_job = existing,
                "content already embedded, skipping"
            );
            return Ok(false);
        }

        let urls = body.urls.clone().unwrap_or_default();
        let url_summaries = self.deps.media.describe_all(&urls).await;

        let mut input = body.content.clone();
        for summary in &url_summaries {
            input.push_str("\n\n[Attachment: ");
            input.push_str(summary);
            input.push(']');
        }

        let embedding = invoke_with_fallback(
            "embedding",
            &[EMBEDDING_MODEL],
            self.deps.retry,
            0,
            |_| self.deps.embedder.embed(&input),
        )
        .await?;

        if embedding.len() != EMBEDDING_DIM {
            return Err(GrantcastError::DataIntegrity(format!(
                "embedding has {} dimensions, expected {EMBEDDING_DIM}",
                embedding.len()
            ))
            .into());
        }

        let record = EmbeddingRecord {
            id: Uuid::new_v4(),
            content_type: body.content_type,
            content: body.content,
            raw_content: body.raw_content,
            content_hash: content_hash.clone(),
            embedding,
            groups: body.groups,
            users: body.users,
            tags: body.tags,
            external_id: body.external_id,
            external_url: body.external_url,
            urls,
            url_summaries,
            version: EMBEDDING_VERSION as i32,
            created_at: Utc::now(),
        };

        self.deps.store.upsert_embedding(&record).await?;
        self.deps.dedup.record(&content_hash, job_id).await?;

        info!(
            content_hash,
            content_type = %record.content_type,
            external_id = record.external_id,
            "embedded"
        );
        Ok(true)
    }
}

#[async_trait]
impl StageWorker for EmbeddingWorker {
    fn queue(&self) -> QueueName {
        QueueName::Embeddings
    }

    fn concurrency(&self) -> usize {
        50
    }

    fn lock_ms(&self) -> i64 {
        30_000
    }

    async fn handle(&self, job: &QueuedJob) -> Result<()> {
        let body: JobBody = parse_payload(job)?;
        self.process_submission(body, &job.id.to_string()).await?;
        Ok(())
    }
}

/// Batch variant: processes submissions sequentially, reporting progress
/// after each one. Any item failure fails the whole batch so redelivery
/// retries it; dedup makes the already-finished prefix cheap to re-skip.
pub struct BulkEmbeddingWorker {
    deps: PipelineDeps,
}

impl BulkEmbeddingWorker {
    pub fn new(deps: PipelineDeps) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl StageWorker for BulkEmbeddingWorker {
    fn queue(&self) -> QueueName {
        QueueName::BulkEmbeddings
    }

    fn concurrency(&self) -> usize {
        25
    }

    fn lock_ms(&self) -> i64 {
        10 * 60 * 1000
    }

    async fn handle(&self, job: &QueuedJob) -> Result<()> {
        let batch: BulkJob = parse_payload(job)?;
        let total = batch.jobs.len();
        if total == 0 {
            return Ok(());
        }

        let worker = EmbeddingWorker::new(self.deps.clone());
        for (index, body) in batch.jobs.into_iter().enumerate() {
            worker
                .process_submission(body, &job.id.to_string())
                .await?;
            let percent = ((index + 1) * 100 / total) as i16;
            self.deps.queue.set_progress(job.id, percent).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::harness;
    use grantcast_common::ContentType;

    fn body(content: &str, external_id: &str) -> JobBody {
        serde_json::from_value(serde_json::json!({
            "type": "cast",
            "content": content,
            "externalId": external_id,
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn identical_content_is_embedded_once() {
        let h = harness();
        let worker = EmbeddingWorker::new(h.deps.clone());

        assert!(worker.process_submission(body("Shipped v2 today", "c1"), "job-1").await.unwrap());
        assert!(!worker.process_submission(body("Shipped v2 today", "c1"), "job-2").await.unwrap());

        assert_eq!(h.store.embeddings().len(), 1);
        assert_eq!(h.embedder.calls(), 1);
    }

    #[tokio::test]
    async fn record_carries_hash_version_and_vector() {
        let h = harness();
        let worker = EmbeddingWorker::new(h.deps.clone());

        worker.process_submission(body("gm builders", "c9"), "job-1").await.unwrap();

        let records = h.store.embeddings();
        let record = &records[0];
        assert_eq!(
            record.content_hash,
            compute_content_hash(ContentType::Cast, "gm builders", None, None)
        );
        assert_eq!(record.version, EMBEDDING_VERSION as i32);
        assert_eq!(record.embedding.len(), EMBEDDING_DIM);
        assert_eq!(record.external_id, "c9");
    }

    #[tokio::test]
    async fn invalid_submission_is_rejected_before_any_model_call() {
        let h = harness();
        let worker = EmbeddingWorker::new(h.deps.clone());

        let err = worker.process_submission(body("   ", "c1"), "job-1").await.unwrap_err();
        assert!(err.to_string().contains("content is required"));
        assert_eq!(h.embedder.calls(), 0);
        assert!(h.store.embeddings().is_empty());
    }

    #[tokio::test]
    async fn bulk_reports_progress_per_item() {
        let h = harness();
        let payload = serde_json::to_value(BulkJob {
            jobs: vec![body("one", "1"), body("two", "2"), body("three", "3"), body("four", "4")],
        })
        .unwrap();
        let job_id = h.enqueue(QueueName::BulkEmbeddings, payload).await;

        let worker = BulkEmbeddingWorker::new(h.deps.clone());
        let job = h.claim(QueueName::BulkEmbeddings).await;
        worker.handle(&job).await.unwrap();

        assert_eq!(h.queue.progress_of(job_id), Some(100));
        assert_eq!(h.store.embeddings().len(), 4);
    }

    #[tokio::test]
    async fn bulk_fails_whole_batch_on_one_bad_item() {
        let h = harness();
        let payload = serde_json::to_value(BulkJob {
            jobs: vec![body("fine", "1"), body("  ", "2"), body("never reached", "3")],
        })
        .unwrap();
        h.enqueue(QueueName::BulkEmbeddings, payload).await;

        let worker = BulkEmbeddingWorker::new(h.deps.clone());
        let job = h.claim(QueueName::BulkEmbeddings).await;
        assert!(worker.handle(&job).await.is_err());

        // The valid prefix was processed; the batch as a whole still fails
        // so the queue redelivers it.
        assert_eq!(h.store.embeddings().len(), 1);
    }
}
