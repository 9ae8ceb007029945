//! Deletion stage: remove embedding rows for a content hash and clear the
//! dedup entry so the same content can be resubmitted and reprocessed.

use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

use grantcast_common::DeletionJob;
use grantcast_store::queue::{QueueName, QueuedJob};

use crate::deps::PipelineDeps;
use crate::stages::{parse_payload, StageWorker};

pub struct DeletionWorker {
    deps: PipelineDeps,
}

impl DeletionWorker {
    pub fn new(deps: PipelineDeps) -> Self {
        Self { deps }
    }

    pub async fn process_deletion(&self, job: &DeletionJob) -> Result<u64> {
        let deleted = self
            .deps
            .store
            .delete_embeddings_by_content_hash(&job.content_hash, job.content_type)
            .await?;
        // Clear dedup even when no rows matched, so a half-applied earlier
        // deletion cannot leave the hash permanently blocked.
        self.deps.dedup.forget(&job.content_hash).await?;
        info!(
            content_hash = job.content_hash,
            content_type = %job.content_type,
            deleted,
            "embeddings deleted"
        );
        Ok(deleted)
    }
}

#[async_trait]
impl StageWorker for DeletionWorker {
    fn queue(&self) -> QueueName {
        QueueName::Deletions
    }

    fn concurrency(&self) -> usize {
        50
    }

    fn lock_ms(&self) -> i64 {
        30_000
    }

    async fn handle(&self, job: &QueuedJob) -> Result<()> {
        let payload: DeletionJob = parse_payload(job)?;
        self.process_deletion(&payload).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::embedding::EmbeddingWorker;
    use crate::testing::harness;
    use grantcast_common::{compute_content_hash, ContentType, JobBody};

    fn body(content: &str) -> JobBody {
        serde_json::from_value(serde_json::json!({
            "type": "cast",
            "content": content,
            "externalId": "c1",
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn delete_then_resubmit_reprocesses() {
        let h = harness();
        let embedder = EmbeddingWorker::new(h.deps.clone());
        let deleter = DeletionWorker::new(h.deps.clone());

        assert!(embedder.process_submission(body("Shipped v2"), "job-1").await.unwrap());
        let hash = compute_content_hash(ContentType::Cast, "Shipped v2", None, None);

        let deleted = deleter
            .process_deletion(&DeletionJob {
                content_hash: hash.clone(),
                content_type: ContentType::Cast,
            })
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert!(h.store.embeddings().is_empty());

        // Same content is new again.
        assert!(embedder.process_submission(body("Shipped v2"), "job-2").await.unwrap());
        assert_eq!(h.store.embeddings().len(), 1);
        assert_eq!(h.embedder.calls(), 2);
    }

    #[tokio::test]
    async fn deleting_unknown_hash_is_a_no_op() {
        let h = harness();
        let deleter = DeletionWorker::new(h.deps.clone());

        let deleted = deleter
            .process_deletion(&DeletionJob {
                content_hash: "deadbeef".into(),
                content_type: ContentType::Cast,
            })
            .await
            .unwrap();
        assert_eq!(deleted, 0);
    }
}
