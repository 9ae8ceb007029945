//! Queue orchestration. One consumer loop per stage, each bounded by its
//! own concurrency limit; claimed jobs keep their lock renewed while the
//! handler runs, and failures are released for redelivery until the
//! attempt cap dead-letters them.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use grantcast_store::queue::{JobQueue, QueuedJob};

use crate::deps::PipelineDeps;
use crate::stages::{
    AgentReplyWorker, BuilderProfileWorker, BulkEmbeddingWorker, DeletionWorker, EmbeddingWorker,
    GrantUpdateWorker, StageWorker, StoryWorker,
};

pub const MAX_JOB_ATTEMPTS: i32 = 3;

const IDLE_POLL: Duration = Duration::from_millis(500);

pub struct Orchestrator {
    queue: Arc<dyn JobQueue>,
    workers: Vec<Arc<dyn StageWorker>>,
}

impl Orchestrator {
    pub fn new(queue: Arc<dyn JobQueue>) -> Self {
        Self {
            queue,
            workers: Vec::new(),
        }
    }

    pub fn with_worker(mut self, worker: Arc<dyn StageWorker>) -> Self {
        self.workers.push(worker);
        self
    }

    /// The full pipeline: all seven stage consumers over one queue.
    pub fn standard(deps: &PipelineDeps) -> Self {
        Self::new(deps.queue.clone())
            .with_worker(Arc::new(EmbeddingWorker::new(deps.clone())))
            .with_worker(Arc::new(BulkEmbeddingWorker::new(deps.clone())))
            .with_worker(Arc::new(DeletionWorker::new(deps.clone())))
            .with_worker(Arc::new(GrantUpdateWorker::new(deps.clone())))
            .with_worker(Arc::new(StoryWorker::new(deps.clone())))
            .with_worker(Arc::new(BuilderProfileWorker::new(deps.clone())))
            .with_worker(Arc::new(AgentReplyWorker::new(deps.clone())))
    }

    /// Run every consumer loop until the process is stopped.
    pub async fn run(self) -> Result<()> {
        let mut set = JoinSet::new();
        for worker in self.workers {
            let queue = self.queue.clone();
            set.spawn(async move { consumer_loop(queue, worker).await });
        }
        while let Some(joined) = set.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "consumer loop aborted");
            }
        }
        Ok(())
    }

    /// Process jobs sequentially until every queue is empty, following any
    /// follow-up jobs stages enqueue. Returns the number of handled jobs.
    pub async fn drain(&self) -> Result<usize> {
        let mut handled = 0;
        loop {
            let mut progressed = false;
            for worker in &self.workers {
                while let Some(job) = self.queue.claim(worker.queue(), worker.lock_ms()).await? {
                    run_job(self.queue.as_ref(), worker.as_ref(), &job).await;
                    handled += 1;
                    progressed = true;
                }
            }
            if !progressed {
                return Ok(handled);
            }
        }
    }
}

async fn consumer_loop(queue: Arc<dyn JobQueue>, worker: Arc<dyn StageWorker>) {
    let limiter = Arc::new(Semaphore::new(worker.concurrency()));
    info!(queue = %worker.queue(), concurrency = worker.concurrency(), "consumer started");
    loop {
        let permit = match limiter.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };
        match queue.claim(worker.queue(), worker.lock_ms()).await {
            Ok(Some(job)) => {
                let queue = queue.clone();
                let worker = worker.clone();
                tokio::spawn(async move {
                    let renewer = spawn_renewer(queue.clone(), job.id, worker.lock_ms());
                    run_job(queue.as_ref(), worker.as_ref(), &job).await;
                    renewer.abort();
                    drop(permit);
                });
            }
            Ok(None) => {
                drop(permit);
                tokio::time::sleep(IDLE_POLL).await;
            }
            Err(err) => {
                drop(permit);
                warn!(queue = %worker.queue(), error = %err, "claim failed");
                tokio::time::sleep(IDLE_POLL).await;
            }
        }
    }
}

/// Renew the claim lock at a third of its window so a healthy handler
/// never loses its job to redelivery.
fn spawn_renewer(
    queue: Arc<dyn JobQueue>,
    job_id: uuid::Uuid,
    lock_ms: i64,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let period = Duration::from_millis((lock_ms / 3).max(1_000) as u64);
        let mut interval = tokio::time::interval(period);
        interval.tick().await;
        loop {
            interval.tick().await;
            if let Err(err) = queue.renew(job_id, lock_ms).await {
                warn!(%job_id, error = %err, "lock renewal failed");
            }
        }
    })
}

async fn run_job(queue: &dyn JobQueue, worker: &dyn StageWorker, job: &QueuedJob) {
    match worker.handle(job).await {
        Ok(()) => {
            if let Err(err) = queue.complete(job.id).await {
                error!(job_id = %job.id, error = %err, "failed to mark job complete");
            }
        }
        Err(err) => {
            warn!(
                job_id = %job.id,
                queue = %job.queue,
                attempts = job.attempts,
                error = %err,
                "job failed"
            );
            if let Err(err) = queue
                .fail(job.id, &format!("{err:#}"), MAX_JOB_ATTEMPTS)
                .await
            {
                error!(job_id = %job.id, error = %err, "failed to record job failure");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{cast_row, grant, harness, profile};
    use grantcast_common::{BuilderProfileJob, ContentType, GrantUpdateItem, GrantUpdateJob};
    use grantcast_store::queue::QueueName;

    #[tokio::test]
    async fn builder_profile_job_chains_into_an_embedding_record() {
        let h = harness();
        h.store.insert_cast(cast_row(1, "0xa", 101));
        h.lm.push_complete("Builds onchain grant tooling.");

        h.enqueue(
            QueueName::BuilderProfiles,
            serde_json::to_value(BuilderProfileJob { fids: vec![101] }).unwrap(),
        )
        .await;

        let orchestrator = Orchestrator::standard(&h.deps);
        let handled = orchestrator.drain().await.unwrap();

        // The profile job plus the embedding job it enqueued.
        assert_eq!(handled, 2);
        let records = h.store.embeddings();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].content_type, ContentType::BuilderProfile);
        assert_eq!(records[0].content, "Builds onchain grant tooling.");
    }

    #[tokio::test]
    async fn grant_update_chains_into_a_story() {
        let h = harness();
        h.store.insert_cast(cast_row(7, "0xcast", 101));
        h.store.insert_profile(profile(101, &["0xaddr1"]));
        h.store.insert_grant(grant("grant-1", "0xaddr1"));
        h.store.insert_unassigned_cast("grant-1", cast_row(7, "0xcast", 101));

        // Grant-update phases.
        h.lm.push_complete("Beta shipment reported for grant-1.");
        h.lm.push_extract(serde_json::json!({
            "grant_id": "grant-1",
            "is_grant_update": true,
            "reason": "beta shipped",
            "confidence_score": 0.9,
            "should_request_more_info": false,
        }));
        // Story phases.
        h.lm.push_complete("One story about the beta.");
        h.lm.push_extract(serde_json::json!({
            "stories": [{
                "title": "Beta shipped",
                "tagline": "beta ships",
                "summary": "The builder shipped the beta.",
                "key_points": [],
                "participants": [],
                "timeline": [],
                "sentiment": "positive",
                "completeness": 0.6,
                "sources": [],
                "media_urls": [],
                "cast_hashes": ["0xcast"],
                "info_needed_to_complete": "",
                "mint_urls": [],
            }]
        }));

        h.enqueue(
            QueueName::GrantUpdates,
            serde_json::to_value(GrantUpdateJob {
                casts: vec![GrantUpdateItem {
                    cast_hash: "0xcast".into(),
                    cast_content: "Shipped the beta".into(),
                    builder_fid: 101,
                    urls: vec![],
                }],
            })
            .unwrap(),
        )
        .await;

        Orchestrator::standard(&h.deps).drain().await.unwrap();

        assert_eq!(h.store.stories().len(), 1);
        assert_eq!(h.store.stories()[0].grant_id, "grant-1");
    }

    #[tokio::test]
    async fn failing_job_is_retried_then_dead_lettered() {
        let h = harness();
        // Invalid submission: fails validation on every delivery.
        let job_id = h
            .enqueue(
                QueueName::Embeddings,
                serde_json::json!({
                    "type": "cast",
                    "content": "  ",
                    "externalId": "c1",
                }),
            )
            .await;

        Orchestrator::standard(&h.deps).drain().await.unwrap();

        assert!(h.queue.is_dead(job_id));
        assert!(h
            .queue
            .last_error_of(job_id)
            .unwrap()
            .contains("content is required"));
    }
}
