//! Stage workers. Each consumes one queue, and some enqueue follow-up
//! jobs onto other queues; the orchestrator owns that topology.

pub mod agent;
pub mod builder_profile;
pub mod deletion;
pub mod embedding;
pub mod grant_updates;
pub mod stories;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;

use grantcast_store::queue::{QueueName, QueuedJob};

pub use agent::AgentReplyWorker;
pub use builder_profile::BuilderProfileWorker;
pub use deletion::DeletionWorker;
pub use embedding::{BulkEmbeddingWorker, EmbeddingWorker};
pub use grant_updates::GrantUpdateWorker;
pub use stories::StoryWorker;

/// One queue consumer. `concurrency` and `lock_ms` tune how the
/// orchestrator runs it; `handle` does the work for a single claimed job.
#[async_trait]
pub trait StageWorker: Send + Sync {
    fn queue(&self) -> QueueName;
    fn concurrency(&self) -> usize;
    fn lock_ms(&self) -> i64;
    async fn handle(&self, job: &QueuedJob) -> Result<()>;
}

pub(crate) fn parse_payload<T: DeserializeOwned>(job: &QueuedJob) -> Result<T> {
    serde_json::from_value(job.payload.clone())
        .with_context(|| format!("malformed payload on {} job {}", job.queue, job.id))
}
