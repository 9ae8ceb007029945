//! Content-hash dedup index. A versioned key per content hash maps to the
//! job id that first embedded it; resubmissions of identical content
//! short-circuit before any model call.

use std::sync::Arc;

use anyhow::Result;
use tracing::debug;

use grantcast_common::job_id_key;
use grantcast_store::kv::KvStore;

#[derive(Clone)]
pub struct DedupIndex {
    kv: Arc<dyn KvStore>,
}

impl DedupIndex {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Returns the job id that previously processed this content hash, or
    /// None when the content is new. An empty stored value is ambiguous
    /// state and treated as not found so the submission proceeds.
    pub async fn existing_job(&self, content_hash: &str) -> Result<Option<String>> {
        let key = job_id_key(content_hash);
        match self.kv.get(&key).await? {
            Some(job_id) if !job_id.is_empty() => {
                debug!(content_hash, job_id, "duplicate content");
                Ok(Some(job_id))
            }
            _ => Ok(None),
        }
    }

    pub async fn record(&self, content_hash: &str, job_id: &str) -> Result<()> {
        self.kv.set(&job_id_key(content_hash), job_id, None).await
    }

    pub async fn forget(&self, content_hash: &str) -> Result<()> {
        self.kv.del(&job_id_key(content_hash)).await
    }
}
