//! Builder-profile synthesis: distill a builder's entire cast history into
//! one prose profile, then hand it to the embedding queue. Histories are
//! summarized in chunks with per-chunk caching so a rerun only pays for
//! chunks whose casts actually changed.

use anyhow::Result;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use grantcast_common::{is_low_signal_cast, BuilderProfileJob, CastRow, ContentType, JobBody};
use grantcast_store::queue::{QueueName, QueuedJob};

use ai_client::util::strip_code_blocks;

use crate::cache::PROFILE_CHUNK_PREFIX;
use crate::deps::PipelineDeps;
use crate::invoker::invoke_with_fallback;
use crate::locks::{BUILDER_PROFILE_LOCK, ENTITY_LOCK_TTL_MS};
use crate::model::MODEL_CHAIN;
use crate::stages::{parse_payload, StageWorker};

/// Casts per summarization chunk. Sized so a chunk of typical casts stays
/// comfortably inside one model context window.
const CHUNK_SIZE: usize = 650;

const CHUNK_SYSTEM: &str = "Summarize what this builder works on, ships, and cares about, based \
on these posts. Concrete projects, skills, and collaborators over vibes. Plain prose.";

const COMBINE_SYSTEM: &str = "Combine these chronological partial summaries of one builder into a \
single profile. Later summaries cover newer activity and win on conflicts.";

pub struct BuilderProfileWorker {
    deps: PipelineDeps,
}

impl BuilderProfileWorker {
    pub fn new(deps: PipelineDeps) -> Self {
        Self { deps }
    }

    /// Rebuild one builder's profile under the per-builder lock.
    pub async fn process_fid(&self, fid: i64) -> Result<()> {
        let entity = fid.to_string();
        if !self
            .deps
            .locks
            .acquire(BUILDER_PROFILE_LOCK, &entity, ENTITY_LOCK_TTL_MS)
            .await?
        {
            return Ok(());
        }
        let result = self.build_profile(fid).await;
        self.deps.locks.release(BUILDER_PROFILE_LOCK, &entity).await?;
        result
    }

    async fn build_profile(&self, fid: i64) -> Result<()> {
        let casts = self.deps.store.get_casts_with_parent_for_fid(fid).await?;
        let signal: Vec<&CastRow> = casts
            .iter()
            .filter(|c| !is_low_signal_cast(&c.text, c.is_reply(), !c.embeds.is_empty()))
            .collect();
        if signal.is_empty() {
            debug!(fid, "no signal casts, skipping profile");
            return Ok(());
        }

        let mut summaries = Vec::new();
        for chunk in signal.chunks(CHUNK_SIZE) {
            summaries.push(self.summarize_chunk(chunk).await?);
        }

        let profile_text = if summaries.len() == 1 {
            summaries.into_iter().next().unwrap_or_default()
        } else {
            let mut combined = String::new();
            for (index, summary) in summaries.iter().enumerate() {
                combined.push_str(&format!("Part {} of {}:\n{summary}\n\n", index + 1, summaries.len()));
            }
            let lm = self.deps.lm.as_ref();
            let combined = combined.as_str();
            invoke_with_fallback("profile combination", MODEL_CHAIN, self.deps.retry, 0, |model| {
                lm.complete(model, COMBINE_SYSTEM, combined)
            })
            .await?
        };
        let profile_text = strip_code_blocks(profile_text.trim()).trim().to_string();

        let body = JobBody {
            content_type: ContentType::BuilderProfile,
            content: profile_text,
            raw_content: None,
            groups: Vec::new(),
            users: vec![fid.to_string()],
            tags: Vec::new(),
            external_id: fid.to_string(),
            external_url: None,
            urls: None,
            hash_suffix: None,
        };
        self.deps
            .queue
            .enqueue(QueueName::Embeddings, serde_json::to_value(&body)?)
            .await?;
        info!(fid, casts = signal.len(), "builder profile rebuilt and queued for embedding");
        Ok(())
    }

    /// Summarize one chunk of casts, cached by a hash over the rendered
    /// chunk text so unchanged history is never re-summarized.
    async fn summarize_chunk(&self, chunk: &[&CastRow]) -> Result<String> {
        let mut text = String::new();
        for cast in chunk {
            text.push_str(&format!("({}) {}", cast.timestamp.format("%Y-%m-%d"), cast.text));
            if let Some(parent) = cast.parent_text.as_deref() {
                text.push_str(&format!(" [replying to: {parent}]"));
            }
            text.push('\n');
            for summary in self.deps.media.describe_all(&cast.embeds).await {
                text.push_str(&format!("  media: {summary}\n"));
            }
        }

        let chunk_key = hex::encode(Sha256::digest(text.as_bytes()));
        let lm = self.deps.lm.as_ref();
        let retry = self.deps.retry;
        let text = text.as_str();
        self.deps
            .cache
            .get_or_compute(PROFILE_CHUNK_PREFIX, &chunk_key, || async move {
                invoke_with_fallback("profile chunk", MODEL_CHAIN, retry, 0, |model| {
                    lm.complete(model, CHUNK_SYSTEM, text)
                })
                .await
            })
            .await
    }
}

#[async_trait]
impl StageWorker for BuilderProfileWorker {
    fn queue(&self) -> QueueName {
        QueueName::BuilderProfiles
    }

    fn concurrency(&self) -> usize {
        5
    }

    fn lock_ms(&self) -> i64 {
        30 * 60 * 1000
    }

    async fn handle(&self, job: &QueuedJob) -> Result<()> {
        let payload: BuilderProfileJob = parse_payload(job)?;
        for fid in payload.fids {
            self.process_fid(fid).await?;
        }
        Ok(())
    }
}
