//! Agent reply stage: decide whether the agent account should reply to a
//! cast (or post to a channel), and what it would say. The decision is
//! cached per (agent, target) so redelivered jobs never draft twice for
//! the same conversation.

use anyhow::Result;
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use tracing::info;

use grantcast_common::{AgentAnalysis, AgentJob, CastRow, GrantcastError, MIN_REPLY_LENGTH};
use grantcast_store::queue::{QueueName, QueuedJob};

use crate::cache::AGENT_ANALYSIS_PREFIX;
use crate::deps::PipelineDeps;
use crate::invoker::invoke_with_fallback;
use crate::model::{extract_structured, MODEL_CHAIN};
use crate::stages::{parse_payload, StageWorker};

const AGENT_SYSTEM: &str = "You operate a grants-community agent account. Decide whether a reply \
from the agent would genuinely help the conversation. Decline when a reply would be generic \
encouragement. When you do reply, be specific to what the builder said.";

const DECIDE_SYSTEM: &str = "Produce the final reply decision from the deliberation. \
proposed_reply must be the exact text to post, or empty when not replying.";

#[derive(Debug, Deserialize, JsonSchema)]
struct AgentReplyDecision {
    should_reply: bool,
    proposed_reply: String,
    reason: String,
    confidence_score: f64,
}

pub struct AgentReplyWorker {
    deps: PipelineDeps,
}

impl AgentReplyWorker {
    pub fn new(deps: PipelineDeps) -> Self {
        Self { deps }
    }

    pub async fn process(&self, job: &AgentJob) -> Result<()> {
        let target = job
            .reply_to_cast_id
            .as_deref()
            .or(job.post_to_channel_id.as_deref())
            .unwrap_or("feed");
        let cache_id = format!("{}-{target}", job.agent_fid);

        if self
            .deps
            .cache
            .get::<AgentAnalysis>(AGENT_ANALYSIS_PREFIX, &cache_id)
            .await?
            .is_some()
        {
            info!(agent_fid = job.agent_fid, target, "reply already decided, skipping");
            return Ok(());
        }

        let agent = self
            .deps
            .store
            .get_profile_by_fid(job.agent_fid)
            .await?
            .ok_or_else(|| {
                GrantcastError::DataIntegrity(format!("agent profile {} not found", job.agent_fid))
            })?;

        let (context, cast) = self.build_context(job).await?;

        let mut system = format!(
            "{AGENT_SYSTEM}\n\nYou post as @{}.",
            agent.fname.as_deref().unwrap_or("agent")
        );
        if let Some(instructions) = job.custom_instructions.as_deref() {
            system.push_str(&format!("\n\nOperator instructions: {instructions}"));
        }

        let lm = self.deps.lm.as_ref();
        let retry = self.deps.retry;
        let system_ref = system.as_str();
        let context_ref = context.as_str();

        let deliberation = invoke_with_fallback("agent deliberation", MODEL_CHAIN, retry, 0, |model| {
            lm.complete(model, system_ref, context_ref)
        })
        .await?;

        let decide_prompt = format!("{context}\n\nDeliberation:\n{deliberation}");
        let decide_prompt = decide_prompt.as_str();
        let mut decision = invoke_with_fallback("agent decision", MODEL_CHAIN, retry, 0, |model| async move {
            let d: AgentReplyDecision =
                extract_structured(lm, model, DECIDE_SYSTEM, decide_prompt).await?;
            Ok(d)
        })
        .await?;

        // A reply shorter than the signal floor is noise by our own
        // standard; suppress it rather than post it.
        if decision.should_reply && decision.proposed_reply.trim().len() < MIN_REPLY_LENGTH {
            decision.should_reply = false;
            decision.reason = format!("suppressed: proposed reply too short ({})", decision.reason);
        }

        let analysis = AgentAnalysis {
            should_reply: decision.should_reply,
            proposed_reply: decision.proposed_reply,
            reason: decision.reason,
            confidence_score: decision.confidence_score,
            agent_fid: job.agent_fid,
            reply_to_cast_id: job.reply_to_cast_id.clone(),
            reply_to_cast_hash: cast.as_ref().map(|c| c.hash.clone()),
            reply_to_fid: cast.as_ref().map(|c| c.fid),
            custom_instructions: job.custom_instructions.clone(),
        };
        self.deps
            .cache
            .put(AGENT_ANALYSIS_PREFIX, &cache_id, &analysis)
            .await?;
        info!(
            agent_fid = job.agent_fid,
            target,
            should_reply = analysis.should_reply,
            "agent decision recorded"
        );
        Ok(())
    }

    /// Assemble the conversational context: the target cast with its
    /// parent, plus the interlocutor's profile and funded grants.
    async fn build_context(&self, job: &AgentJob) -> Result<(String, Option<CastRow>)> {
        let Some(cast_hash) = job.reply_to_cast_id.as_deref() else {
            let channel = job.post_to_channel_id.as_deref().unwrap_or("the main feed");
            return Ok((format!("Compose an original post for {channel}."), None));
        };

        let cast = self
            .deps
            .store
            .get_cast_by_hash(cast_hash)
            .await?
            .ok_or_else(|| GrantcastError::DataIntegrity(format!("cast {cast_hash} not found")))?;

        let mut context = String::new();
        if let Some(parent) = cast.parent_text.as_deref() {
            context.push_str(&format!("In reply to: {parent}\n"));
        }
        context.push_str(&format!("Cast: {}\n", cast.text));
        for summary in self.deps.media.describe_all(&cast.embeds).await {
            context.push_str(&format!("Attached media: {summary}\n"));
        }

        if let Some(author) = self.deps.store.get_profile_by_fid(cast.fid).await? {
            context.push_str(&format!(
                "Author: @{}",
                author.fname.as_deref().unwrap_or("unknown")
            ));
            if let Some(bio) = author.bio.as_deref() {
                context.push_str(&format!(" ({bio})"));
            }
            context.push('\n');
            if !author.verified_addresses.is_empty() {
                let grants = self
                    .deps
                    .store
                    .get_grants_for_recipients(&author.verified_addresses)
                    .await?;
                for grant in grants {
                    context.push_str(&format!("Author's grant: {} - {}\n", grant.title, grant.description));
                }
            }
        }

        Ok((context, Some(cast)))
    }
}

#[async_trait]
impl StageWorker for AgentReplyWorker {
    fn queue(&self) -> QueueName {
        QueueName::AgentReplies
    }

    fn concurrency(&self) -> usize {
        40
    }

    fn lock_ms(&self) -> i64 {
        10 * 60 * 1000
    }

    async fn handle(&self, job: &QueuedJob) -> Result<()> {
        let payload: AgentJob = parse_payload(job)?;
        self.process(&payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{cast_row, grant, harness, profile, TestHarness};

    fn reply_job(agent_fid: i64, cast_hash: &str) -> AgentJob {
        AgentJob {
            agent_fid,
            custom_instructions: None,
            reply_to_cast_id: Some(cast_hash.into()),
            post_to_channel_id: None,
        }
    }

    fn seeded() -> TestHarness {
        let h = harness();
        h.store.insert_profile(profile(500, &[]));
        h.store.insert_profile(profile(101, &["0xaddr1"]));
        h.store.insert_grant(grant("grant-1", "0xaddr1"));
        h.store.insert_cast(cast_row(7, "0xcast", 101));
        h
    }

    #[tokio::test]
    async fn decision_is_cached_per_agent_and_target() {
        let h = seeded();
        h.lm.push_complete("The builder asked a concrete question, worth answering.");
        h.lm.push_extract(serde_json::json!({
            "should_reply": true,
            "proposed_reply": "Congrats on the beta! What stack did you settle on?",
            "reason": "specific question",
            "confidence_score": 0.8,
        }));

        let worker = AgentReplyWorker::new(h.deps.clone());
        worker.process(&reply_job(500, "0xcast")).await.unwrap();

        let cached: AgentAnalysis = h
            .deps
            .cache
            .get(AGENT_ANALYSIS_PREFIX, "500-0xcast")
            .await
            .unwrap()
            .unwrap();
        assert!(cached.should_reply);
        assert_eq!(cached.reply_to_cast_hash.as_deref(), Some("0xcast"));
        assert_eq!(cached.reply_to_fid, Some(101));

        // Redelivery: no scripted responses left, must hit the cache.
        worker.process(&reply_job(500, "0xcast")).await.unwrap();
        assert_eq!(h.lm.complete_calls(), 1);
    }

    #[tokio::test]
    async fn too_short_reply_is_suppressed() {
        let h = seeded();
        h.lm.push_complete("deliberation");
        h.lm.push_extract(serde_json::json!({
            "should_reply": true,
            "proposed_reply": "gm!",
            "reason": "friendly",
            "confidence_score": 0.9,
        }));

        AgentReplyWorker::new(h.deps.clone())
            .process(&reply_job(500, "0xcast"))
            .await
            .unwrap();

        let cached: AgentAnalysis = h
            .deps
            .cache
            .get(AGENT_ANALYSIS_PREFIX, "500-0xcast")
            .await
            .unwrap()
            .unwrap();
        assert!(!cached.should_reply);
        assert!(cached.reason.starts_with("suppressed"));
    }

    #[tokio::test]
    async fn missing_target_cast_is_an_error() {
        let h = seeded();
        let err = AgentReplyWorker::new(h.deps.clone())
            .process(&reply_job(500, "0xmissing"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("0xmissing not found"));
    }

    #[tokio::test]
    async fn channel_post_uses_channel_as_cache_target() {
        let h = seeded();
        h.lm.push_complete("deliberation");
        h.lm.push_extract(serde_json::json!({
            "should_reply": true,
            "proposed_reply": "Weekly roundup: three grants shipped updates.",
            "reason": "roundup",
            "confidence_score": 0.7,
        }));

        let job = AgentJob {
            agent_fid: 500,
            custom_instructions: Some("Post a weekly roundup".into()),
            reply_to_cast_id: None,
            post_to_channel_id: Some("grants".into()),
        };
        AgentReplyWorker::new(h.deps.clone()).process(&job).await.unwrap();

        let cached: Option<AgentAnalysis> =
            h.deps.cache.get(AGENT_ANALYSIS_PREFIX, "500-grants").await.unwrap();
        let cached = cached.unwrap();
        assert!(cached.reply_to_cast_hash.is_none());
        assert_eq!(cached.custom_instructions.as_deref(), Some("Post a weekly roundup"));
    }
}
