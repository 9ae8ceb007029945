//! Grant-update detection: decide whether a builder's cast reports
//! progress on one of their funded grants, stamp the verdict on the cast,
//! and feed confirmed updates into story building.
//!
//! Two model phases per cast: a free-text impact analysis, then a
//! structured classification constrained to the builder's actual grant
//! ids. A grant id outside that candidate set is treated as hallucinated
//! and fails the item rather than corrupting attribution.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use schemars::JsonSchema;
use serde::Deserialize;
use tracing::info;

use grantcast_common::{
    CastAnalysis, CastRow, Grant, GrantUpdateItem, GrantUpdateJob, GrantcastError,
    ImpactVerification, StoryJob, StoryJobItem,
};
use grantcast_store::queue::{QueueName, QueuedJob};

use crate::cache::CAST_ANALYSIS_PREFIX;
use crate::deps::PipelineDeps;
use crate::invoker::invoke_with_fallback;
use crate::model::{extract_structured, MODEL_CHAIN};
use crate::stages::{parse_payload, StageWorker};

pub const GRANT_UPDATE_TAG: &str = "grant-update";
const PROMPT_VERSION: &str = "v4";

const ANALYSIS_SYSTEM: &str = "You analyze a builder's social post against the grants they have \
been funded for. Reason about whether the post reports concrete progress on any of the grants, \
and which one. Be skeptical of vague enthusiasm without deliverables.";

const CLASSIFY_SYSTEM: &str = "Given an impact analysis of a builder's post, produce the final \
classification. grant_id must be one of the listed candidate ids, or empty when the post is not \
an update for any of them.";

#[derive(Debug, Deserialize, JsonSchema)]
struct GrantUpdateClassification {
    /// One of the candidate grant ids, or empty.
    grant_id: String,
    is_grant_update: bool,
    reason: String,
    confidence_score: f64,
    should_request_more_info: bool,
}

pub struct GrantUpdateWorker {
    deps: PipelineDeps,
}

impl GrantUpdateWorker {
    pub fn new(deps: PipelineDeps) -> Self {
        Self { deps }
    }

    pub async fn process_item(&self, item: &GrantUpdateItem) -> Result<()> {
        let cast = self
            .deps
            .store
            .get_cast_by_hash(&item.cast_hash)
            .await?
            .ok_or_else(|| {
                GrantcastError::DataIntegrity(format!("cast {} not found", item.cast_hash))
            })?;

        let addresses = self
            .deps
            .store
            .get_profile_by_fid(item.builder_fid)
            .await?
            .map(|p| p.verified_addresses)
            .unwrap_or_default();
        if addresses.is_empty() {
            return Err(GrantcastError::DataIntegrity(format!(
                "builder {} has no verified addresses",
                item.builder_fid
            ))
            .into());
        }

        let grants = self.deps.store.get_grants_for_recipients(&addresses).await?;
        if grants.is_empty() {
            return Err(GrantcastError::DataIntegrity(format!(
                "builder {} has no linkable grants",
                item.builder_fid
            ))
            .into());
        }

        let analysis = match self
            .deps
            .cache
            .get::<CastAnalysis>(CAST_ANALYSIS_PREFIX, &item.cast_hash)
            .await?
        {
            Some(cached) => {
                info!(cast_hash = item.cast_hash, "cast analysis cache hit");
                cached
            }
            None => {
                let analysis = self.analyze(item, &grants).await?;
                self.deps
                    .cache
                    .put(CAST_ANALYSIS_PREFIX, &item.cast_hash, &analysis)
                    .await?;
                analysis
            }
        };

        let verification = ImpactVerification {
            model: analysis.model.clone(),
            prompt_version: PROMPT_VERSION.to_string(),
            grant_id: analysis.grant_id.clone(),
            is_grant_update: analysis.is_grant_update,
            reason: analysis.reason.clone(),
            confidence_score: analysis.confidence_score,
            verified_at: Utc::now(),
        };
        self.deps
            .store
            .set_impact_verification(cast.id, &verification)
            .await?;

        if analysis.is_grant_update && !analysis.grant_id.is_empty() {
            self.confirm_update(&cast, &analysis.grant_id).await?;
        }
        Ok(())
    }

    /// Run both model phases and validate the resulting grant id against
    /// the candidate set.
    async fn analyze(&self, item: &GrantUpdateItem, grants: &[Grant]) -> Result<CastAnalysis> {
        let media_summaries = self.deps.media.describe_all(&item.urls).await;

        let mut candidates = String::new();
        for grant in grants {
            candidates.push_str(&format!(
                "- id: {} | title: {} | description: {}\n",
                grant.id, grant.title, grant.description
            ));
        }

        let mut analysis_prompt = format!(
            "Post:\n{}\n\nCandidate grants:\n{candidates}",
            item.cast_content
        );
        for summary in &media_summaries {
            analysis_prompt.push_str(&format!("\nAttached media: {summary}"));
        }

        let lm = self.deps.lm.as_ref();
        let retry = self.deps.retry;

        let prompt = analysis_prompt.as_str();
        let free_text = invoke_with_fallback("impact analysis", MODEL_CHAIN, retry, 0, |model| {
            lm.complete(model, ANALYSIS_SYSTEM, prompt)
        })
        .await?;

        let classify_prompt = format!(
            "Impact analysis:\n{free_text}\n\nCandidate grant ids:\n{}",
            grants.iter().map(|g| g.id.as_str()).collect::<Vec<_>>().join("\n")
        );
        let classify_prompt = classify_prompt.as_str();
        let (model_used, classification) = invoke_with_fallback(
            "grant-update classification",
            MODEL_CHAIN,
            retry,
            0,
            |model| async move {
                let c: GrantUpdateClassification =
                    extract_structured(lm, model, CLASSIFY_SYSTEM, classify_prompt).await?;
                Ok((model.to_string(), c))
            },
        )
        .await?;

        if !classification.grant_id.is_empty()
            && !grants.iter().any(|g| g.id == classification.grant_id)
        {
            return Err(GrantcastError::DataIntegrity(format!(
                "model attributed cast {} to unknown grant {}",
                item.cast_hash, classification.grant_id
            ))
            .into());
        }

        Ok(CastAnalysis {
            cast_hash: item.cast_hash.clone(),
            model: model_used,
            grant_id: classification.grant_id,
            is_grant_update: classification.is_grant_update,
            reason: classification.reason,
            confidence_score: classification.confidence_score,
            should_request_more_info: classification.should_request_more_info,
        })
    }

    async fn confirm_update(&self, cast: &CastRow, grant_id: &str) -> Result<()> {
        self.deps.store.add_cast_tag(cast.id, GRANT_UPDATE_TAG).await?;
        let story_job = StoryJob {
            items: vec![StoryJobItem {
                new_cast_id: cast.id,
                grant_id: grant_id.to_string(),
            }],
        };
        self.deps
            .queue
            .enqueue(QueueName::Stories, serde_json::to_value(&story_job)?)
            .await?;
        info!(cast_id = cast.id, grant_id, "confirmed grant update");
        Ok(())
    }
}

#[async_trait]
impl StageWorker for GrantUpdateWorker {
    fn queue(&self) -> QueueName {
        QueueName::GrantUpdates
    }

    fn concurrency(&self) -> usize {
        10
    }

    fn lock_ms(&self) -> i64 {
        20 * 60 * 1000
    }

    async fn handle(&self, job: &QueuedJob) -> Result<()> {
        let payload: GrantUpdateJob = parse_payload(job)?;
        for item in &payload.casts {
            self.process_item(item).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{cast_row, grant, harness, profile};

    fn item(cast_hash: &str, builder_fid: i64) -> GrantUpdateItem {
        GrantUpdateItem {
            cast_hash: cast_hash.into(),
            cast_content: "Shipped the beta this week, onboarding 40 testers".into(),
            builder_fid,
            urls: vec![],
        }
    }

    fn seeded() -> crate::testing::TestHarness {
        let h = harness();
        h.store.insert_cast(cast_row(7, "0xcast", 101));
        h.store.insert_profile(profile(101, &["0xaddr1"]));
        h.store.insert_grant(grant("grant-1", "0xaddr1"));
        h
    }

    #[tokio::test]
    async fn confirmed_update_stamps_tags_and_enqueues_story() {
        let h = seeded();
        h.lm.push_complete("The post reports beta shipment for grant-1.");
        h.lm.push_extract(serde_json::json!({
            "grant_id": "grant-1",
            "is_grant_update": true,
            "reason": "concrete beta shipment",
            "confidence_score": 0.92,
            "should_request_more_info": false,
        }));

        let worker = GrantUpdateWorker::new(h.deps.clone());
        worker.process_item(&item("0xcast", 101)).await.unwrap();

        assert_eq!(h.store.tags_of(7), vec![GRANT_UPDATE_TAG.to_string()]);
        let verifications = h.store.verifications_of(7);
        assert_eq!(verifications.len(), 1);
        assert_eq!(verifications[0].grant_id, "grant-1");
        assert!(verifications[0].is_grant_update);

        let stories = h.queue.payloads(QueueName::Stories);
        assert_eq!(stories.len(), 1);
        let story: StoryJob = serde_json::from_value(stories[0].clone()).unwrap();
        assert_eq!(story.items[0].new_cast_id, 7);
        assert_eq!(story.items[0].grant_id, "grant-1");
    }

    #[tokio::test]
    async fn hallucinated_grant_id_fails_without_side_effects() {
        let h = seeded();
        h.lm.push_complete("Sounds like progress on some grant.");
        h.lm.push_extract(serde_json::json!({
            "grant_id": "grant-999",
            "is_grant_update": true,
            "reason": "made up",
            "confidence_score": 0.99,
            "should_request_more_info": false,
        }));

        let worker = GrantUpdateWorker::new(h.deps.clone());
        let err = worker.process_item(&item("0xcast", 101)).await.unwrap_err();

        assert!(err.to_string().contains("unknown grant grant-999"));
        assert!(h.store.tags_of(7).is_empty());
        assert!(h.store.verifications_of(7).is_empty());
        assert!(h.queue.payloads(QueueName::Stories).is_empty());
    }

    #[tokio::test]
    async fn non_update_is_stamped_but_not_tagged() {
        let h = seeded();
        h.lm.push_complete("This is a greeting, not progress.");
        h.lm.push_extract(serde_json::json!({
            "grant_id": "",
            "is_grant_update": false,
            "reason": "no deliverable mentioned",
            "confidence_score": 0.85,
            "should_request_more_info": false,
        }));

        let worker = GrantUpdateWorker::new(h.deps.clone());
        worker.process_item(&item("0xcast", 101)).await.unwrap();

        assert!(h.store.tags_of(7).is_empty());
        assert_eq!(h.store.verifications_of(7).len(), 1);
        assert!(h.queue.payloads(QueueName::Stories).is_empty());
    }

    #[tokio::test]
    async fn cached_analysis_skips_both_model_phases() {
        let h = seeded();
        // No scripted model responses: any model call would error.
        h.deps
            .cache
            .put(
                CAST_ANALYSIS_PREFIX,
                "0xcast",
                &CastAnalysis {
                    cast_hash: "0xcast".into(),
                    model: "claude-sonnet-4-20250514".into(),
                    grant_id: "grant-1".into(),
                    is_grant_update: true,
                    reason: "cached".into(),
                    confidence_score: 0.9,
                    should_request_more_info: false,
                },
            )
            .await
            .unwrap();

        let worker = GrantUpdateWorker::new(h.deps.clone());
        worker.process_item(&item("0xcast", 101)).await.unwrap();

        assert_eq!(h.store.tags_of(7), vec![GRANT_UPDATE_TAG.to_string()]);
        assert_eq!(h.queue.payloads(QueueName::Stories).len(), 1);
    }

    #[tokio::test]
    async fn rate_limited_analysis_falls_back_to_the_next_model() {
        let h = seeded();
        h.lm.push_complete_err("OpenAI API error (429 Too Many Requests): slow down");
        h.lm.push_complete("Recovered analysis on the fallback model.");
        h.lm.push_extract(serde_json::json!({
            "grant_id": "",
            "is_grant_update": false,
            "reason": "not an update",
            "confidence_score": 0.8,
            "should_request_more_info": false,
        }));

        let worker = GrantUpdateWorker::new(h.deps.clone());
        worker.process_item(&item("0xcast", 101)).await.unwrap();

        let models = h.lm.models_used();
        assert_eq!(&models[..2], &["claude-sonnet-4-20250514", "gpt-4.1"]);
    }

    #[tokio::test]
    async fn builder_without_grants_is_an_error() {
        let h = harness();
        h.store.insert_cast(cast_row(7, "0xcast", 101));
        h.store.insert_profile(profile(101, &["0xaddr1"]));

        let worker = GrantUpdateWorker::new(h.deps.clone());
        let err = worker.process_item(&item("0xcast", 101)).await.unwrap_err();
        assert!(err.to_string().contains("no linkable grants"));
    }
}
