//! Story building: fold a grant's unassigned casts into duration stories.
//! One worker per grant at a time, enforced with a per-grant lock; losers
//! skip instead of waiting, since the winning run will absorb the same
//! unassigned casts.

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use schemars::JsonSchema;
use serde::Deserialize;
use tracing::{info, warn};
use uuid::Uuid;

use grantcast_common::{
    story_is_complete, CastRow, GrantcastError, Sentiment, StoryAnalysis, StoryEdit, StoryJob,
};
use grantcast_store::queue::{QueueName, QueuedJob};

use crate::deps::PipelineDeps;
use crate::invoker::invoke_with_fallback;
use crate::locks::{ENTITY_LOCK_TTL_MS, STORY_GRANT_LOCK};
use crate::model::{extract_structured, MODEL_CHAIN};
use crate::resolver::resolve_cached;
use crate::stages::{parse_payload, StageWorker};

const PLAN_SYSTEM: &str = "You are an editor reviewing a grant-funded builder's recent posts. \
Plan which coherent stories of grant progress these posts tell, which posts belong to which \
story, and whether any existing story should absorb new posts instead of starting a fresh one.";

const DRAFT_SYSTEM: &str = "Write the planned stories. Quote the builder's own words for claims; \
never paraphrase numbers or dates. cast_hashes must list exactly the source posts used for each \
story. Leave info_needed_to_complete empty only when nothing essential is missing.";

const HEADER_SYSTEM: &str = "Pick the single best header image for this story from the candidate \
media. Return an empty url when none of them works as a header.";

#[derive(Debug, Deserialize, JsonSchema)]
struct StoryDraftSet {
    stories: Vec<StoryDraft>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct StoryDraft {
    title: String,
    tagline: String,
    summary: String,
    key_points: Vec<String>,
    /// Participant handles; resolved to addresses before persisting.
    participants: Vec<String>,
    timeline: Vec<String>,
    sentiment: Sentiment,
    completeness: f64,
    sources: Vec<String>,
    media_urls: Vec<String>,
    cast_hashes: Vec<String>,
    /// Empty when nothing is missing.
    info_needed_to_complete: String,
    mint_urls: Vec<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct HeaderImageChoice {
    /// One of the candidate urls, or empty.
    url: String,
}

pub struct StoryWorker {
    deps: PipelineDeps,
}

impl StoryWorker {
    pub fn new(deps: PipelineDeps) -> Self {
        Self { deps }
    }

    /// Rebuild stories for one grant under its lock. Contention is a skip,
    /// not an error.
    pub async fn process_grant(&self, grant_id: &str) -> Result<()> {
        if !self
            .deps
            .locks
            .acquire(STORY_GRANT_LOCK, grant_id, ENTITY_LOCK_TTL_MS)
            .await?
        {
            return Ok(());
        }
        let result = self.build_stories(grant_id).await;
        self.deps.locks.release(STORY_GRANT_LOCK, grant_id).await?;
        result
    }

    async fn build_stories(&self, grant_id: &str) -> Result<()> {
        let (grant, parent) = self
            .deps
            .store
            .get_grant_and_parent(grant_id)
            .await?
            .ok_or_else(|| GrantcastError::DataIntegrity(format!("grant {grant_id} not found")))?;

        let casts = self.deps.store.get_unassigned_casts_for_grant(grant_id).await?;
        if casts.is_empty() {
            return Ok(());
        }
        let existing = self.deps.store.get_stories_for_grant(grant_id).await?;

        let mut cast_blocks = String::new();
        for cast in &casts {
            cast_blocks.push_str(&format!(
                "[{}] ({}) {}\n",
                cast.hash,
                cast.timestamp.format("%Y-%m-%d"),
                cast.text
            ));
            for summary in self.deps.media.describe_all(&cast.embeds).await {
                cast_blocks.push_str(&format!("  media: {summary}\n"));
            }
        }

        let mut existing_blocks = String::new();
        for story in &existing {
            existing_blocks.push_str(&format!("- {} / {}: {}\n", story.title, story.tagline, story.summary));
        }

        let flow = parent
            .map(|p| format!(" (under the {} flow)", p.title))
            .unwrap_or_default();
        let context = format!(
            "Grant: {}{flow}\nDescription: {}\n\nExisting stories:\n{existing_blocks}\nNew posts:\n{cast_blocks}",
            grant.title, grant.description
        );

        let lm = self.deps.lm.as_ref();
        let retry = self.deps.retry;

        let context_ref = context.as_str();
        let plan = invoke_with_fallback("story planning", MODEL_CHAIN, retry, 0, |model| {
            lm.complete(model, PLAN_SYSTEM, context_ref)
        })
        .await?;

        let draft_prompt = format!("{context}\n\nEditorial plan:\n{plan}");
        let draft_prompt = draft_prompt.as_str();
        let drafts = invoke_with_fallback("story drafting", MODEL_CHAIN, retry, 0, |model| async move {
            let set: StoryDraftSet = extract_structured(lm, model, DRAFT_SYSTEM, draft_prompt).await?;
            Ok(set)
        })
        .await?;

        for draft in drafts.stories {
            self.persist_draft(&grant.id, draft, &casts, &existing).await?;
        }
        Ok(())
    }

    async fn persist_draft(
        &self,
        grant_id: &str,
        draft: StoryDraft,
        casts: &[CastRow],
        existing: &[StoryAnalysis],
    ) -> Result<()> {
        let source_ids: Vec<i64> = casts
            .iter()
            .filter(|c| draft.cast_hashes.contains(&c.hash))
            .map(|c| c.id)
            .collect();
        if source_ids.is_empty() {
            warn!(grant_id, title = draft.title, "draft cites no known casts, dropping");
            return Ok(());
        }

        let mut participants = Vec::new();
        for handle in &draft.participants {
            match resolve_cached(&self.deps.cache, self.deps.resolver.as_ref(), handle).await? {
                Some(address) => participants.push(address),
                None => warn!(handle, "participant handle did not resolve"),
            }
        }

        let header_image = self.pick_header_image(&draft).await?;
        let info_needed = (!draft.info_needed_to_complete.trim().is_empty())
            .then(|| draft.info_needed_to_complete.clone());
        let complete = story_is_complete(
            header_image.as_deref(),
            info_needed.as_deref(),
            draft.completeness,
        );

        let matched = existing.iter().find(|s| {
            s.title.eq_ignore_ascii_case(&draft.title) && s.tagline.eq_ignore_ascii_case(&draft.tagline)
        });
        let edit = StoryEdit {
            timestamp: Utc::now(),
            message: match matched {
                Some(_) => format!("Updated with {} new casts", source_ids.len()),
                None => "Story created".to_string(),
            },
            address: participants.first().cloned().unwrap_or_default(),
        };

        let story = StoryAnalysis {
            id: matched.map(|s| s.id).unwrap_or_else(Uuid::new_v4),
            title: draft.title,
            tagline: draft.tagline,
            summary: draft.summary,
            key_points: draft.key_points,
            participants,
            timeline: draft.timeline,
            sentiment: draft.sentiment,
            completeness: draft.completeness,
            complete,
            sources: draft.sources,
            media_urls: draft.media_urls,
            header_image,
            cast_hashes: draft.cast_hashes,
            edits: vec![edit],
            info_needed_to_complete: info_needed,
            mint_urls: draft.mint_urls,
            author: matched.and_then(|s| s.author.clone()),
            grant_id: grant_id.to_string(),
            created_at: matched.map(|s| s.created_at).unwrap_or_else(Utc::now),
        };

        let story_id = self.deps.store.upsert_story(&story).await?;
        self.deps.store.stamp_cast_story_ids(&source_ids, story_id).await?;
        info!(grant_id, %story_id, complete, "story persisted");
        Ok(())
    }

    /// Ask the model to select a header from the draft's own media. A
    /// choice outside the candidate list is discarded.
    async fn pick_header_image(&self, draft: &StoryDraft) -> Result<Option<String>> {
        if draft.media_urls.is_empty() {
            return Ok(None);
        }

        let mut prompt = format!("Story: {}\n{}\n\nCandidates:\n", draft.title, draft.summary);
        for url in &draft.media_urls {
            if let Some(description) = self.deps.media.describe(url).await {
                prompt.push_str(&format!("{url}: {description}\n"));
            } else {
                prompt.push_str(&format!("{url}\n"));
            }
        }

        let lm = self.deps.lm.as_ref();
        let prompt = prompt.as_str();
        let choice = invoke_with_fallback(
            "header image selection",
            MODEL_CHAIN,
            self.deps.retry,
            0,
            |model| async move {
                let c: HeaderImageChoice =
                    extract_structured(lm, model, HEADER_SYSTEM, prompt).await?;
                Ok(c)
            },
        )
        .await?;

        if choice.url.is_empty() {
            return Ok(None);
        }
        if !draft.media_urls.contains(&choice.url) {
            warn!(url = choice.url, "header choice not among candidates, ignoring");
            return Ok(None);
        }
        Ok(Some(choice.url))
    }
}

#[async_trait]
impl StageWorker for StoryWorker {
    fn queue(&self) -> QueueName {
        QueueName::Stories
    }

    fn concurrency(&self) -> usize {
        5
    }

    fn lock_ms(&self) -> i64 {
        30 * 60 * 1000
    }

    async fn handle(&self, job: &QueuedJob) -> Result<()> {
        let payload: StoryJob = parse_payload(job)?;
        let mut by_grant: BTreeMap<String, Vec<i64>> = BTreeMap::new();
        for item in payload.items {
            by_grant.entry(item.grant_id).or_default().push(item.new_cast_id);
        }
        for grant_id in by_grant.keys() {
            self.process_grant(grant_id).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{cast_row, grant, harness, TestHarness};

    fn draft_json(title: &str, completeness: f64, media: &[&str], info_needed: &str) -> serde_json::Value {
        serde_json::json!({
            "stories": [{
                "title": title,
                "tagline": "beta ships",
                "summary": "The builder shipped the beta.",
                "key_points": ["beta shipped"],
                "participants": ["alice.eth"],
                "timeline": ["2026-08-01: beta out"],
                "sentiment": "positive",
                "completeness": completeness,
                "sources": [],
                "media_urls": media,
                "cast_hashes": ["0xcast"],
                "info_needed_to_complete": info_needed,
                "mint_urls": [],
            }]
        })
    }

    fn seeded() -> TestHarness {
        let h = harness();
        h.store.insert_grant(grant("grant-1", "0xaddr1"));
        h.store.insert_unassigned_cast("grant-1", cast_row(7, "0xcast", 101));
        h.resolver.insert("alice.eth", "0xalice");
        h
    }

    #[tokio::test]
    async fn builds_and_stamps_a_new_story() {
        let h = seeded();
        h.lm.push_complete("One story: the beta shipment.");
        h.lm.push_extract(draft_json(
            "Beta shipped",
            0.9,
            &["https://i.imgur.com/beta.png"],
            "",
        ));
        // Header selection.
        h.lm.push_extract(serde_json::json!({ "url": "https://i.imgur.com/beta.png" }));

        StoryWorker::new(h.deps.clone()).process_grant("grant-1").await.unwrap();

        let stories = h.store.stories();
        assert_eq!(stories.len(), 1);
        let story = &stories[0];
        assert_eq!(story.title, "Beta shipped");
        assert!(story.complete);
        assert_eq!(story.participants, vec!["0xalice".to_string()]);
        assert_eq!(story.header_image.as_deref(), Some("https://i.imgur.com/beta.png"));
        assert_eq!(story.edits.len(), 1);
        assert_eq!(story.edits[0].message, "Story created");
        assert_eq!(h.store.stamped_story_ids(7), vec![story.id]);
    }

    #[tokio::test]
    async fn missing_header_keeps_story_incomplete() {
        let h = seeded();
        h.lm.push_complete("plan");
        h.lm.push_extract(draft_json("Beta shipped", 0.95, &[], ""));

        StoryWorker::new(h.deps.clone()).process_grant("grant-1").await.unwrap();

        let stories = h.store.stories();
        assert!(!stories[0].complete);
        assert!(stories[0].header_image.is_none());
    }

    #[tokio::test]
    async fn header_choice_outside_candidates_is_discarded() {
        let h = seeded();
        h.lm.push_complete("plan");
        h.lm.push_extract(draft_json(
            "Beta shipped",
            0.95,
            &["https://i.imgur.com/real.png"],
            "",
        ));
        h.lm.push_extract(serde_json::json!({ "url": "https://i.imgur.com/invented.png" }));

        StoryWorker::new(h.deps.clone()).process_grant("grant-1").await.unwrap();

        assert!(h.store.stories()[0].header_image.is_none());
    }

    #[tokio::test]
    async fn rerun_updates_existing_story_with_an_edit() {
        let h = seeded();
        h.lm.push_complete("plan 1");
        h.lm.push_extract(draft_json("Beta shipped", 0.5, &[], "launch date"));

        let worker = StoryWorker::new(h.deps.clone());
        worker.process_grant("grant-1").await.unwrap();
        let first_id = h.store.stories()[0].id;

        h.store.insert_unassigned_cast("grant-1", cast_row(8, "0xcast", 101));
        h.lm.push_complete("plan 2");
        h.lm.push_extract(draft_json("Beta shipped", 0.6, &[], ""));

        worker.process_grant("grant-1").await.unwrap();

        let stories = h.store.stories();
        assert_eq!(stories.len(), 1);
        assert_eq!(stories[0].id, first_id);
        assert_eq!(stories[0].edits.len(), 2);
        assert_eq!(stories[0].edits[1].message, "Updated with 1 new casts");
    }

    #[tokio::test]
    async fn locked_grant_is_skipped_without_model_calls() {
        let h = seeded();
        h.deps
            .locks
            .acquire(STORY_GRANT_LOCK, "grant-1", ENTITY_LOCK_TTL_MS)
            .await
            .unwrap();

        // No scripted responses: a model call would fail the run.
        StoryWorker::new(h.deps.clone()).process_grant("grant-1").await.unwrap();
        assert!(h.store.stories().is_empty());
    }

    #[tokio::test]
    async fn draft_citing_no_known_casts_is_dropped() {
        let h = seeded();
        h.lm.push_complete("plan");
        let mut bad = draft_json("Beta shipped", 0.9, &[], "");
        bad["stories"][0]["cast_hashes"] = serde_json::json!(["0xunknown"]);
        h.lm.push_extract(bad);

        StoryWorker::new(h.deps.clone()).process_grant("grant-1").await.unwrap();
        assert!(h.store.stories().is_empty());
    }
}
