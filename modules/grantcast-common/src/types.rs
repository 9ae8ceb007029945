use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::GrantcastError;
use crate::filter::normalize_membership;

/// Dimensionality of the embedding vectors persisted per record.
pub const EMBEDDING_DIM: usize = 1536;

// ---------------------------------------------------------------------------
// Content categories
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContentType {
    Cast,
    Grant,
    GrantApplication,
    Flow,
    Dispute,
    DraftApplication,
    BuilderProfile,
    Story,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Cast => "cast",
            ContentType::Grant => "grant",
            ContentType::GrantApplication => "grant-application",
            ContentType::Flow => "flow",
            ContentType::Dispute => "dispute",
            ContentType::DraftApplication => "draft-application",
            ContentType::BuilderProfile => "builder-profile",
            ContentType::Story => "story",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "cast" => Some(ContentType::Cast),
            "grant" => Some(ContentType::Grant),
            "grant-application" => Some(ContentType::GrantApplication),
            "flow" => Some(ContentType::Flow),
            "dispute" => Some(ContentType::Dispute),
            "draft-application" => Some(ContentType::DraftApplication),
            "builder-profile" => Some(ContentType::BuilderProfile),
            "story" => Some(ContentType::Story),
            _ => None,
        }
    }
}

impl std::fmt::Display for ContentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Job submission payload
// ---------------------------------------------------------------------------

/// Inbound submission payload for the embedding queues.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobBody {
    #[serde(rename = "type")]
    pub content_type: ContentType,
    pub content: String,
    #[serde(default)]
    pub raw_content: Option<String>,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub users: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub external_id: String,
    #[serde(default)]
    pub external_url: Option<String>,
    #[serde(default)]
    pub urls: Option<Vec<String>>,
    #[serde(default)]
    pub hash_suffix: Option<String>,
}

impl JobBody {
    /// Reject payloads missing required fields. Arrays are guaranteed by
    /// the `#[serde(default)]` shape; content and external_id must be
    /// non-empty.
    pub fn validate(&self) -> Result<(), GrantcastError> {
        if self.content.trim().is_empty() {
            return Err(GrantcastError::Validation("content is required".into()));
        }
        if self.external_id.trim().is_empty() {
            return Err(GrantcastError::Validation("externalId is required".into()));
        }
        Ok(())
    }

    /// Lowercase and dedup the membership arrays in place.
    pub fn normalize(&mut self) {
        self.groups = normalize_membership(&self.groups);
        self.users = normalize_membership(&self.users);
        self.tags = normalize_membership(&self.tags);
    }
}

// ---------------------------------------------------------------------------
// Persisted embedding record
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    pub id: Uuid,
    pub content_type: ContentType,
    pub content: String,
    pub raw_content: Option<String>,
    /// Unique dedup key: at most one row per content hash.
    pub content_hash: String,
    pub embedding: Vec<f32>,
    pub groups: Vec<String>,
    pub users: Vec<String>,
    pub tags: Vec<String>,
    pub external_id: String,
    pub external_url: Option<String>,
    pub urls: Vec<String>,
    /// Attachment descriptions folded into the embedding input, by URL.
    pub url_summaries: Vec<String>,
    pub version: i32,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Grant-update classification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CastAnalysis {
    pub cast_hash: String,
    /// Model that produced the classification.
    pub model: String,
    /// Empty when the cast is not an update for any candidate grant.
    pub grant_id: String,
    pub is_grant_update: bool,
    pub reason: String,
    pub confidence_score: f64,
    pub should_request_more_info: bool,
}

/// Append-only verification entry stamped on the source cast, keyed by
/// (model, prompt_version, grant_id) — a re-run with the same key replaces
/// the prior entry rather than duplicating it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImpactVerification {
    pub model: String,
    pub prompt_version: String,
    pub grant_id: String,
    pub is_grant_update: bool,
    pub reason: String,
    pub confidence_score: f64,
    pub verified_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Agent reply decision
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentAnalysis {
    pub should_reply: bool,
    pub proposed_reply: String,
    pub reason: String,
    pub confidence_score: f64,
    pub agent_fid: i64,
    pub reply_to_cast_id: Option<String>,
    pub reply_to_cast_hash: Option<String>,
    pub reply_to_fid: Option<i64>,
    pub custom_instructions: Option<String>,
}

// ---------------------------------------------------------------------------
// Stories
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Sentiment {
    Positive,
    Negative,
    Neutral,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoryEdit {
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoryAnalysis {
    pub id: Uuid,
    pub title: String,
    pub tagline: String,
    /// Markdown narrative body.
    pub summary: String,
    pub key_points: Vec<String>,
    /// Participant addresses (resolved from handles).
    pub participants: Vec<String>,
    pub timeline: Vec<String>,
    pub sentiment: Sentiment,
    /// 0.0–1.0 model-assessed completeness.
    pub completeness: f64,
    pub complete: bool,
    pub sources: Vec<String>,
    pub media_urls: Vec<String>,
    pub header_image: Option<String>,
    pub cast_hashes: Vec<String>,
    pub edits: Vec<StoryEdit>,
    pub info_needed_to_complete: Option<String>,
    pub mint_urls: Vec<String>,
    pub author: Option<String>,
    pub grant_id: String,
    pub created_at: DateTime<Utc>,
}

/// A story is complete once enough corroboration has accumulated: a header
/// image exists, nothing is flagged as missing, and model confidence is
/// at or above 0.8. Used on the write path; `complete` never auto-reverts
/// once achieved.
pub fn story_is_complete(
    header_image: Option<&str>,
    info_needed: Option<&str>,
    completeness: f64,
) -> bool {
    let has_header = header_image.is_some_and(|h| !h.trim().is_empty());
    let nothing_missing = info_needed.is_none_or(|i| i.trim().is_empty());
    has_header && nothing_missing && completeness >= 0.8
}

// ---------------------------------------------------------------------------
// Collaborator-side rows (read through CastStore)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Grant {
    pub id: String,
    pub title: String,
    pub description: String,
    pub recipient_address: String,
    pub parent_contract: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CastRow {
    pub id: i64,
    pub hash: String,
    pub fid: i64,
    pub text: String,
    pub parent_hash: Option<String>,
    /// Text of the parent cast when this is a reply, for prompt context.
    pub parent_text: Option<String>,
    pub embeds: Vec<String>,
    pub tags: Vec<String>,
    pub impact_verifications: Vec<ImpactVerification>,
    pub story_ids: Vec<Uuid>,
    pub timestamp: DateTime<Utc>,
}

impl CastRow {
    pub fn is_reply(&self) -> bool {
        self.parent_hash.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub fid: i64,
    pub fname: Option<String>,
    pub display_name: Option<String>,
    pub bio: Option<String>,
    pub verified_addresses: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenMetadata {
    pub name: String,
    pub description: String,
    pub image_url: Option<String>,
    pub animation_url: Option<String>,
}

// ---------------------------------------------------------------------------
// Queue payloads (downstream of the submission surface)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeletionJob {
    pub content_hash: String,
    pub content_type: ContentType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkJob {
    pub jobs: Vec<JobBody>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrantUpdateItem {
    pub cast_hash: String,
    pub cast_content: String,
    pub builder_fid: i64,
    #[serde(default)]
    pub urls: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrantUpdateJob {
    pub casts: Vec<GrantUpdateItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoryJobItem {
    pub new_cast_id: i64,
    pub grant_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoryJob {
    pub items: Vec<StoryJobItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuilderProfileJob {
    pub fids: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentJob {
    pub agent_fid: i64,
    #[serde(default)]
    pub custom_instructions: Option<String>,
    #[serde(default)]
    pub reply_to_cast_id: Option<String>,
    #[serde(default)]
    pub post_to_channel_id: Option<String>,
}
