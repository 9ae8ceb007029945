//! In-memory doubles and fixtures for pipeline tests: a scripted language
//! model, a counting embedder, a HashMap-backed cast store, and a harness
//! that wires them into a [`PipelineDeps`].

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use uuid::Uuid;

use ai_client::traits::EmbedAgent;
use grantcast_common::{
    CastRow, ContentType, EmbeddingRecord, Grant, ImpactVerification, Profile, StoryAnalysis,
    TokenMetadata, EMBEDDING_DIM,
};
use grantcast_store::cast_store::CastStore;
use grantcast_store::memory::{MemoryKv, MemoryQueue};
use grantcast_store::queue::{JobQueue, QueueName, QueuedJob};

use crate::deps::PipelineDeps;
use crate::invoker::RetryPolicy;
use crate::media::{MediaFetcher, VideoAnalyzer, VideoState};
use crate::model::LanguageModel;
use crate::resolver::NameResolver;

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

pub fn cast_row(id: i64, hash: &str, fid: i64) -> CastRow {
    CastRow {
        id,
        hash: hash.to_string(),
        fid,
        text: format!("Shipped the beta this week ({id})"),
        parent_hash: None,
        parent_text: None,
        embeds: Vec::new(),
        tags: Vec::new(),
        impact_verifications: Vec::new(),
        story_ids: Vec::new(),
        timestamp: Utc.with_ymd_and_hms(2026, 8, 1, 12, 0, 0).unwrap(),
    }
}

pub fn reply_row(id: i64, hash: &str, fid: i64, text: &str) -> CastRow {
    CastRow {
        text: text.to_string(),
        parent_hash: Some("0xparent".to_string()),
        parent_text: Some("original post".to_string()),
        ..cast_row(id, hash, fid)
    }
}

pub fn profile(fid: i64, addresses: &[&str]) -> Profile {
    Profile {
        fid,
        fname: Some(format!("builder{fid}")),
        display_name: Some(format!("Builder {fid}")),
        bio: Some("building things".to_string()),
        verified_addresses: addresses.iter().map(|a| a.to_string()).collect(),
    }
}

pub fn grant(id: &str, recipient: &str) -> Grant {
    Grant {
        id: id.to_string(),
        title: format!("Grant {id}"),
        description: "Fund the beta".to_string(),
        recipient_address: recipient.to_string(),
        parent_contract: None,
    }
}

// ---------------------------------------------------------------------------
// Scripted language model
// ---------------------------------------------------------------------------

/// Pops pre-scripted responses in order; any unscripted call errors so
/// tests catch unexpected model usage.
#[derive(Default)]
pub struct ScriptedModel {
    completions: Mutex<VecDeque<Result<String>>>,
    extractions: Mutex<VecDeque<serde_json::Value>>,
    image_descriptions: Mutex<VecDeque<String>>,
    complete_calls: AtomicUsize,
    models_used: Mutex<Vec<String>>,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_complete(&self, text: &str) {
        self.completions.lock().unwrap().push_back(Ok(text.to_string()));
    }

    pub fn push_complete_err(&self, error: &str) {
        self.completions.lock().unwrap().push_back(Err(anyhow!("{error}")));
    }

    pub fn push_extract(&self, value: serde_json::Value) {
        self.extractions.lock().unwrap().push_back(value);
    }

    pub fn push_image_description(&self, text: &str) {
        self.image_descriptions.lock().unwrap().push_back(text.to_string());
    }

    pub fn complete_calls(&self) -> usize {
        self.complete_calls.load(Ordering::SeqCst)
    }

    pub fn models_used(&self) -> Vec<String> {
        self.models_used.lock().unwrap().clone()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn complete(&self, model: &str, _system: &str, _user: &str) -> Result<String> {
        self.complete_calls.fetch_add(1, Ordering::SeqCst);
        self.models_used.lock().unwrap().push(model.to_string());
        self.completions
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(anyhow!("no scripted completion left")))
    }

    async fn extract_json(
        &self,
        model: &str,
        _system: &str,
        _user: &str,
        _schema: serde_json::Value,
    ) -> Result<serde_json::Value> {
        self.models_used.lock().unwrap().push(model.to_string());
        self.extractions
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| anyhow!("no scripted extraction left"))
    }

    async fn describe_image(
        &self,
        _model: &str,
        _bytes: &[u8],
        _mime_type: &str,
        _prompt: &str,
    ) -> Result<String> {
        self.image_descriptions
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| anyhow!("no scripted image description left"))
    }
}

// ---------------------------------------------------------------------------
// Embedder
// ---------------------------------------------------------------------------

/// Deterministic embeddings derived from the input text, with a call
/// counter for dedup assertions.
#[derive(Default)]
pub struct CountingEmbedder {
    calls: AtomicUsize,
}

impl CountingEmbedder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn vector_for(text: &str) -> Vec<f32> {
        let seed: usize = text.bytes().map(usize::from).sum();
        (0..EMBEDDING_DIM)
            .map(|i| ((seed + i) % 97) as f32 / 97.0)
            .collect()
    }
}

#[async_trait]
impl EmbedAgent for CountingEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Self::vector_for(text))
    }
}

// ---------------------------------------------------------------------------
// Name resolver
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct StaticResolver {
    entries: Mutex<HashMap<String, String>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, handle: &str, address: &str) {
        self.entries
            .lock()
            .unwrap()
            .insert(handle.to_lowercase(), address.to_string());
    }
}

#[async_trait]
impl NameResolver for StaticResolver {
    async fn resolve(&self, handle: &str) -> Result<Option<String>> {
        Ok(self.entries.lock().unwrap().get(handle).cloned())
    }
}

// ---------------------------------------------------------------------------
// Media doubles
// ---------------------------------------------------------------------------

/// Fails every fetch; tests that need bytes use [`MapFetcher`].
pub struct FailingFetcher;

#[async_trait]
impl MediaFetcher for FailingFetcher {
    async fn fetch(&self, url: &str) -> Result<(Vec<u8>, String)> {
        Err(anyhow!("network disabled in tests: {url}"))
    }
}

#[derive(Default)]
pub struct MapFetcher {
    entries: Mutex<HashMap<String, (Vec<u8>, String)>>,
}

impl MapFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, url: &str, bytes: &[u8], mime: &str) {
        self.entries
            .lock()
            .unwrap()
            .insert(url.to_string(), (bytes.to_vec(), mime.to_string()));
    }
}

#[async_trait]
impl MediaFetcher for MapFetcher {
    async fn fetch(&self, url: &str) -> Result<(Vec<u8>, String)> {
        self.entries
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| anyhow!("no fixture for {url}"))
    }
}

/// Walks a scripted sequence of processing states, then describes.
pub struct ScriptedVideo {
    states: Mutex<VecDeque<VideoState>>,
    description: String,
    pub uploads: Mutex<Vec<String>>,
    pub deletions: Mutex<Vec<String>>,
}

impl ScriptedVideo {
    pub fn new(states: Vec<VideoState>, description: &str) -> Self {
        Self {
            states: Mutex::new(states.into()),
            description: description.to_string(),
            uploads: Mutex::new(Vec::new()),
            deletions: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl VideoAnalyzer for ScriptedVideo {
    async fn upload(&self, path: &Path, mime_type: &str) -> Result<String> {
        // The spool file must still exist at upload time.
        assert!(path.exists());
        let id = format!("remote-{}", self.uploads.lock().unwrap().len());
        self.uploads.lock().unwrap().push(mime_type.to_string());
        Ok(id)
    }

    async fn status(&self, _remote_id: &str) -> Result<VideoState> {
        Ok(self
            .states
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(VideoState::Ready))
    }

    async fn describe(&self, _remote_id: &str, _prompt: &str) -> Result<String> {
        Ok(self.description.clone())
    }

    async fn delete(&self, remote_id: &str) -> Result<()> {
        self.deletions.lock().unwrap().push(remote_id.to_string());
        Ok(())
    }

    async fn describe_url(&self, _url: &str, _prompt: &str) -> Result<String> {
        Ok(self.description.clone())
    }
}

// ---------------------------------------------------------------------------
// Mock cast store
// ---------------------------------------------------------------------------

#[derive(Default)]
struct StoreState {
    casts: Vec<CastRow>,
    profiles: HashMap<i64, Profile>,
    grants: Vec<Grant>,
    stories: Vec<StoryAnalysis>,
    embeddings: Vec<EmbeddingRecord>,
    unassigned: HashMap<String, Vec<i64>>,
    token_metadata: HashMap<String, TokenMetadata>,
}

#[derive(Default)]
pub struct MockCastStore {
    state: Mutex<StoreState>,
}

impl MockCastStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_cast(&self, cast: CastRow) {
        self.state.lock().unwrap().casts.push(cast);
    }

    pub fn insert_profile(&self, profile: Profile) {
        self.state.lock().unwrap().profiles.insert(profile.fid, profile);
    }

    pub fn insert_grant(&self, grant: Grant) {
        self.state.lock().unwrap().grants.push(grant);
    }

    pub fn insert_token_metadata(&self, url: &str, metadata: TokenMetadata) {
        self.state
            .lock()
            .unwrap()
            .token_metadata
            .insert(url.to_string(), metadata);
    }

    /// Register `cast` as attributed to `grant_id` but not yet absorbed by
    /// any story. Stamping removes it from this set.
    pub fn insert_unassigned_cast(&self, grant_id: &str, cast: CastRow) {
        let mut state = self.state.lock().unwrap();
        let id = cast.id;
        if !state.casts.iter().any(|c| c.id == id) {
            state.casts.push(cast);
        }
        state.unassigned.entry(grant_id.to_string()).or_default().push(id);
    }

    pub fn embeddings(&self) -> Vec<EmbeddingRecord> {
        self.state.lock().unwrap().embeddings.clone()
    }

    pub fn stories(&self) -> Vec<StoryAnalysis> {
        self.state.lock().unwrap().stories.clone()
    }

    pub fn tags_of(&self, cast_id: i64) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .casts
            .iter()
            .find(|c| c.id == cast_id)
            .map(|c| c.tags.clone())
            .unwrap_or_default()
    }

    pub fn verifications_of(&self, cast_id: i64) -> Vec<ImpactVerification> {
        self.state
            .lock()
            .unwrap()
            .casts
            .iter()
            .find(|c| c.id == cast_id)
            .map(|c| c.impact_verifications.clone())
            .unwrap_or_default()
    }

    pub fn stamped_story_ids(&self, cast_id: i64) -> Vec<Uuid> {
        self.state
            .lock()
            .unwrap()
            .casts
            .iter()
            .find(|c| c.id == cast_id)
            .map(|c| c.story_ids.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl CastStore for MockCastStore {
    async fn get_cast_by_hash(&self, hash: &str) -> Result<Option<CastRow>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .casts
            .iter()
            .find(|c| c.hash == hash)
            .cloned())
    }

    async fn get_casts_with_parent_for_fid(&self, fid: i64) -> Result<Vec<CastRow>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .casts
            .iter()
            .filter(|c| c.fid == fid)
            .cloned()
            .collect())
    }

    async fn get_profile_by_fid(&self, fid: i64) -> Result<Option<Profile>> {
        Ok(self.state.lock().unwrap().profiles.get(&fid).cloned())
    }

    async fn get_grants_for_recipients(&self, addresses: &[String]) -> Result<Vec<Grant>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .grants
            .iter()
            .filter(|g| addresses.contains(&g.recipient_address))
            .cloned()
            .collect())
    }

    async fn get_grant_and_parent(&self, grant_id: &str) -> Result<Option<(Grant, Option<Grant>)>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .grants
            .iter()
            .find(|g| g.id == grant_id)
            .cloned()
            .map(|g| (g, None)))
    }

    async fn get_stories_for_grant(&self, grant_id: &str) -> Result<Vec<StoryAnalysis>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .stories
            .iter()
            .filter(|s| s.grant_id == grant_id)
            .cloned()
            .collect())
    }

    async fn get_unassigned_casts_for_grant(&self, grant_id: &str) -> Result<Vec<CastRow>> {
        let state = self.state.lock().unwrap();
        let ids = state.unassigned.get(grant_id).cloned().unwrap_or_default();
        Ok(state
            .casts
            .iter()
            .filter(|c| ids.contains(&c.id))
            .cloned()
            .collect())
    }

    async fn get_token_metadata_for_url(&self, url: &str) -> Result<Option<TokenMetadata>> {
        Ok(self.state.lock().unwrap().token_metadata.get(url).cloned())
    }

    async fn upsert_embedding(&self, record: &EmbeddingRecord) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if record.content_type == ContentType::BuilderProfile {
            state.embeddings.retain(|e| {
                !(e.content_type == ContentType::BuilderProfile
                    && e.external_id == record.external_id)
            });
        }
        state.embeddings.retain(|e| e.content_hash != record.content_hash);
        state.embeddings.push(record.clone());
        Ok(())
    }

    async fn delete_embeddings_by_content_hash(
        &self,
        content_hash: &str,
        content_type: ContentType,
    ) -> Result<u64> {
        let mut state = self.state.lock().unwrap();
        let before = state.embeddings.len();
        state
            .embeddings
            .retain(|e| !(e.content_hash == content_hash && e.content_type == content_type));
        Ok((before - state.embeddings.len()) as u64)
    }

    async fn add_cast_tag(&self, cast_id: i64, tag: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(cast) = state.casts.iter_mut().find(|c| c.id == cast_id) {
            if !cast.tags.iter().any(|t| t == tag) {
                cast.tags.push(tag.to_string());
            }
        }
        Ok(())
    }

    async fn set_impact_verification(
        &self,
        cast_id: i64,
        verification: &ImpactVerification,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(cast) = state.casts.iter_mut().find(|c| c.id == cast_id) {
            cast.impact_verifications.retain(|v| {
                !(v.model == verification.model
                    && v.prompt_version == verification.prompt_version
                    && v.grant_id == verification.grant_id)
            });
            cast.impact_verifications.push(verification.clone());
        }
        Ok(())
    }

    async fn stamp_cast_story_ids(&self, cast_ids: &[i64], story_id: Uuid) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        for cast in state.casts.iter_mut().filter(|c| cast_ids.contains(&c.id)) {
            if !cast.story_ids.contains(&story_id) {
                cast.story_ids.push(story_id);
            }
        }
        for ids in state.unassigned.values_mut() {
            ids.retain(|id| !cast_ids.contains(id));
        }
        Ok(())
    }

    async fn upsert_story(&self, story: &StoryAnalysis) -> Result<Uuid> {
        let mut state = self.state.lock().unwrap();
        if let Some(existing) = state.stories.iter_mut().find(|s| {
            s.grant_id == story.grant_id
                && s.title.eq_ignore_ascii_case(&story.title)
                && s.tagline.eq_ignore_ascii_case(&story.tagline)
        }) {
            let id = existing.id;
            let complete = existing.complete || story.complete;
            let mut merged = story.clone();
            merged.id = id;
            merged.complete = complete;
            let mut edits = existing.edits.clone();
            edits.extend(story.edits.iter().cloned());
            merged.edits = edits;
            merged.created_at = existing.created_at;
            *existing = merged;
            Ok(id)
        } else {
            state.stories.push(story.clone());
            Ok(story.id)
        }
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct TestHarness {
    pub deps: PipelineDeps,
    pub store: Arc<MockCastStore>,
    pub kv: Arc<MemoryKv>,
    pub queue: Arc<MemoryQueue>,
    pub lm: Arc<ScriptedModel>,
    pub embedder: Arc<CountingEmbedder>,
    pub resolver: Arc<StaticResolver>,
}

impl TestHarness {
    pub async fn enqueue(&self, queue: QueueName, payload: serde_json::Value) -> Uuid {
        self.queue.enqueue(queue, payload).await.unwrap()
    }

    pub async fn claim(&self, queue: QueueName) -> QueuedJob {
        self.queue.claim(queue, 60_000).await.unwrap().unwrap()
    }
}

/// Fully-wired in-memory pipeline with caching enabled and a fast,
/// no-retry invocation policy.
pub fn harness() -> TestHarness {
    let store = Arc::new(MockCastStore::new());
    let kv = Arc::new(MemoryKv::new());
    let queue = Arc::new(MemoryQueue::new());
    let lm = Arc::new(ScriptedModel::new());
    let embedder = Arc::new(CountingEmbedder::new());
    let resolver = Arc::new(StaticResolver::new());

    let deps = PipelineDeps::assemble(
        store.clone(),
        kv.clone(),
        queue.clone(),
        lm.clone(),
        embedder.clone(),
        Arc::new(FailingFetcher),
        None,
        resolver.clone(),
        true,
        RetryPolicy {
            max_retries: 0,
            base_delay: Duration::from_millis(1),
        },
    );

    TestHarness {
        deps,
        store,
        kv,
        queue,
        lm,
        embedder,
        resolver,
    }
}
