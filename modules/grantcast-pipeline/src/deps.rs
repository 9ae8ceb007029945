//! Dependency container. Every collaborator sits behind a trait object so
//! workers receive their stores, queue, models, and caches by injection;
//! tests assemble the same container from in-memory doubles.

use std::sync::Arc;

use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

use ai_client::claude::Claude;
use ai_client::openai::OpenAi;
use ai_client::traits::EmbedAgent;
use grantcast_common::AppConfig;
use grantcast_store::cast_store::{CastStore, PgCastStore};
use grantcast_store::kv::{KvStore, PgKvStore};
use grantcast_store::migrate::migrate;
use grantcast_store::queue::{JobQueue, PgJobQueue};

use crate::cache::ResultCache;
use crate::dedup::DedupIndex;
use crate::invoker::RetryPolicy;
use crate::locks::LockManager;
use crate::media::{HttpFetcher, HttpVideoAnalyzer, MediaDescriber, MediaFetcher, VideoAnalyzer};
use crate::model::{LanguageModel, ModelRouter};
use crate::resolver::{EnsDataResolver, NameResolver};

pub const EMBEDDING_MODEL: &str = "text-embedding-3-small";
const DEFAULT_CHAT_MODEL: &str = "gpt-4.1";

#[derive(Clone)]
pub struct PipelineDeps {
    pub store: Arc<dyn CastStore>,
    pub kv: Arc<dyn KvStore>,
    pub queue: Arc<dyn JobQueue>,
    pub lm: Arc<dyn LanguageModel>,
    pub embedder: Arc<dyn EmbedAgent>,
    pub media: Arc<MediaDescriber>,
    pub resolver: Arc<dyn NameResolver>,
    pub cache: ResultCache,
    pub dedup: DedupIndex,
    pub locks: LockManager,
    pub retry: RetryPolicy,
}

impl PipelineDeps {
    /// Wire everything from shared collaborators. The cache, dedup index,
    /// and lock manager all derive from the same KV store.
    pub fn assemble(
        store: Arc<dyn CastStore>,
        kv: Arc<dyn KvStore>,
        queue: Arc<dyn JobQueue>,
        lm: Arc<dyn LanguageModel>,
        embedder: Arc<dyn EmbedAgent>,
        fetcher: Arc<dyn MediaFetcher>,
        video: Option<Arc<dyn VideoAnalyzer>>,
        resolver: Arc<dyn NameResolver>,
        cache_enabled: bool,
        retry: RetryPolicy,
    ) -> Self {
        let cache = ResultCache::new(kv.clone(), cache_enabled);
        let media = Arc::new(
            MediaDescriber::new(cache.clone(), lm.clone(), store.clone(), fetcher, video)
                .with_retry(retry),
        );
        Self {
            dedup: DedupIndex::new(kv.clone()),
            locks: LockManager::new(kv.clone()),
            store,
            kv,
            queue,
            lm,
            embedder,
            media,
            resolver,
            cache,
            retry,
        }
    }

    /// Production wiring: Postgres-backed stores plus the real model
    /// clients, with schema migration applied up front.
    pub async fn from_config(config: &AppConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(20)
            .connect(&config.database_url)
            .await?;
        migrate(&pool).await?;

        let openai = OpenAi::new(&config.openai_api_key, DEFAULT_CHAT_MODEL)
            .with_embedding_model(EMBEDDING_MODEL);
        let claude = config.anthropic_api_key.as_deref().map(Claude::new);
        if claude.is_none() {
            info!("no anthropic key configured, claude models route to openai");
        }
        let video: Option<Arc<dyn VideoAnalyzer>> = config
            .video_analysis_api_key
            .as_deref()
            .map(|key| Arc::new(HttpVideoAnalyzer::new(key)) as Arc<dyn VideoAnalyzer>);

        let embedder: Arc<dyn EmbedAgent> = Arc::new(openai.clone());
        let lm: Arc<dyn LanguageModel> = Arc::new(ModelRouter::new(openai, claude));

        Ok(Self::assemble(
            Arc::new(PgCastStore::new(pool.clone())),
            Arc::new(PgKvStore::new(pool.clone())),
            Arc::new(PgJobQueue::new(pool)),
            lm,
            embedder,
            Arc::new(HttpFetcher::new()),
            video,
            Arc::new(EnsDataResolver::new()),
            config.cache_enabled,
            RetryPolicy::default(),
        ))
    }
}
