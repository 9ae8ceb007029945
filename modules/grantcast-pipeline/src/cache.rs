//! Generic result cache over the KV store.
//!
//! Expensive derived artifacts (media descriptions, cast analyses, profile
//! chunk summaries) are cached under a per-feature key prefix. On a
//! confirmed hit the fetch closure is never run; when caching is disabled
//! the fetch always runs and nothing is persisted.
//!
//! Values are stored as raw strings when the payload is a plain string and
//! as JSON text otherwise. Reads sniff the first character to pick the
//! decoding path; an empty JSON object or array is treated as a corrupted
//! entry and surfaces as an error rather than as data.

use std::future::Future;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use grantcast_store::kv::KvStore;

pub const IMAGE_DESCRIPTION_PREFIX: &str = "image-description-";
pub const VIDEO_DESCRIPTION_PREFIX: &str = "video-description-";
pub const CAST_ANALYSIS_PREFIX: &str = "cast-analysis-";
pub const AGENT_ANALYSIS_PREFIX: &str = "agent-analysis-";
pub const ENS_NAME_PREFIX: &str = "ens-name-";
pub const PROFILE_CHUNK_PREFIX: &str = "profile-chunk-";

#[derive(Clone)]
pub struct ResultCache {
    kv: Arc<dyn KvStore>,
    enabled: bool,
}

impl ResultCache {
    pub fn new(kv: Arc<dyn KvStore>, enabled: bool) -> Self {
        Self { kv, enabled }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    fn key(prefix: &str, id: &str) -> String {
        format!("{prefix}{id}")
    }

    pub async fn get<T: DeserializeOwned>(&self, prefix: &str, id: &str) -> Result<Option<T>> {
        if !self.enabled {
            return Ok(None);
        }
        let key = Self::key(prefix, id);
        match self.kv.get(&key).await? {
            Some(raw) => decode(&raw).with_context(|| format!("cache entry {key}")),
            None => Ok(None),
        }
    }

    pub async fn put<T: Serialize>(&self, prefix: &str, id: &str, value: &T) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let raw = encode(value)?;
        self.kv.set(&Self::key(prefix, id), &raw, None).await
    }

    /// Read-through: return the cached value when present, otherwise run
    /// `fetch` and persist its result.
    pub async fn get_or_compute<T, F, Fut>(&self, prefix: &str, id: &str, fetch: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if let Some(hit) = self.get(prefix, id).await? {
            debug!(prefix, id, "cache hit");
            return Ok(hit);
        }
        let value = fetch().await?;
        self.put(prefix, id, &value).await?;
        Ok(value)
    }
}

fn encode<T: Serialize>(value: &T) -> Result<String> {
    let json = serde_json::to_value(value)?;
    match json {
        serde_json::Value::String(s) => Ok(s),
        other => Ok(serde_json::to_string(&other)?),
    }
}

fn decode<T: DeserializeOwned>(raw: &str) -> Result<Option<T>> {
    let looks_like_json = matches!(raw.trim_start().chars().next(), Some('{') | Some('['));
    if looks_like_json {
        let value: serde_json::Value =
            serde_json::from_str(raw).context("cached value is not valid JSON")?;
        let empty = value.as_object().is_some_and(|o| o.is_empty())
            || value.as_array().is_some_and(|a| a.is_empty());
        if empty {
            return Err(anyhow!("cached value is an empty JSON container"));
        }
        Ok(Some(serde_json::from_value(value)?))
    } else {
        // Plain-string payloads are stored raw, without JSON quoting.
        Ok(Some(serde_json::from_value(serde_json::Value::String(
            raw.to_string(),
        ))?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grantcast_store::memory::MemoryKv;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Analysis {
        summary: String,
        score: f64,
    }

    fn cache(enabled: bool) -> ResultCache {
        ResultCache::new(Arc::new(MemoryKv::new()), enabled)
    }

    #[tokio::test]
    async fn hit_skips_the_fetch() {
        let cache = cache(true);
        let fetches = AtomicUsize::new(0);

        let fetch = || {
            fetches.fetch_add(1, Ordering::SeqCst);
            async {
                Ok(Analysis {
                    summary: "built something".into(),
                    score: 0.9,
                })
            }
        };

        let first = cache.get_or_compute("cast-analysis-", "abc", fetch).await.unwrap();
        let second = cache.get_or_compute("cast-analysis-", "abc", fetch).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn disabled_cache_always_fetches_and_never_persists() {
        let cache = cache(false);
        let fetches = AtomicUsize::new(0);

        for _ in 0..2 {
            let got: String = cache
                .get_or_compute("image-description-", "xyz", || {
                    fetches.fetch_add(1, Ordering::SeqCst);
                    async { Ok("a sunset".to_string()) }
                })
                .await
                .unwrap();
            assert_eq!(got, "a sunset");
        }

        assert_eq!(fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn plain_strings_are_stored_raw() {
        let kv = Arc::new(MemoryKv::new());
        let cache = ResultCache::new(kv.clone(), true);

        cache
            .put("image-description-", "pic", &"two people at a hackathon".to_string())
            .await
            .unwrap();

        let raw = kv.get("image-description-pic").await.unwrap().unwrap();
        assert_eq!(raw, "two people at a hackathon");

        let back: String = cache.get("image-description-", "pic").await.unwrap().unwrap();
        assert_eq!(back, "two people at a hackathon");
    }

    #[tokio::test]
    async fn empty_json_container_is_corrupted() {
        let kv = Arc::new(MemoryKv::new());
        kv.set("cast-analysis-bad", "{}", None).await.unwrap();
        let cache = ResultCache::new(kv, true);

        let err = cache.get::<Analysis>("cast-analysis-", "bad").await.unwrap_err();
        assert!(err.to_string().contains("cache entry cast-analysis-bad"));
    }

    #[tokio::test]
    async fn json_objects_round_trip() {
        let cache = cache(true);
        let value = Analysis {
            summary: "shipped v2".into(),
            score: 0.7,
        };
        cache.put("cast-analysis-", "h1", &value).await.unwrap();
        let back: Analysis = cache.get("cast-analysis-", "h1").await.unwrap().unwrap();
        assert_eq!(back, value);
    }
}
