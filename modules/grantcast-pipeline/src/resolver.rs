//! Handle-to-address resolution for story participants. Successful
//! lookups are cached; failures and misses are not, so a later run can
//! retry them.

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::cache::{ResultCache, ENS_NAME_PREFIX};

#[async_trait]
pub trait NameResolver: Send + Sync {
    /// Resolve a handle (Farcaster fname or ENS name) to an address.
    async fn resolve(&self, handle: &str) -> Result<Option<String>>;
}

/// Resolver backed by the public ensdata API.
pub struct EnsDataResolver {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct EnsDataResponse {
    #[serde(default)]
    address: Option<String>,
}

impl EnsDataResolver {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: "https://api.ensdata.net".to_string(),
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }
}

impl Default for EnsDataResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NameResolver for EnsDataResolver {
    async fn resolve(&self, handle: &str) -> Result<Option<String>> {
        let response = self
            .client
            .get(format!("{}/{handle}", self.base_url))
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body: EnsDataResponse = response.error_for_status()?.json().await?;
        Ok(body.address)
    }
}

/// Cache-through resolution. Only positive results are persisted.
pub async fn resolve_cached(
    cache: &ResultCache,
    resolver: &dyn NameResolver,
    handle: &str,
) -> Result<Option<String>> {
    let handle = handle.trim().trim_start_matches('@').to_lowercase();
    if handle.is_empty() {
        return Ok(None);
    }
    if let Some(hit) = cache.get::<String>(ENS_NAME_PREFIX, &handle).await? {
        debug!(handle, "name resolution cache hit");
        return Ok(Some(hit));
    }
    let resolved = resolver.resolve(&handle).await?;
    if let Some(address) = resolved.as_deref() {
        cache.put(ENS_NAME_PREFIX, &handle, &address.to_string()).await?;
    }
    Ok(resolved)
}
