//! Embedded media description. Casts carry attachment URLs (images, HLS
//! streams, YouTube links, Zora mint pages); each is turned into a short
//! text description that rides along with the cast text into models and
//! embeddings. Descriptions are cached by URL hash, and every path
//! degrades to `None` rather than failing the surrounding job.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use url::Url;

use crate::cache::{ResultCache, IMAGE_DESCRIPTION_PREFIX, VIDEO_DESCRIPTION_PREFIX};
use crate::invoker::{invoke_with_fallback, RetryPolicy};
use crate::model::{LanguageModel, VISION_MODEL_CHAIN};
use grantcast_store::cast_store::CastStore;

const IMAGE_PROMPT: &str =
    "Describe this image in two or three sentences. Focus on what is shown and any visible text.";
const VIDEO_PROMPT: &str =
    "Describe this video in two or three sentences. Focus on what happens and any spoken or shown text.";

const MAX_VIDEO_POLLS: u32 = 30;
const VIDEO_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Hosts we will fetch media from. Anything else is ignored.
const ALLOWED_MEDIA_HOSTS: &[&str] = &[
    "imagedelivery.net",
    "imgur.com",
    "ipfs.io",
    "arweave.net",
    "stream.warpcast.com",
    "wrpcd.net",
    "supercast.mypinata.cloud",
    "zora.co",
    "youtube.com",
    "youtu.be",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Video,
    YouTube,
    Zora,
    Unsupported,
}

pub fn classify_media_url(raw: &str) -> MediaKind {
    let Ok(url) = Url::parse(raw) else {
        return MediaKind::Unsupported;
    };
    let host = url.host_str().unwrap_or_default();
    if host_matches(host, "youtube.com") || host_matches(host, "youtu.be") {
        return MediaKind::YouTube;
    }
    if host_matches(host, "zora.co") {
        return MediaKind::Zora;
    }
    let path = url.path().to_ascii_lowercase();
    if [".png", ".jpg", ".jpeg", ".gif", ".webp"].iter().any(|ext| path.ends_with(ext)) {
        return MediaKind::Image;
    }
    if [".m3u8", ".mp4", ".mov", ".webm"].iter().any(|ext| path.ends_with(ext)) {
        return MediaKind::Video;
    }
    // Farcaster's image CDN serves extensionless variant URLs.
    if host_matches(host, "imagedelivery.net") {
        return MediaKind::Image;
    }
    MediaKind::Unsupported
}

fn host_matches(host: &str, allowed: &str) -> bool {
    host == allowed || host.ends_with(&format!(".{allowed}"))
}

fn host_allowed(raw: &str) -> bool {
    Url::parse(raw)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .is_some_and(|host| ALLOWED_MEDIA_HOSTS.iter().any(|a| host_matches(&host, a)))
}

fn url_cache_id(url: &str) -> String {
    hex::encode(Sha256::digest(url.as_bytes()))
}

/// Fetches raw media bytes. A seam so tests never touch the network.
#[async_trait]
pub trait MediaFetcher: Send + Sync {
    /// Returns the body and its content type.
    async fn fetch(&self, url: &str) -> Result<(Vec<u8>, String)>;
}

pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<(Vec<u8>, String)> {
        let response = self.client.get(url).send().await?.error_for_status()?;
        let mime = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .split(';')
            .next()
            .unwrap_or_default()
            .to_string();
        let bytes = response.bytes().await?.to_vec();
        Ok((bytes, mime))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoState {
    Processing,
    Ready,
    Failed,
}

/// Hosted video-analysis provider: upload a file, wait for server-side
/// processing, ask for a description, delete the upload.
#[async_trait]
pub trait VideoAnalyzer: Send + Sync {
    async fn upload(&self, path: &Path, mime_type: &str) -> Result<String>;
    async fn status(&self, remote_id: &str) -> Result<VideoState>;
    async fn describe(&self, remote_id: &str, prompt: &str) -> Result<String>;
    async fn delete(&self, remote_id: &str) -> Result<()>;
    /// Some providers ingest public video URLs (YouTube) directly.
    async fn describe_url(&self, url: &str, prompt: &str) -> Result<String>;
}

pub struct MediaDescriber {
    cache: ResultCache,
    lm: Arc<dyn LanguageModel>,
    store: Arc<dyn CastStore>,
    fetcher: Arc<dyn MediaFetcher>,
    video: Option<Arc<dyn VideoAnalyzer>>,
    retry: RetryPolicy,
}

impl MediaDescriber {
    pub fn new(
        cache: ResultCache,
        lm: Arc<dyn LanguageModel>,
        store: Arc<dyn CastStore>,
        fetcher: Arc<dyn MediaFetcher>,
        video: Option<Arc<dyn VideoAnalyzer>>,
    ) -> Self {
        Self {
            cache,
            lm,
            store,
            fetcher,
            video,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Describe one attachment URL. Unsupported URLs, disallowed hosts,
    /// and description failures all come back as `None`.
    pub async fn describe(&self, url: &str) -> Option<String> {
        match self.describe_inner(url).await {
            Ok(description) => description,
            Err(err) => {
                warn!(url, error = %err, "media description failed, continuing without it");
                None
            }
        }
    }

    /// Describe every URL, keeping only the ones that produced text.
    pub async fn describe_all(&self, urls: &[String]) -> Vec<String> {
        let mut descriptions = Vec::new();
        for url in urls {
            if let Some(text) = self.describe(url).await {
                descriptions.push(text);
            }
        }
        descriptions
    }

    async fn describe_inner(&self, url: &str) -> Result<Option<String>> {
        match classify_media_url(url) {
            MediaKind::Unsupported => Ok(None),
            MediaKind::Image => self.describe_image(url).await.map(Some),
            MediaKind::Video => self.describe_video(url).await,
            MediaKind::YouTube => self.describe_youtube(url).await,
            MediaKind::Zora => self.describe_zora(url).await,
        }
    }

    async fn describe_image(&self, url: &str) -> Result<String> {
        let id = url_cache_id(url);
        if let Some(hit) = self.cache.get::<String>(IMAGE_DESCRIPTION_PREFIX, &id).await? {
            debug!(url, "image description cache hit");
            return Ok(hit);
        }
        if !host_allowed(url) {
            return Err(anyhow!("host not on media allowlist: {url}"));
        }

        let (bytes, mime) = self.fetcher.fetch(url).await.context("image download")?;
        let description = invoke_with_fallback(
            "image description",
            VISION_MODEL_CHAIN,
            self.retry,
            0,
            |model| self.lm.describe_image(model, &bytes, &mime, IMAGE_PROMPT),
        )
        .await?;

        self.cache.put(IMAGE_DESCRIPTION_PREFIX, &id, &description).await?;
        Ok(description)
    }

    async fn describe_video(&self, url: &str) -> Result<Option<String>> {
        let id = url_cache_id(url);
        if let Some(hit) = self.cache.get::<String>(VIDEO_DESCRIPTION_PREFIX, &id).await? {
            debug!(url, "video description cache hit");
            return Ok(Some(hit));
        }
        let Some(video) = self.video.as_ref() else {
            return Ok(None);
        };
        if !host_allowed(url) {
            return Err(anyhow!("host not on media allowlist: {url}"));
        }

        let target = if url.to_ascii_lowercase().contains(".m3u8") {
            let (playlist, _) = self.fetcher.fetch(url).await.context("playlist download")?;
            let playlist = String::from_utf8_lossy(&playlist).into_owned();
            select_lowest_bitrate_variant(&playlist, url)
                .ok_or_else(|| anyhow!("no variant streams in playlist"))?
        } else {
            url.to_string()
        };

        let (bytes, mime) = self.fetcher.fetch(&target).await.context("video download")?;

        // Spool to disk so the upload reads from a file that is removed
        // when this scope exits, success or not.
        let mut spool = tempfile::NamedTempFile::new()?;
        spool.write_all(&bytes)?;
        spool.flush()?;

        let remote_id = video.upload(spool.path(), &mime).await?;
        let description = self.await_video_description(video.as_ref(), &remote_id).await;
        if let Err(err) = video.delete(&remote_id).await {
            warn!(remote_id, error = %err, "failed to delete uploaded video");
        }
        let description = description?;

        self.cache.put(VIDEO_DESCRIPTION_PREFIX, &id, &description).await?;
        Ok(Some(description))
    }

    async fn await_video_description(
        &self,
        video: &dyn VideoAnalyzer,
        remote_id: &str,
    ) -> Result<String> {
        for _ in 0..MAX_VIDEO_POLLS {
            match video.status(remote_id).await? {
                VideoState::Ready => return video.describe(remote_id, VIDEO_PROMPT).await,
                VideoState::Failed => return Err(anyhow!("video processing failed upstream")),
                VideoState::Processing => tokio::time::sleep(VIDEO_POLL_INTERVAL).await,
            }
        }
        Err(anyhow!(
            "video still processing after {MAX_VIDEO_POLLS} polls"
        ))
    }

    async fn describe_youtube(&self, url: &str) -> Result<Option<String>> {
        let id = url_cache_id(url);
        if let Some(hit) = self.cache.get::<String>(VIDEO_DESCRIPTION_PREFIX, &id).await? {
            return Ok(Some(hit));
        }
        let Some(video) = self.video.as_ref() else {
            return Ok(None);
        };
        let description = video.describe_url(url, VIDEO_PROMPT).await?;
        self.cache.put(VIDEO_DESCRIPTION_PREFIX, &id, &description).await?;
        Ok(Some(description))
    }

    /// Zora mint pages resolve to token metadata; the token's own media is
    /// then described through the image or video path.
    async fn describe_zora(&self, url: &str) -> Result<Option<String>> {
        let Some(metadata) = self.store.get_token_metadata_for_url(url).await? else {
            return Ok(None);
        };

        let mut parts = Vec::new();
        if !metadata.name.is_empty() {
            parts.push(format!("Minted token: {}", metadata.name));
        }
        if !metadata.description.is_empty() {
            parts.push(metadata.description.clone());
        }
        if let Some(image_url) = metadata.image_url.as_deref() {
            if let Ok(text) = self.describe_image(image_url).await {
                parts.push(text);
            }
        } else if let Some(animation_url) = metadata.animation_url.as_deref() {
            if let Ok(Some(text)) = self.describe_video(animation_url).await {
                parts.push(text);
            }
        }

        if parts.is_empty() {
            Ok(None)
        } else {
            Ok(Some(parts.join(" ")))
        }
    }
}

/// REST implementation of [`VideoAnalyzer`] against the hosted video
/// analysis service.
pub struct HttpVideoAnalyzer {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpVideoAnalyzer {
    pub const DEFAULT_BASE_URL: &'static str = "https://video-analysis.grantcast.dev/v1";

    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: Self::DEFAULT_BASE_URL.to_string(),
            api_key: api_key.into(),
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}{path}", self.base_url))
            .bearer_auth(&self.api_key)
    }
}

#[derive(serde::Deserialize)]
struct VideoFileResponse {
    id: String,
    #[serde(default)]
    state: String,
}

#[derive(serde::Deserialize)]
struct VideoDescribeResponse {
    description: String,
}

#[async_trait]
impl VideoAnalyzer for HttpVideoAnalyzer {
    async fn upload(&self, path: &Path, mime_type: &str) -> Result<String> {
        let bytes = tokio::fs::read(path).await?;
        let response: VideoFileResponse = self
            .request(reqwest::Method::POST, "/files")
            .header(reqwest::header::CONTENT_TYPE, mime_type)
            .body(bytes)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response.id)
    }

    async fn status(&self, remote_id: &str) -> Result<VideoState> {
        let response: VideoFileResponse = self
            .request(reqwest::Method::GET, &format!("/files/{remote_id}"))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(match response.state.as_str() {
            "ready" => VideoState::Ready,
            "failed" => VideoState::Failed,
            _ => VideoState::Processing,
        })
    }

    async fn describe(&self, remote_id: &str, prompt: &str) -> Result<String> {
        let response: VideoDescribeResponse = self
            .request(reqwest::Method::POST, &format!("/files/{remote_id}/describe"))
            .json(&serde_json::json!({ "prompt": prompt }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response.description)
    }

    async fn delete(&self, remote_id: &str) -> Result<()> {
        self.request(reqwest::Method::DELETE, &format!("/files/{remote_id}"))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn describe_url(&self, url: &str, prompt: &str) -> Result<String> {
        let response: VideoDescribeResponse = self
            .request(reqwest::Method::POST, "/describe-url")
            .json(&serde_json::json!({ "url": url, "prompt": prompt }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response.description)
    }
}

/// Pick the variant URI with the lowest advertised BANDWIDTH from a master
/// HLS playlist, resolved against the playlist's own URL.
pub fn select_lowest_bitrate_variant(playlist: &str, base_url: &str) -> Option<String> {
    let base = Url::parse(base_url).ok()?;
    let mut best: Option<(u64, String)> = None;
    let mut pending_bandwidth: Option<u64> = None;

    for line in playlist.lines().map(str::trim) {
        if let Some(attrs) = line.strip_prefix("#EXT-X-STREAM-INF:") {
            pending_bandwidth = attrs
                .split(',')
                .find_map(|attr| attr.strip_prefix("BANDWIDTH="))
                .and_then(|v| v.parse().ok());
        } else if !line.is_empty() && !line.starts_with('#') {
            if let Some(bandwidth) = pending_bandwidth.take() {
                let resolved = base.join(line).ok()?.to_string();
                if best.as_ref().is_none_or(|(b, _)| bandwidth < *b) {
                    best = Some((bandwidth, resolved));
                }
            }
        }
    }

    best.map(|(_, uri)| uri)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_table() {
        let cases = [
            ("https://imagedelivery.net/abc/cast/original", MediaKind::Image),
            ("https://i.imgur.com/shot.PNG", MediaKind::Image),
            ("https://stream.warpcast.com/v1/video.m3u8", MediaKind::Video),
            ("https://arweave.net/clip.mp4", MediaKind::Video),
            ("https://www.youtube.com/watch?v=dQw4w9WgXcQ", MediaKind::YouTube),
            ("https://youtu.be/dQw4w9WgXcQ", MediaKind::YouTube),
            ("https://zora.co/collect/base:0xabc/1", MediaKind::Zora),
            ("https://example.com/page", MediaKind::Unsupported),
            ("not a url", MediaKind::Unsupported),
        ];
        for (url, expected) in cases {
            assert_eq!(classify_media_url(url), expected, "{url}");
        }
    }

    #[test]
    fn allowlist_rejects_lookalike_hosts() {
        assert!(host_allowed("https://ipfs.io/ipfs/Qm123/pic.png"));
        assert!(host_allowed("https://sub.imagedelivery.net/x/y"));
        assert!(!host_allowed("https://evilimagedelivery.net/x.png"));
        assert!(!host_allowed("https://example.com/a.png"));
    }

    #[test]
    fn lowest_bitrate_variant_wins() {
        let playlist = "\
#EXTM3U
#EXT-X-STREAM-INF:BANDWIDTH=2500000,RESOLUTION=1280x720
high/index.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=400000,RESOLUTION=480x270
low/index.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=1200000,RESOLUTION=854x480
mid/index.m3u8
";
        let picked =
            select_lowest_bitrate_variant(playlist, "https://stream.warpcast.com/v1/video.m3u8")
                .unwrap();
        assert_eq!(picked, "https://stream.warpcast.com/v1/low/index.m3u8");
    }

    #[test]
    fn playlist_without_variants_yields_none() {
        assert!(select_lowest_bitrate_variant("#EXTM3U\n#EXT-X-TARGETDURATION:6\n", "https://s/x.m3u8").is_none());
    }

    mod flows {
        use super::super::*;
        use crate::cache::ResultCache;
        use crate::invoker::RetryPolicy;
        use crate::testing::{MapFetcher, MockCastStore, ScriptedModel, ScriptedVideo};
        use grantcast_store::kv::KvStore;
        use grantcast_store::memory::MemoryKv;
        use std::sync::Arc;
        use std::time::Duration;

        struct Fixture {
            kv: Arc<MemoryKv>,
            lm: Arc<ScriptedModel>,
            fetcher: Arc<MapFetcher>,
        }

        fn describer(video: Option<Arc<dyn VideoAnalyzer>>) -> (MediaDescriber, Fixture) {
            let kv = Arc::new(MemoryKv::new());
            let lm = Arc::new(ScriptedModel::new());
            let fetcher = Arc::new(MapFetcher::new());
            let describer = MediaDescriber::new(
                ResultCache::new(kv.clone(), true),
                lm.clone(),
                Arc::new(MockCastStore::new()),
                fetcher.clone(),
                video,
            )
            .with_retry(RetryPolicy {
                max_retries: 0,
                base_delay: Duration::from_millis(1),
            });
            (describer, Fixture { kv, lm, fetcher })
        }

        #[tokio::test]
        async fn image_description_is_cached_by_url() {
            let (describer, fx) = describer(None);
            fx.fetcher.insert("https://i.imgur.com/pic.png", b"\x89PNG", "image/png");
            fx.lm.push_image_description("two builders at a demo");

            let first = describer.describe("https://i.imgur.com/pic.png").await;
            assert_eq!(first.as_deref(), Some("two builders at a demo"));

            // Second call needs neither fetch nor model.
            let second = describer.describe("https://i.imgur.com/pic.png").await;
            assert_eq!(second, first);
        }

        #[tokio::test(start_paused = true)]
        async fn video_flow_polls_until_ready_and_deletes_the_upload() {
            let video = Arc::new(ScriptedVideo::new(
                vec![VideoState::Processing, VideoState::Processing, VideoState::Ready],
                "a demo walkthrough",
            ));
            let (describer, fx) = describer(Some(video.clone()));
            fx.fetcher.insert("https://arweave.net/clip.mp4", b"mp4bytes", "video/mp4");

            let got = describer.describe("https://arweave.net/clip.mp4").await;
            assert_eq!(got.as_deref(), Some("a demo walkthrough"));
            assert_eq!(video.uploads.lock().unwrap().as_slice(), ["video/mp4"]);
            assert_eq!(video.deletions.lock().unwrap().len(), 1);

            let id = url_cache_id("https://arweave.net/clip.mp4");
            let cached = fx.kv.get(&format!("video-description-{id}")).await.unwrap();
            assert_eq!(cached.as_deref(), Some("a demo walkthrough"));
        }

        #[tokio::test(start_paused = true)]
        async fn failed_processing_still_deletes_the_upload() {
            let video = Arc::new(ScriptedVideo::new(vec![VideoState::Failed], "unused"));
            let (describer, fx) = describer(Some(video.clone()));
            fx.fetcher.insert("https://arweave.net/clip.mp4", b"mp4bytes", "video/mp4");

            // Degrades to None but the remote file is cleaned up.
            assert!(describer.describe("https://arweave.net/clip.mp4").await.is_none());
            assert_eq!(video.deletions.lock().unwrap().len(), 1);
        }

        #[tokio::test]
        async fn hls_source_downloads_the_lowest_bitrate_variant() {
            let video = Arc::new(ScriptedVideo::new(vec![VideoState::Ready], "stream recap"));
            let (describer, fx) = describer(Some(video.clone()));
            fx.fetcher.insert(
                "https://stream.warpcast.com/v1/video.m3u8",
                b"#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=900000\nhigh.m3u8\n#EXT-X-STREAM-INF:BANDWIDTH=300000\nlow.m3u8\n",
                "application/vnd.apple.mpegurl",
            );
            fx.fetcher.insert("https://stream.warpcast.com/v1/low.m3u8", b"segments", "video/mp2t");

            let got = describer.describe("https://stream.warpcast.com/v1/video.m3u8").await;
            assert_eq!(got.as_deref(), Some("stream recap"));
            assert_eq!(video.uploads.lock().unwrap().as_slice(), ["video/mp2t"]);
        }

        #[tokio::test]
        async fn zora_url_describes_the_token_image() {
            let kv = Arc::new(MemoryKv::new());
            let lm = Arc::new(ScriptedModel::new());
            let fetcher = Arc::new(MapFetcher::new());
            let store = Arc::new(MockCastStore::new());
            store.insert_token_metadata(
                "https://zora.co/collect/base:0xabc/1",
                grantcast_common::TokenMetadata {
                    name: "Beta Launch".into(),
                    description: "launch art".into(),
                    image_url: Some("https://ipfs.io/ipfs/Qm1/art.png".into()),
                    animation_url: None,
                },
            );
            fetcher.insert("https://ipfs.io/ipfs/Qm1/art.png", b"png", "image/png");
            lm.push_image_description("abstract launch artwork");

            let describer = MediaDescriber::new(
                ResultCache::new(kv, true),
                lm,
                store,
                fetcher,
                None,
            );

            let got = describer.describe("https://zora.co/collect/base:0xabc/1").await.unwrap();
            assert!(got.contains("Minted token: Beta Launch"));
            assert!(got.contains("abstract launch artwork"));
        }

        #[tokio::test]
        async fn video_without_analyzer_degrades_to_none() {
            let (describer, _fx) = describer(None);
            assert!(describer.describe("https://arweave.net/clip.mp4").await.is_none());
        }
    }
}
