//! Language model seam. Stages talk to [`LanguageModel`]; the production
//! implementation routes by model name to the Anthropic or OpenAI client,
//! and tests substitute a scripted double.

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use ai_client::claude::Claude;
use ai_client::openai::OpenAi;
use ai_client::schema::StructuredOutput;

/// Fallback chain for text and structured-output calls, tried in order.
pub const MODEL_CHAIN: &[&str] = &["claude-sonnet-4-20250514", "gpt-4.1", "gpt-4o"];

/// Fallback chain for vision calls.
pub const VISION_MODEL_CHAIN: &[&str] = &["claude-sonnet-4-20250514", "gpt-4o", "gpt-4o-mini"];

#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Free-form text completion.
    async fn complete(&self, model: &str, system: &str, user: &str) -> Result<String>;

    /// Structured output constrained by `schema`.
    async fn extract_json(
        &self,
        model: &str,
        system: &str,
        user: &str,
        schema: serde_json::Value,
    ) -> Result<serde_json::Value>;

    /// Describe image bytes with a vision model.
    async fn describe_image(
        &self,
        model: &str,
        bytes: &[u8],
        mime_type: &str,
        prompt: &str,
    ) -> Result<String>;
}

/// Typed wrapper over [`LanguageModel::extract_json`].
pub async fn extract_structured<T: StructuredOutput>(
    lm: &dyn LanguageModel,
    model: &str,
    system: &str,
    user: &str,
) -> Result<T> {
    let value = lm.extract_json(model, system, user, T::strict_schema()).await?;
    serde_json::from_value(value)
        .map_err(|e| anyhow!("structured output did not match schema: {e}"))
}

/// Routes `claude-*` models to Anthropic and everything else to the
/// OpenAI-compatible client.
pub struct ModelRouter {
    claude: Option<Claude>,
    openai: OpenAi,
}

impl ModelRouter {
    pub fn new(openai: OpenAi, claude: Option<Claude>) -> Self {
        Self { claude, openai }
    }

    fn claude_for(&self, model: &str) -> Option<&Claude> {
        if model.starts_with("claude") {
            self.claude.as_ref()
        } else {
            None
        }
    }
}

#[async_trait]
impl LanguageModel for ModelRouter {
    async fn complete(&self, model: &str, system: &str, user: &str) -> Result<String> {
        match self.claude_for(model) {
            Some(claude) => claude.chat_completion(model, system, user).await,
            None => self.openai.chat_completion(model, system, user).await,
        }
    }

    async fn extract_json(
        &self,
        model: &str,
        system: &str,
        user: &str,
        schema: serde_json::Value,
    ) -> Result<serde_json::Value> {
        match self.claude_for(model) {
            Some(claude) => claude.extract_with_schema(model, system, user, schema).await,
            None => self.openai.extract_with_schema(model, system, user, schema).await,
        }
    }

    async fn describe_image(
        &self,
        model: &str,
        bytes: &[u8],
        mime_type: &str,
        prompt: &str,
    ) -> Result<String> {
        match self.claude_for(model) {
            Some(claude) => claude.describe_image(model, bytes, mime_type, prompt).await,
            None => self.openai.describe_image(model, bytes, mime_type, prompt).await,
        }
    }
}
