mod client;
pub(crate) mod types;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::schema::StructuredOutput;
use crate::traits::EmbedAgent;
use client::OpenAiClient;
use types::{ChatRequest, JsonSchemaFormat, ResponseFormat, WireMessage};

/// OpenAI-compatible agent. Also covers OpenRouter and any other provider
/// speaking the `/chat/completions` + `/embeddings` wire format via
/// `with_base_url`.
#[derive(Clone)]
pub struct OpenAi {
    api_key: String,
    model: String,
    embedding_model: String,
    base_url: Option<String>,
}

impl OpenAi {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            embedding_model: "text-embedding-3-small".to_string(),
            base_url: None,
        }
    }

    pub fn from_env(model: impl Into<String>) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow!("OPENAI_API_KEY environment variable not set"))?;
        Ok(Self::new(api_key, model))
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn with_embedding_model(mut self, model: impl Into<String>) -> Self {
        self.embedding_model = model.into();
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn client(&self) -> OpenAiClient {
        let client = OpenAiClient::new(&self.api_key);
        if let Some(ref url) = self.base_url {
            client.with_base_url(url)
        } else {
            client
        }
    }

    /// Simple chat completion against a specific model.
    pub async fn chat_completion(
        &self,
        model: &str,
        system: impl Into<String>,
        user: impl Into<String>,
    ) -> Result<String> {
        let request = ChatRequest::new(model)
            .message(WireMessage::system(system))
            .message(WireMessage::user(user))
            .max_tokens(4096)
            .temperature(0.0);

        self.client().chat(&request).await
    }

    /// Structured output against an explicit strict JSON schema. Returns
    /// the raw JSON value; callers deserialize into their own type.
    pub async fn extract_with_schema(
        &self,
        model: &str,
        system_prompt: impl Into<String>,
        user_prompt: impl Into<String>,
        schema: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let request = ChatRequest::new(model)
            .message(WireMessage::system(system_prompt))
            .message(WireMessage::user(user_prompt))
            .temperature(0.0)
            .response_format(ResponseFormat {
                format_type: "json_schema".to_string(),
                json_schema: JsonSchemaFormat {
                    name: "structured_response".to_string(),
                    strict: true,
                    schema,
                },
            });

        let json_str = self.client().chat(&request).await?;

        serde_json::from_str(&json_str)
            .map_err(|e| anyhow!("Failed to parse structured response: {}", e))
    }

    /// Type-safe structured output extraction via strict JSON schema.
    pub async fn extract<T: StructuredOutput>(
        &self,
        model: &str,
        system_prompt: impl Into<String>,
        user_prompt: impl Into<String>,
    ) -> Result<T> {
        let value = self
            .extract_with_schema(model, system_prompt, user_prompt, T::strict_schema())
            .await?;
        serde_json::from_value(value)
            .map_err(|e| anyhow!("Failed to deserialize response: {}", e))
    }

    /// Describe image bytes via a vision model, inlined as a data URL.
    pub async fn describe_image(
        &self,
        model: &str,
        bytes: &[u8],
        mime_type: &str,
        prompt: &str,
    ) -> Result<String> {
        use base64::Engine;

        let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
        let data_url = format!("data:{mime_type};base64,{encoded}");
        let request = ChatRequest::new(model)
            .message(WireMessage::user_with_image_url(&data_url, prompt))
            .max_tokens(4096)
            .temperature(0.0);

        self.client().chat(&request).await
    }
}

#[async_trait]
impl EmbedAgent for OpenAi {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let vectors = self.client().embed(&self.embedding_model, text).await?;
        vectors
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("No embedding in response"))
    }
}
