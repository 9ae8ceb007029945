mod client;
pub(crate) mod types;

use anyhow::{anyhow, Result};

use crate::schema::StructuredOutput;
use client::ClaudeClient;
use types::*;

/// Anthropic agent. Structured output rides on a forced tool call so the
/// model must answer in the requested schema.
#[derive(Clone)]
pub struct Claude {
    api_key: String,
    base_url: Option<String>,
}

impl Claude {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: None,
        }
    }

    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("ANTHROPIC_API_KEY")
            .map_err(|_| anyhow!("ANTHROPIC_API_KEY environment variable not set"))?;
        Ok(Self::new(api_key))
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    fn client(&self) -> ClaudeClient {
        let client = ClaudeClient::new(&self.api_key);
        if let Some(ref url) = self.base_url {
            client.with_base_url(url)
        } else {
            client
        }
    }

    pub async fn chat_completion(
        &self,
        model: &str,
        system: impl Into<String>,
        user: impl Into<String>,
    ) -> Result<String> {
        let request = ChatRequest::new(model)
            .system(system)
            .message(WireMessage::user(user))
            .temperature(0.0);

        let response = self.client().chat(&request).await?;

        response
            .text()
            .ok_or_else(|| anyhow!("No response from Claude"))
    }

    /// Structured output against an explicit schema, forced through a tool
    /// call. Returns the raw tool input; callers deserialize themselves.
    pub async fn extract_with_schema(
        &self,
        model: &str,
        system_prompt: impl Into<String>,
        user_prompt: impl Into<String>,
        schema: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let tool_name = "structured_response";
        let mut request = ChatRequest::new(model)
            .system(system_prompt)
            .message(WireMessage::user(user_prompt))
            .tool(ToolDefinitionWire {
                name: tool_name.to_string(),
                description: "Extract structured data from the input.".to_string(),
                input_schema: schema,
            });
        request.tool_choice = Some(serde_json::json!({
            "type": "tool",
            "name": tool_name,
        }));

        let response = self.client().chat(&request).await?;

        for block in response.content {
            if let ContentBlock::ToolUse { input, .. } = block {
                return Ok(input);
            }
        }

        Err(anyhow!("No structured output in Claude response"))
    }

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

    /// Send image bytes to Claude vision and return a description.
    pub async fn describe_image(
        &self,
        model: &str,
        bytes: &[u8],
        mime_type: &str,
        prompt: &str,
    ) -> Result<String> {
        use base64::Engine;

        let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
        let source = ImageSource {
            source_type: "base64".to_string(),
            media_type: mime_type.to_string(),
            data: encoded,
        };

        let request = ChatRequest::new(model)
            .message(WireMessage::user_with_image(source, prompt))
            .temperature(0.0);

        let response = self.client().chat(&request).await?;

        response
            .text()
            .ok_or_else(|| anyhow!("No text response from Claude vision"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claude_new_holds_key() {
        let ai = Claude::new("sk-ant-test");
        assert_eq!(ai.api_key, "sk-ant-test");
        assert!(ai.base_url.is_none());
    }

    #[test]
    fn claude_with_base_url() {
        let ai = Claude::new("sk-ant-test").with_base_url("https://proxy.example");
        assert_eq!(ai.base_url.as_deref(), Some("https://proxy.example"));
    }
}
