use anyhow::Result;
use async_trait::async_trait;

/// Embedding capability, dyn-compatible so stores can hold `Arc<dyn EmbedAgent>`.
#[async_trait]
pub trait EmbedAgent: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}
