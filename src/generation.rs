use crate::error::Result;
use async_trait::async_trait;

/// Text generation provider
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Produce a completion for `prompt`
    async fn generate(&self, prompt: &str, max_tokens: u32, temperature: f32) -> Result<String>;

    fn model_id(&self) -> &str;
}
