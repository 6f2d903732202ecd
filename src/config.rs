use crate::chunking::Chunker;
use crate::error::Result as RagResult;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Pipeline configuration shared by ingest and query paths
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RagConfig {
    /// Segment length in characters
    pub chunk_size: usize,
    /// Characters shared by consecutive segments
    pub overlap: usize,
    /// Number of segments retrieved per question
    pub top_k: usize,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Upper bound on the composed prompt, in characters
    pub max_prompt_chars: usize,
    pub embed_timeout_secs: u64,
    pub generate_timeout_secs: u64,
    /// Extra attempts after a failed embedding call
    pub embed_retries: u32,
    /// Extra attempts after a failed generation call
    pub generation_retries: u32,
    pub retry_backoff_ms: u64,
    /// Segments sent per embedding request
    pub embed_batch_size: usize,
    pub embedding_model: String,
    pub generation_model: String,
    /// Collapse repeated whitespace in extracted text before chunking
    pub normalize_whitespace: bool,
}

impl Default for RagConfig {
    fn default() -> Self {
        RagConfig {
            chunk_size: 1000,
            overlap: 100,
            top_k: 4,
            temperature: 0.0,
            max_tokens: 1024,
            max_prompt_chars: 12_000,
            embed_timeout_secs: 30,
            generate_timeout_secs: 60,
            embed_retries: 2,
            generation_retries: 1,
            retry_backoff_ms: 250,
            embed_batch_size: 100,
            embedding_model: "models/text-embedding-004".to_string(),
            generation_model: "models/gemini-2.5-flash".to_string(),
            normalize_whitespace: false,
        }
    }
}

impl RagConfig {
    /// Create a configuration from defaults overlaid with `RAG_*` environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = RagConfig::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Load a JSON configuration file; missing fields keep their defaults
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: RagConfig = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Overlay any `RAG_*` environment variables that are set
    pub fn apply_env(&mut self) -> Result<()> {
        env_override("RAG_CHUNK_SIZE", &mut self.chunk_size)?;
        env_override("RAG_OVERLAP", &mut self.overlap)?;
        env_override("RAG_TOP_K", &mut self.top_k)?;
        env_override("RAG_TEMPERATURE", &mut self.temperature)?;
        env_override("RAG_MAX_TOKENS", &mut self.max_tokens)?;
        env_override("RAG_MAX_PROMPT_CHARS", &mut self.max_prompt_chars)?;
        env_override("RAG_EMBED_TIMEOUT_SECS", &mut self.embed_timeout_secs)?;
        env_override("RAG_GENERATE_TIMEOUT_SECS", &mut self.generate_timeout_secs)?;
        env_override("RAG_EMBED_RETRIES", &mut self.embed_retries)?;
        env_override("RAG_GENERATION_RETRIES", &mut self.generation_retries)?;
        env_override("RAG_RETRY_BACKOFF_MS", &mut self.retry_backoff_ms)?;
        env_override("RAG_EMBED_BATCH_SIZE", &mut self.embed_batch_size)?;
        env_override("RAG_EMBEDDING_MODEL", &mut self.embedding_model)?;
        env_override("RAG_GENERATION_MODEL", &mut self.generation_model)?;
        env_override("RAG_NORMALIZE_WHITESPACE", &mut self.normalize_whitespace)?;
        Ok(())
    }

    /// Reject chunking parameters that cannot cover the text
    pub fn validate(&self) -> RagResult<()> {
        Chunker::new(self.chunk_size, self.overlap).map(|_| ())
    }

    pub fn embed_timeout(&self) -> Duration {
        Duration::from_secs(self.embed_timeout_secs)
    }

    pub fn generate_timeout(&self) -> Duration {
        Duration::from_secs(self.generate_timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

fn env_override<T>(key: &str, target: &mut T) -> Result<()>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    if let Ok(raw) = env::var(key) {
        *target = raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid value for {}: {}", key, raw))?;
    }
    Ok(())
}
