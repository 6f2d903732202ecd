use crate::embeddings::{validate_batch, Embedder, Embedding};
use crate::error::{RagError, Result};
use crate::generation::LanguageModel;
use anyhow::Context;
use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};
use std::env;

const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Configuration for Gemini API
#[derive(Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub api_base: String,
    pub embedding_model: String,
    pub generation_model: String,
}

impl GeminiConfig {
    /// Create a new configuration from environment variables
    pub fn from_env(embedding_model: &str, generation_model: &str) -> anyhow::Result<Self> {
        let api_key = env::var("GEMINI_API_KEY").context("GEMINI_API_KEY not set")?;
        let api_base = env::var("GEMINI_API_BASE").unwrap_or_else(|_| DEFAULT_API_BASE.to_string());

        Ok(GeminiConfig {
            api_key,
            api_base: api_base.trim_end_matches('/').to_string(),
            embedding_model: embedding_model.to_string(),
            generation_model: generation_model.to_string(),
        })
    }

    fn endpoint(&self, model: &str, method: &str) -> String {
        format!("{}/{}:{}?key={}", self.api_base, model, method, self.api_key)
    }
}

/// Client for interacting with Gemini API
#[derive(Clone)]
pub struct GeminiClient {
    config: GeminiConfig,
    client: reqwest::Client,
}

impl GeminiClient {
    /// Create a new Gemini client
    pub fn new(config: GeminiConfig) -> Self {
        let client = reqwest::Client::new();
        GeminiClient { config, client }
    }

    /// Get the client configuration
    pub fn config(&self) -> &GeminiConfig {
        &self.config
    }

    async fn post<Req, Resp>(&self, url: &str, request: &Req) -> std::result::Result<Resp, String>
    where
        Req: Serialize + ?Sized,
        Resp: for<'de> Deserialize<'de>,
    {
        let response = self
            .client
            .post(url)
            .json(request)
            .send()
            .await
            .map_err(|e| format!("request failed: {}", e))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(format!("API request failed: {} {}", status, error_text));
        }

        response
            .json()
            .await
            .map_err(|e| format!("malformed response: {}", e))
    }
}

#[async_trait]
impl Embedder for GeminiClient {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let model = self.config.embedding_model.as_str();
        let request = BatchEmbeddingRequest {
            requests: texts
                .iter()
                .map(|text| EmbeddingRequest {
                    model,
                    content: EmbeddingContent {
                        parts: vec![Part {
                            text: text.as_str(),
                        }],
                    },
                })
                .collect(),
        };

        debug!("Embedding batch of {} texts with {}", texts.len(), model);
        let url = self.config.endpoint(model, "batchEmbedContents");
        let response: BatchEmbeddingResponse = self
            .post(&url, &request)
            .await
            .map_err(RagError::EmbeddingService)?;

        let embeddings: Vec<Embedding> = response
            .embeddings
            .into_iter()
            .map(|data| Embedding::new(data.values))
            .collect();
        validate_batch(texts.len(), &embeddings)?;

        Ok(embeddings)
    }

    async fn embed_one(&self, text: &str) -> Result<Embedding> {
        let model = self.config.embedding_model.as_str();
        let request = EmbeddingRequest {
            model,
            content: EmbeddingContent {
                parts: vec![Part { text }],
            },
        };

        let url = self.config.endpoint(model, "embedContent");
        let response: EmbeddingResponse = self
            .post(&url, &request)
            .await
            .map_err(RagError::EmbeddingService)?;

        if response.embedding.values.is_empty() {
            return Err(RagError::EmbeddingService(
                "provider returned an empty embedding".to_string(),
            ));
        }

        Ok(Embedding::new(response.embedding.values))
    }

    fn model_id(&self) -> &str {
        &self.config.embedding_model
    }
}

#[async_trait]
impl LanguageModel for GeminiClient {
    async fn generate(&self, prompt: &str, max_tokens: u32, temperature: f32) -> Result<String> {
        let model = self.config.generation_model.as_str();
        let request = GenerateRequest {
            contents: vec![Content::new_with_role(prompt, "user")],
            generation_config: GenerationConfig {
                temperature,
                top_p: 0.8,
                top_k: 40,
                max_output_tokens: max_tokens,
            },
        };

        let url = self.config.endpoint(model, "generateContent");
        let response_data: GenerateResponse = self
            .post(&url, &request)
            .await
            .map_err(RagError::Generation)?;

        response_data
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content.parts.into_iter().next())
            .map(|p| p.text)
            .ok_or_else(|| RagError::Generation("No response generated".to_string()))
    }

    fn model_id(&self) -> &str {
        &self.config.generation_model
    }
}

// Request/response structures for the Gemini API

#[derive(Serialize)]
struct EmbeddingContent<'a> {
    parts: Vec<Part<'a>>,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    content: EmbeddingContent<'a>,
}

#[derive(Serialize)]
struct BatchEmbeddingRequest<'a> {
    requests: Vec<EmbeddingRequest<'a>>,
}

#[derive(Deserialize, Debug)]
struct EmbeddingResponse {
    embedding: EmbeddingData,
}

#[derive(Deserialize, Debug)]
struct BatchEmbeddingResponse {
    #[serde(default)]
    embeddings: Vec<EmbeddingData>,
}

#[derive(Deserialize, Debug)]
struct EmbeddingData {
    values: Vec<f32>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    contents: Vec<Content<'a>>,
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
struct Content<'a> {
    parts: Vec<Part<'a>>,
    role: &'static str,
}

impl<'a> Content<'a> {
    fn new_with_role(text: &'a str, role: &'static str) -> Self {
        Content {
            parts: vec![Part { text }],
            role,
        }
    }
}

#[derive(Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    top_p: f32,
    top_k: i32,
    max_output_tokens: u32,
}

#[derive(Deserialize, Debug)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize, Debug)]
struct Candidate {
    content: ResponseContent,
}

#[derive(Deserialize, Debug)]
struct ResponseContent {
    parts: Vec<ResponsePart>,
}

#[derive(Deserialize, Debug)]
struct ResponsePart {
    text: String,
}
