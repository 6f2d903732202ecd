use crate::chunking::Segment;
use crate::error::{RagError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Representation of a vector embedding
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Embedding { values }
    }

    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    /// Cosine similarity in `[-1, 1]`; zero-norm vectors score 0
    pub fn cosine_similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;
        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }
        if norm_a == 0.0 || norm_b == 0.0 {
            return 0.0;
        }
        dot / (norm_a.sqrt() * norm_b.sqrt())
    }
}

/// A segment paired with the vector computed for its text
#[derive(Debug, Clone)]
pub struct EmbeddedSegment {
    pub segment: Segment,
    pub embedding: Embedding,
}

/// Text embedding provider
///
/// Batch and single-text calls must return vectors from the same embedding
/// space so corpus segments and questions are comparable.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a batch of texts, one vector per input in the same order
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>>;

    /// Embed a single query string
    async fn embed_one(&self, text: &str) -> Result<Embedding>;

    /// Identifier of the embedding model, recorded on every corpus
    fn model_id(&self) -> &str;
}

/// Check that a batch response lines up with its request
///
/// Providers that drop items or mix dimensions have returned a malformed
/// response; the segment/vector pairing would be wrong otherwise.
pub fn validate_batch(expected: usize, embeddings: &[Embedding]) -> Result<()> {
    if embeddings.len() != expected {
        return Err(RagError::EmbeddingService(format!(
            "expected {} embeddings, provider returned {}",
            expected,
            embeddings.len()
        )));
    }

    if let Some(first) = embeddings.first() {
        let dimension = first.dimension();
        if dimension == 0 {
            return Err(RagError::EmbeddingService(
                "provider returned an empty embedding".to_string(),
            ));
        }
        if let Some(bad) = embeddings.iter().position(|e| e.dimension() != dimension) {
            return Err(RagError::EmbeddingService(format!(
                "embedding {} has dimension {}, expected {}",
                bad,
                embeddings[bad].dimension(),
                dimension
            )));
        }
    }

    Ok(())
}
