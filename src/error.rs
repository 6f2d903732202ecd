use thiserror::Error;

/// Errors surfaced by the ingest and question-answering pipeline
#[derive(Debug, Error)]
pub enum RagError {
    /// The document could not be decoded in its declared format
    #[error("extraction failed: {0}")]
    Extraction(String),

    /// The embedding provider failed, timed out or returned a malformed response
    #[error("embedding service error: {0}")]
    EmbeddingService(String),

    /// The language model failed or timed out
    #[error("generation failed: {0}")]
    Generation(String),

    /// The corpus was never indexed or has been superseded
    #[error("corpus not found in index: {0}")]
    IndexNotFound(String),

    /// An ingest is running and there is no earlier corpus to serve
    #[error("corpus is still being ingested")]
    NotReady,

    /// Nothing has been ingested in this session yet
    #[error("no document has been ingested yet")]
    NoCorpus,

    /// The backing vector store failed for a reason other than a missing corpus
    #[error("vector store error: {0}")]
    VectorStore(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl RagError {
    /// Whether the caller (or the engine's retry loop) may try the same call again
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RagError::EmbeddingService(_) | RagError::Generation(_) | RagError::NotReady
        )
    }
}

pub type Result<T> = std::result::Result<T, RagError>;
