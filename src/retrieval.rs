use crate::database::{RetrievedContext, VectorIndex};
use crate::embeddings::Embedder;
use crate::error::{RagError, Result};
use crate::retry::{bounded, RetryPolicy};
use log::debug;
use std::sync::Arc;
use std::time::Duration;

/// Embeds questions and looks up the nearest corpus segments
#[derive(Clone)]
pub struct Retriever {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    embed_timeout: Duration,
    retry: RetryPolicy,
}

impl Retriever {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        embed_timeout: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Retriever {
            embedder,
            index,
            embed_timeout,
            retry,
        }
    }

    /// Return up to `k` segments of `corpus_id` ranked by similarity to `question`
    ///
    /// Embedding and index errors are returned unchanged.
    pub async fn retrieve(&self, corpus_id: &str, question: &str, k: usize) -> Result<RetrievedContext> {
        let query = self
            .retry
            .run("question embedding", || {
                bounded(
                    self.embed_timeout,
                    RagError::EmbeddingService,
                    self.embedder.embed_one(question),
                )
            })
            .await?;

        let context = self.index.query(corpus_id, &query, k).await?;
        debug!(
            "Retrieved {} segments from corpus {} (k={})",
            context.len(),
            corpus_id,
            k
        );

        Ok(context)
    }
}
