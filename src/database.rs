//! Vector index backings: an in-process exact scan and a Qdrant adapter.

use crate::chunking::Segment;
use crate::embeddings::{EmbeddedSegment, Embedding};
use crate::error::{RagError, Result};
use async_trait::async_trait;
use log::{debug, info};
use qdrant_client::qdrant::{
    with_payload_selector, CreateCollectionBuilder, Distance, PointStruct, ScoredPoint,
    SearchPoints, UpsertPointsBuilder, VectorParams, WithPayloadSelector,
};
use qdrant_client::{Payload, Qdrant, QdrantError};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::env;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;

const DEFAULT_VECTOR_SIZE: u64 = 768; // Default dimension for most embedding models

/// A retrieved segment with its similarity to the query
#[derive(Debug, Clone, Serialize)]
pub struct ScoredSegment {
    pub segment: Segment,
    pub score: f32,
}

/// Segments retrieved for one question, by descending similarity
#[derive(Debug, Clone, Default, Serialize)]
pub struct RetrievedContext {
    pub matches: Vec<ScoredSegment>,
}

impl RetrievedContext {
    pub fn len(&self) -> usize {
        self.matches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matches.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ScoredSegment> {
        self.matches.iter()
    }

    /// Sort by descending score, ties by ascending segment index, keep `k`
    fn ranked(mut matches: Vec<ScoredSegment>, k: usize) -> Self {
        matches.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.segment.index.cmp(&b.segment.index))
        });
        matches.truncate(k);
        RetrievedContext { matches }
    }
}

/// Nearest-neighbour store holding one set of embedded segments per corpus id
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Replace everything stored under `corpus_id`
    async fn upsert_corpus(&self, corpus_id: &str, segments: Vec<EmbeddedSegment>) -> Result<()>;

    /// Return the `k` segments closest to `query` by cosine similarity
    ///
    /// `k` is clamped to the corpus size. Unknown or removed ids fail with
    /// [`RagError::IndexNotFound`].
    async fn query(&self, corpus_id: &str, query: &Embedding, k: usize) -> Result<RetrievedContext>;

    /// Drop a corpus; later queries against it fail with `IndexNotFound`
    async fn remove_corpus(&self, corpus_id: &str) -> Result<()>;

    async fn contains(&self, corpus_id: &str) -> Result<bool>;
}

/// Session-scoped exact-scan index
#[derive(Default)]
pub struct InMemoryIndex {
    corpora: RwLock<HashMap<String, Arc<Vec<EmbeddedSegment>>>>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VectorIndex for InMemoryIndex {
    async fn upsert_corpus(&self, corpus_id: &str, segments: Vec<EmbeddedSegment>) -> Result<()> {
        if let Some(first) = segments.first() {
            let dimension = first.embedding.dimension();
            if segments.iter().any(|s| s.embedding.dimension() != dimension) {
                return Err(RagError::InvalidRequest(format!(
                    "corpus {} mixes embedding dimensions",
                    corpus_id
                )));
            }
        }

        debug!("Indexing {} segments for corpus {}", segments.len(), corpus_id);
        self.corpora
            .write()
            .await
            .insert(corpus_id.to_string(), Arc::new(segments));
        Ok(())
    }

    async fn query(&self, corpus_id: &str, query: &Embedding, k: usize) -> Result<RetrievedContext> {
        // Snapshot so the scan does not hold the lock
        let segments = self
            .corpora
            .read()
            .await
            .get(corpus_id)
            .cloned()
            .ok_or_else(|| RagError::IndexNotFound(corpus_id.to_string()))?;

        if let Some(first) = segments.first() {
            if first.embedding.dimension() != query.dimension() {
                return Err(RagError::InvalidRequest(format!(
                    "query has dimension {}, corpus {} has {}",
                    query.dimension(),
                    corpus_id,
                    first.embedding.dimension()
                )));
            }
        }

        let matches = segments
            .iter()
            .map(|s| ScoredSegment {
                segment: s.segment.clone(),
                score: s.embedding.cosine_similarity(query),
            })
            .collect();

        Ok(RetrievedContext::ranked(matches, k))
    }

    async fn remove_corpus(&self, corpus_id: &str) -> Result<()> {
        self.corpora.write().await.remove(corpus_id);
        Ok(())
    }

    async fn contains(&self, corpus_id: &str) -> Result<bool> {
        Ok(self.corpora.read().await.contains_key(corpus_id))
    }
}

/// Configuration for Qdrant
pub struct QdrantConfig {
    pub url: String,
    pub api_key: Option<String>,
    /// Vector size used when a corpus has no segments to infer it from
    pub vector_size: u64,
}

impl QdrantConfig {
    /// Create a new configuration from environment variables
    pub fn from_env() -> anyhow::Result<Self> {
        let url = env::var("QDRANT_URL")?;
        let api_key = env::var("QDRANT_API_KEY").ok();
        let vector_size = match env::var("QDRANT_VECTOR_SIZE") {
            Ok(raw) => raw.trim().parse()?,
            Err(_) => DEFAULT_VECTOR_SIZE,
        };

        Ok(QdrantConfig {
            url,
            api_key,
            vector_size,
        })
    }
}

/// Vector index backed by one Qdrant collection per corpus
pub struct QdrantIndex {
    client: Qdrant,
    vector_size: u64,
}

impl QdrantIndex {
    /// Create a new Qdrant client
    pub fn new(config: QdrantConfig) -> Result<Self> {
        let config_builder = Qdrant::from_url(&config.url);
        let config_builder = if let Some(api_key) = config.api_key {
            config_builder.api_key(api_key)
        } else {
            config_builder
        };

        let client = config_builder.build().map_err(store_error)?;

        Ok(QdrantIndex {
            client,
            vector_size: config.vector_size,
        })
    }

    async fn search(
        &self,
        collection_name: &str,
        corpus_id: &str,
        query: &Embedding,
        limit: usize,
    ) -> Result<Vec<ScoredSegment>> {
        let search_request = SearchPoints {
            collection_name: collection_name.to_string(),
            vector: query.values.clone(),
            limit: limit as u64,
            with_payload: Some(WithPayloadSelector {
                selector_options: Some(with_payload_selector::SelectorOptions::Enable(true)),
            }),
            ..Default::default()
        };

        let search_response = self.client.search_points(search_request).await.map_err(|e| {
            if is_not_found(&e) {
                RagError::IndexNotFound(corpus_id.to_string())
            } else {
                store_error(e)
            }
        })?;

        search_response
            .result
            .into_iter()
            .map(scored_segment_from_point)
            .collect()
    }

    async fn collection_exists(&self, collection_name: &str) -> Result<bool> {
        match self.client.collection_info(collection_name).await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(RagError::VectorStore(format!(
                "Failed to check collection existence: {}",
                e
            ))),
        }
    }
}

#[async_trait]
impl VectorIndex for QdrantIndex {
    async fn upsert_corpus(&self, corpus_id: &str, segments: Vec<EmbeddedSegment>) -> Result<()> {
        let collection_name = get_collection_name(corpus_id);

        if self.collection_exists(&collection_name).await? {
            self.client
                .delete_collection(collection_name.clone())
                .await
                .map_err(store_error)?;
        }

        let size = segments
            .first()
            .map(|s| s.embedding.dimension() as u64)
            .unwrap_or(self.vector_size);
        let create_collection =
            CreateCollectionBuilder::new(collection_name.clone()).vectors_config(VectorParams {
                size,
                distance: Distance::Cosine.into(),
                ..Default::default()
            });
        self.client
            .create_collection(create_collection)
            .await
            .map_err(store_error)?;

        if segments.is_empty() {
            return Ok(());
        }

        let points = segments
            .into_iter()
            .map(|EmbeddedSegment { segment, embedding }| -> Result<PointStruct> {
                let payload = Payload::try_from(json!({
                    "text": segment.text,
                    "start": segment.start,
                    "end": segment.end,
                    "chunk_index": segment.index,
                    "token_count": segment.token_count,
                }))
                .map_err(store_error)?;

                Ok(PointStruct::new(segment.index as u64, embedding.values, payload))
            })
            .collect::<Result<Vec<PointStruct>>>()?;

        info!("Upserting {} points into {}", points.len(), collection_name);
        self.client
            .upsert_points(UpsertPointsBuilder::new(collection_name, points).wait(true))
            .await
            .map_err(store_error)?;

        Ok(())
    }

    async fn query(&self, corpus_id: &str, query: &Embedding, k: usize) -> Result<RetrievedContext> {
        let collection_name = get_collection_name(corpus_id);
        if k == 0 {
            // Still report a missing corpus
            if !self.collection_exists(&collection_name).await? {
                return Err(RagError::IndexNotFound(corpus_id.to_string()));
            }
            return Ok(RetrievedContext::default());
        }

        let collection_name = collection_name.as_str();
        search_with_ties(k, |limit| self.search(collection_name, corpus_id, query, limit)).await
    }

    async fn remove_corpus(&self, corpus_id: &str) -> Result<()> {
        let collection_name = get_collection_name(corpus_id);
        if self.collection_exists(&collection_name).await? {
            self.client
                .delete_collection(collection_name)
                .await
                .map_err(store_error)?;
        }
        Ok(())
    }

    async fn contains(&self, corpus_id: &str) -> Result<bool> {
        self.collection_exists(&get_collection_name(corpus_id)).await
    }
}

/// Top `k` by score with ties broken by ascending segment index
///
/// `search(limit)` returns at most `limit` points, choosing arbitrarily among
/// equal scores at the cut. While a full page ends on the `k`-th score, points
/// tied with it may be missing, so the page is doubled until it does not.
async fn search_with_ties<F, Fut>(k: usize, mut search: F) -> Result<RetrievedContext>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<Vec<ScoredSegment>>>,
{
    let mut limit = k;
    loop {
        let matches = search(limit).await?;
        match boundary_score(&matches, k, limit) {
            Some(score) => {
                debug!("Score {} is tied at rank {}, widening search past {}", score, k, limit);
                limit = limit.saturating_mul(2);
            }
            None => return Ok(RetrievedContext::ranked(matches, k)),
        }
    }
}

/// The `k`-th best score, if a full page may have cut points tied with it
fn boundary_score(matches: &[ScoredSegment], k: usize, limit: usize) -> Option<f32> {
    if k == 0 || matches.len() < limit || matches.len() < k {
        return None;
    }
    let mut scores: Vec<f32> = matches.iter().map(|m| m.score).collect();
    scores.sort_by(|a, b| b.total_cmp(a));
    let kth = scores[k - 1];
    (scores[scores.len() - 1] == kth).then_some(kth)
}

fn scored_segment_from_point(point: ScoredPoint) -> Result<ScoredSegment> {
    let payload = &point.payload;
    let malformed = |key: &str| {
        RagError::VectorStore(format!("point {:?} has no valid `{}` in its payload", point.id, key))
    };
    let read = |key: &str| {
        payload
            .get(key)
            .and_then(|v| v.as_integer())
            .and_then(|v| usize::try_from(v).ok())
            .ok_or_else(|| malformed(key))
    };

    let text = payload
        .get("text")
        .and_then(|v| v.as_str())
        .ok_or_else(|| malformed("text"))?
        .to_string();

    Ok(ScoredSegment {
        segment: Segment {
            index: read("chunk_index")?,
            start: read("start")?,
            end: read("end")?,
            token_count: read("token_count").unwrap_or(0),
            text,
        },
        score: point.score,
    })
}

fn is_not_found(error: &QdrantError) -> bool {
    matches!(error, QdrantError::ResponseError { status } if status.code() == tonic::Code::NotFound)
}

fn store_error<E: std::fmt::Display>(error: E) -> RagError {
    RagError::VectorStore(error.to_string())
}

/// Generate a collection name from a corpus id
fn get_collection_name(corpus_id: &str) -> String {
    // Replace non-alphanumeric characters with underscores and convert to lowercase
    let name = corpus_id
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect::<String>()
        .to_lowercase();

    format!("rag_{}", name)
}
