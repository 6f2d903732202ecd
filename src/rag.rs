use crate::chunking::{Chunker, Segment};
use crate::config::RagConfig;
use crate::context::{Answer, AnswerComposer, ComposerSettings};
use crate::database::VectorIndex;
use crate::document::{extract_text, normalize_whitespace, Document};
use crate::embeddings::{validate_batch, EmbeddedSegment, Embedder, Embedding};
use crate::error::{RagError, Result};
use crate::generation::LanguageModel;
use crate::retrieval::Retriever;
use crate::retry::{bounded, RetryPolicy};
use log::{debug, error, info, warn};
use std::io::{self, Write};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::Mutex;
use uuid::Uuid;

/// One ingested document's derived state
#[derive(Debug, Clone)]
pub struct Corpus {
    pub id: String,
    /// Display name of the source document
    pub source: String,
    pub segments: Vec<Segment>,
    pub embedding_model: String,
}

/// Observable lifecycle of the engine's corpus slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorpusState {
    Empty,
    /// An ingest is running; `serving` is the corpus still answering questions
    Ingesting { serving: Option<String> },
    Ready { corpus_id: String },
}

enum Slot {
    Empty,
    Ingesting { previous: Option<Arc<Corpus>> },
    Ready(Arc<Corpus>),
}

impl Slot {
    fn serving(&self) -> Option<&Arc<Corpus>> {
        match self {
            Slot::Empty => None,
            Slot::Ingesting { previous } => previous.as_ref(),
            Slot::Ready(corpus) => Some(corpus),
        }
    }
}

/// RAG (Retrieval-Augmented Generation) engine
///
/// One engine holds the state of one session: at most one active corpus,
/// replaced wholesale by each ingest. Front-ends keep an engine per session
/// instead of sharing globals.
pub struct RagEngine {
    config: RagConfig,
    chunker: Chunker,
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    retriever: Retriever,
    composer: AnswerComposer,
    slot: RwLock<Slot>,
    // Serializes ingests; queries never take it
    ingest_lock: Mutex<()>,
}

impl RagEngine {
    /// Create a new RAG engine
    pub fn new(
        config: RagConfig,
        embedder: Arc<dyn Embedder>,
        llm: Arc<dyn LanguageModel>,
        index: Arc<dyn VectorIndex>,
    ) -> Result<Self> {
        let chunker = Chunker::new(config.chunk_size, config.overlap)?;
        if config.embed_batch_size == 0 {
            return Err(RagError::InvalidRequest(
                "embed_batch_size must be positive".to_string(),
            ));
        }

        let retriever = Retriever::new(
            embedder.clone(),
            index.clone(),
            config.embed_timeout(),
            embed_retry_policy(&config),
        );
        let composer = AnswerComposer::new(
            llm,
            ComposerSettings {
                max_prompt_chars: config.max_prompt_chars,
                max_tokens: config.max_tokens,
                temperature: config.temperature,
                timeout: config.generate_timeout(),
                retry: RetryPolicy::new(config.generation_retries, config.retry_backoff()),
            },
        );

        Ok(RagEngine {
            config,
            chunker,
            embedder,
            index,
            retriever,
            composer,
            slot: RwLock::new(Slot::Empty),
            ingest_lock: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &RagConfig {
        &self.config
    }

    pub fn state(&self) -> CorpusState {
        match &*self.read_slot() {
            Slot::Empty => CorpusState::Empty,
            Slot::Ingesting { previous } => CorpusState::Ingesting {
                serving: previous.as_ref().map(|c| c.id.clone()),
            },
            Slot::Ready(corpus) => CorpusState::Ready {
                corpus_id: corpus.id.clone(),
            },
        }
    }

    /// The corpus currently answering questions, if any
    pub fn active_corpus(&self) -> Option<Arc<Corpus>> {
        self.read_slot().serving().cloned()
    }

    /// Extract, chunk, embed and index a document, then make it the active corpus
    ///
    /// The new corpus becomes visible in one swap after it is fully indexed.
    /// On failure the previous corpus, if any, keeps serving unchanged.
    pub async fn ingest(&self, document: Document) -> Result<String> {
        let _ingest = self.ingest_lock.lock().await;
        let mut pending = self.begin_ingest();

        let corpus = Arc::new(self.build_corpus(document, &mut pending).await?);
        let corpus_id = corpus.id.clone();

        pending.indexed = None;
        if let Some(old) = self.publish(corpus) {
            info!("Corpus {} superseded by {}", old.id, corpus_id);
            if let Err(e) = self.index.remove_corpus(&old.id).await {
                warn!("Failed to drop superseded corpus {}: {}", old.id, e);
            }
        }

        Ok(corpus_id)
    }

    /// Answer a question against `corpus_id`
    pub async fn ask(&self, corpus_id: &str, question: &str) -> Result<Answer> {
        let corpus = self.serving_corpus()?;
        if corpus.id != corpus_id {
            return Err(RagError::IndexNotFound(corpus_id.to_string()));
        }
        self.answer(&corpus, question).await
    }

    /// Answer a question against whichever corpus is active
    pub async fn ask_active(&self, question: &str) -> Result<Answer> {
        let corpus = self.serving_corpus()?;
        self.answer(&corpus, question).await
    }

    async fn answer(&self, corpus: &Corpus, question: &str) -> Result<Answer> {
        let question = question.trim();
        if question.is_empty() {
            return Err(RagError::InvalidRequest("No question provided".to_string()));
        }

        let context = self
            .retriever
            .retrieve(&corpus.id, question, self.config.top_k)
            .await?;
        self.composer.compose(question, context).await
    }

    fn serving_corpus(&self) -> Result<Arc<Corpus>> {
        match &*self.read_slot() {
            Slot::Empty => Err(RagError::NoCorpus),
            Slot::Ingesting { previous: None } => Err(RagError::NotReady),
            Slot::Ingesting {
                previous: Some(corpus),
            }
            | Slot::Ready(corpus) => Ok(corpus.clone()),
        }
    }

    async fn build_corpus(&self, document: Document, pending: &mut PendingIngest<'_>) -> Result<Corpus> {
        let Document {
            bytes,
            format,
            name,
        } = document;
        info!("Ingesting {} ({:?}, {} bytes)", name, format, bytes.len());

        // Decoding is CPU-bound; a panicking decoder surfaces as a join error
        let text = tokio::task::spawn_blocking(move || extract_text(&bytes, format))
            .await
            .map_err(|e| RagError::Extraction(format!("document decoder crashed: {}", e)))??;
        let text = if self.config.normalize_whitespace {
            normalize_whitespace(&text)
        } else {
            text
        };

        let segments = self.chunker.split(&text);
        info!("Split into {} chunks", segments.len());

        let embeddings = self.embed_segments(&segments).await?;
        let embedded = segments
            .iter()
            .cloned()
            .zip(embeddings)
            .map(|(segment, embedding)| EmbeddedSegment { segment, embedding })
            .collect();

        let corpus_id = Uuid::new_v4().to_string();
        pending.indexed = Some(corpus_id.clone());
        if let Err(e) = self.index.upsert_corpus(&corpus_id, embedded).await {
            // Never leave a partial corpus behind
            if let Err(cleanup) = self.index.remove_corpus(&corpus_id).await {
                warn!("Failed to clean up corpus {}: {}", corpus_id, cleanup);
            }
            pending.indexed = None;
            return Err(e);
        }

        Ok(Corpus {
            id: corpus_id,
            source: name,
            segments,
            embedding_model: self.embedder.model_id().to_string(),
        })
    }

    async fn embed_segments(&self, segments: &[Segment]) -> Result<Vec<Embedding>> {
        let retry = embed_retry_policy(&self.config);
        let timeout = self.config.embed_timeout();
        let mut embeddings = Vec::with_capacity(segments.len());

        for batch in segments.chunks(self.config.embed_batch_size) {
            let texts: Vec<String> = batch.iter().map(|s| s.text.clone()).collect();
            let vectors = retry
                .run("segment embedding", || {
                    bounded(
                        timeout,
                        RagError::EmbeddingService,
                        self.embedder.embed_batch(&texts),
                    )
                })
                .await?;
            validate_batch(texts.len(), &vectors)?;
            debug!("Embedded {}/{} chunks", embeddings.len() + vectors.len(), segments.len());
            embeddings.extend(vectors);
        }

        validate_batch(segments.len(), &embeddings)?;
        Ok(embeddings)
    }

    fn begin_ingest(&self) -> PendingIngest<'_> {
        let mut slot = self.write_slot();
        let previous = slot.serving().cloned();
        *slot = Slot::Ingesting { previous };
        PendingIngest {
            slot: &self.slot,
            index: self.index.clone(),
            indexed: None,
        }
    }

    /// Swap in a fully indexed corpus, returning the one it replaces
    fn publish(&self, corpus: Arc<Corpus>) -> Option<Arc<Corpus>> {
        let mut slot = self.write_slot();
        let previous = slot.serving().cloned();
        *slot = Slot::Ready(corpus);
        previous
    }

    fn read_slot(&self) -> RwLockReadGuard<'_, Slot> {
        self.slot.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_slot(&self) -> RwLockWriteGuard<'_, Slot> {
        self.slot.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run the query loop for the active corpus
    pub async fn run_query_loop(&self, corpus_id: &str) -> anyhow::Result<()> {
        let source = self
            .active_corpus()
            .map(|c| c.source.clone())
            .unwrap_or_else(|| corpus_id.to_string());
        println!(
            "Ready to answer questions about {}. Type 'exit' to quit.",
            source
        );

        let stdin = io::stdin();
        let mut stdout = io::stdout();
        let mut buffer = String::new();

        loop {
            print!("\nYour question: ");
            stdout.flush()?;

            buffer.clear();
            let read = stdin.read_line(&mut buffer)?;

            let question = buffer.trim();

            if read == 0 || question.eq_ignore_ascii_case("exit") {
                println!("Goodbye!");
                break;
            }
            if question.is_empty() {
                continue;
            }

            match self.ask(corpus_id, question).await {
                Ok(answer) => {
                    println!("\n{}", answer.answer);
                    for cited in answer.sources.iter() {
                        println!(
                            "  [chunk {} | chars {}..{} | score {:.3}]",
                            cited.segment.index,
                            cited.segment.start,
                            cited.segment.end,
                            cited.score
                        );
                    }
                }
                // The corpus is gone; asking again cannot help
                Err(e @ RagError::IndexNotFound(_)) => return Err(e.into()),
                Err(e) => error!("{}", e),
            }
        }

        Ok(())
    }
}

/// Restores the slot if an ingest ends without publishing
///
/// Covers both errors and a dropped (cancelled) ingest future. A corpus
/// already written under `indexed` is removed in the background, since a
/// cancelled future cannot await its own cleanup.
struct PendingIngest<'a> {
    slot: &'a RwLock<Slot>,
    index: Arc<dyn VectorIndex>,
    indexed: Option<String>,
}

impl Drop for PendingIngest<'_> {
    fn drop(&mut self) {
        if let Some(corpus_id) = self.indexed.take() {
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    warn!("Ingest of corpus {} abandoned, removing it", corpus_id);
                    let index = self.index.clone();
                    runtime.spawn(async move {
                        if let Err(e) = index.remove_corpus(&corpus_id).await {
                            warn!("Failed to clean up corpus {}: {}", corpus_id, e);
                        }
                    });
                }
                Err(_) => warn!("Ingest of corpus {} abandoned outside a runtime", corpus_id),
            }
        }

        let mut slot = self
            .slot
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let previous = match &mut *slot {
            Slot::Ingesting { previous } => previous.take(),
            _ => return,
        };
        *slot = match previous {
            Some(corpus) => Slot::Ready(corpus),
            None => Slot::Empty,
        };
    }
}

fn embed_retry_policy(config: &RagConfig) -> RetryPolicy {
    RetryPolicy::new(config.embed_retries, config.retry_backoff())
}
