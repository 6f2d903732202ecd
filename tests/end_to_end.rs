use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

use pdf_rag::config::RagConfig;
use pdf_rag::database::{InMemoryIndex, RetrievedContext, VectorIndex};
use pdf_rag::document::{Document, DocumentFormat};
use pdf_rag::embeddings::{EmbeddedSegment, Embedder, Embedding};
use pdf_rag::generation::LanguageModel;
use pdf_rag::rag::{CorpusState, RagEngine};
use pdf_rag::{RagError, Result};

/// Letter-frequency embedder with a failure switch and an optional gate on batch calls
#[derive(Default)]
struct StubEmbedder {
    fail: AtomicBool,
    batch_calls: AtomicUsize,
    gate: Option<Arc<Semaphore>>,
}

fn letters(text: &str) -> Embedding {
    let mut values = vec![0.0f32; 26];
    for c in text.chars().filter(|c| c.is_ascii_alphabetic()) {
        values[(c.to_ascii_lowercase() as u8 - b'a') as usize] += 1.0;
    }
    Embedding::new(values)
}

#[async_trait]
impl Embedder for StubEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            let _permit = gate
                .acquire()
                .await
                .map_err(|e| RagError::EmbeddingService(e.to_string()))?;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(RagError::EmbeddingService("connection reset by peer".to_string()));
        }
        Ok(texts.iter().map(|t| letters(t)).collect())
    }

    async fn embed_one(&self, text: &str) -> Result<Embedding> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(RagError::EmbeddingService("connection reset by peer".to_string()));
        }
        Ok(letters(text))
    }

    fn model_id(&self) -> &str {
        "letter-frequency"
    }
}

/// Answers only from the supplied context, abstaining otherwise
struct GroundedModel;

fn section<'a>(prompt: &'a str, start: &str, end: &str) -> &'a str {
    let from = prompt.find(start).map(|i| i + start.len()).unwrap_or(0);
    let to = prompt[from..].find(end).map(|i| from + i).unwrap_or(prompt.len());
    &prompt[from..to]
}

#[async_trait]
impl LanguageModel for GroundedModel {
    async fn generate(&self, prompt: &str, _max_tokens: u32, _temperature: f32) -> Result<String> {
        let context = section(prompt, "CONTEXT:\n", "\n\nQUESTION:\n").to_lowercase();
        let question = section(prompt, "QUESTION:\n", "\n\nANSWER:").to_lowercase();

        let keywords: Vec<String> = question
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| w.len() > 3)
            .map(str::to_string)
            .collect();

        let sentence = context
            .split('.')
            .map(str::trim)
            .find(|s| keywords.iter().any(|k| s.contains(k.as_str())));

        Ok(match sentence {
            Some(s) => format!("{}.", s),
            None => "I don't know.".to_string(),
        })
    }

    fn model_id(&self) -> &str {
        "grounded-stub"
    }
}

/// In-memory index whose writes and reads can be held at a gate
///
/// A gate's permits are consumed, so a gate created with `n` permits lets
/// the first `n` calls through and holds the rest.
#[derive(Default)]
struct GatedIndex {
    inner: InMemoryIndex,
    upsert_gate: Option<Arc<Semaphore>>,
    query_gate: Option<Arc<Semaphore>>,
    upserted: Mutex<Vec<String>>,
    queries_started: AtomicUsize,
}

async fn pass(gate: &Option<Arc<Semaphore>>) -> Result<()> {
    if let Some(gate) = gate {
        gate.acquire()
            .await
            .map_err(|e| RagError::VectorStore(e.to_string()))?
            .forget();
    }
    Ok(())
}

#[async_trait]
impl VectorIndex for GatedIndex {
    async fn upsert_corpus(&self, corpus_id: &str, segments: Vec<EmbeddedSegment>) -> Result<()> {
        self.inner.upsert_corpus(corpus_id, segments).await?;
        self.upserted.lock().unwrap().push(corpus_id.to_string());
        pass(&self.upsert_gate).await
    }

    async fn query(&self, corpus_id: &str, query: &Embedding, k: usize) -> Result<RetrievedContext> {
        self.queries_started.fetch_add(1, Ordering::SeqCst);
        pass(&self.query_gate).await?;
        self.inner.query(corpus_id, query, k).await
    }

    async fn remove_corpus(&self, corpus_id: &str) -> Result<()> {
        self.inner.remove_corpus(corpus_id).await
    }

    async fn contains(&self, corpus_id: &str) -> Result<bool> {
        self.inner.contains(corpus_id).await
    }
}

fn test_config() -> RagConfig {
    RagConfig {
        retry_backoff_ms: 1,
        ..Default::default()
    }
}

fn engine_with(config: RagConfig, embedder: Arc<StubEmbedder>) -> Arc<RagEngine> {
    Arc::new(
        RagEngine::new(
            config,
            embedder,
            Arc::new(GroundedModel),
            Arc::new(InMemoryIndex::new()),
        )
        .unwrap(),
    )
}

fn engine_with_index(index: Arc<GatedIndex>) -> Arc<RagEngine> {
    Arc::new(
        RagEngine::new(
            test_config(),
            Arc::new(StubEmbedder::default()),
            Arc::new(GroundedModel),
            index,
        )
        .unwrap(),
    )
}

fn text_document(text: &str) -> Document {
    Document::new(text.as_bytes().to_vec(), DocumentFormat::PlainText, "lecture.txt")
}

const NOTES: &str = "Rust was started at Mozilla Research. The borrow checker enforces ownership rules at compile time. Cargo is the package manager.";

async fn wait_for_ingesting(engine: &RagEngine) {
    for _ in 0..1000 {
        if matches!(engine.state(), CorpusState::Ingesting { .. }) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("ingest never started");
}

#[tokio::test]
async fn test_2500_char_document_yields_three_segments() {
    let engine = engine_with(test_config(), Arc::new(StubEmbedder::default()));
    let text: String = "abcdefghij".repeat(250);
    assert_eq!(text.chars().count(), 2500);

    engine.ingest(text_document(&text)).await.unwrap();

    let corpus = engine.active_corpus().unwrap();
    let lengths: Vec<usize> = corpus.segments.iter().map(|s| s.char_len()).collect();
    assert_eq!(lengths, vec![1000, 1000, 700]);
    assert_eq!(corpus.segments[1].start, 900);
    assert_eq!(corpus.segments[2].start, 1800);
}

#[tokio::test]
async fn test_ask_before_ingest() {
    let engine = engine_with(test_config(), Arc::new(StubEmbedder::default()));
    assert!(matches!(
        engine.ask("anything", "What is Rust?").await,
        Err(RagError::NoCorpus)
    ));
    assert!(matches!(
        engine.ask_active("What is Rust?").await,
        Err(RagError::NoCorpus)
    ));
}

#[tokio::test]
async fn test_embedding_failure_keeps_previous_corpus() {
    let embedder = Arc::new(StubEmbedder::default());
    let engine = engine_with(test_config(), embedder.clone());

    let corpus_id = engine.ingest(text_document(NOTES)).await.unwrap();
    let before = engine.ask(&corpus_id, "Where was Rust started?").await.unwrap();

    embedder.fail.store(true, Ordering::SeqCst);
    let calls_before = embedder.batch_calls.load(Ordering::SeqCst);
    let result = engine.ingest(text_document("a different document")).await;
    assert!(matches!(result, Err(RagError::EmbeddingService(_))));
    // First attempt plus two retries
    assert_eq!(embedder.batch_calls.load(Ordering::SeqCst) - calls_before, 3);

    embedder.fail.store(false, Ordering::SeqCst);
    assert_eq!(
        engine.state(),
        CorpusState::Ready {
            corpus_id: corpus_id.clone()
        }
    );
    let after = engine.ask(&corpus_id, "Where was Rust started?").await.unwrap();
    assert_eq!(before.answer, after.answer);
    assert_eq!(before.sources.len(), after.sources.len());
}

#[tokio::test]
async fn test_unanswerable_question_abstains() {
    let engine = engine_with(test_config(), Arc::new(StubEmbedder::default()));
    let corpus_id = engine.ingest(text_document(NOTES)).await.unwrap();

    let answer = engine
        .ask(&corpus_id, "Which team won the 1998 football world cup?")
        .await
        .unwrap();
    assert!(answer.answer.contains("don't know"), "got {}", answer.answer);

    let answer = engine.ask(&corpus_id, "Where was Rust started?").await.unwrap();
    assert_eq!(answer.answer, "rust was started at mozilla research.");
    assert_eq!(answer.sources.len(), 1);
}

#[tokio::test]
async fn test_retrieval_is_deterministic_and_clamped() {
    let config = RagConfig {
        chunk_size: 40,
        overlap: 8,
        top_k: 5,
        ..test_config()
    };
    let engine = engine_with(config, Arc::new(StubEmbedder::default()));
    let corpus_id = engine.ingest(text_document(NOTES)).await.unwrap();
    let segment_count = engine.active_corpus().unwrap().segments.len();
    assert_eq!(segment_count, 4);

    let first = engine.ask(&corpus_id, "package manager").await.unwrap();
    let second = engine.ask(&corpus_id, "package manager").await.unwrap();
    let ranking = |a: &pdf_rag::context::Answer| -> Vec<(usize, f32)> {
        a.sources.iter().map(|m| (m.segment.index, m.score)).collect()
    };
    assert_eq!(ranking(&first), ranking(&second));
    // Fewer segments than top_k
    assert_eq!(first.sources.len(), segment_count);
    assert!(first
        .sources
        .matches
        .windows(2)
        .all(|w| w[0].score >= w[1].score));

    let small = engine_with(
        RagConfig {
            top_k: 5,
            ..test_config()
        },
        Arc::new(StubEmbedder::default()),
    );
    let id = small.ingest(text_document("only one short segment")).await.unwrap();
    let answer = small.ask(&id, "short segment").await.unwrap();
    assert_eq!(answer.sources.len(), 1);
}

#[tokio::test]
async fn test_ask_during_first_ingest_is_not_ready() {
    let gate = Arc::new(Semaphore::new(0));
    let embedder = Arc::new(StubEmbedder {
        gate: Some(gate.clone()),
        ..Default::default()
    });
    let engine = engine_with(test_config(), embedder);

    let ingest = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.ingest(text_document(NOTES)).await })
    };
    wait_for_ingesting(&engine).await;

    assert!(matches!(
        engine.ask_active("Where was Rust started?").await,
        Err(RagError::NotReady)
    ));
    assert_eq!(engine.state(), CorpusState::Ingesting { serving: None });

    gate.add_permits(1);
    let corpus_id = ingest.await.unwrap().unwrap();
    assert!(engine.ask(&corpus_id, "Where was Rust started?").await.is_ok());
}

#[tokio::test]
async fn test_reingest_swaps_atomically() {
    let gate = Arc::new(Semaphore::new(1));
    let embedder = Arc::new(StubEmbedder {
        gate: Some(gate.clone()),
        ..Default::default()
    });
    let engine = engine_with(test_config(), embedder);

    let old_id = engine.ingest(text_document(NOTES)).await.unwrap();

    // Take the permit back so the next ingest blocks mid-embedding
    let held = gate.clone().acquire_owned().await.unwrap();
    let ingest = {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine
                .ingest(text_document("Ferris is the crab mascot of the community."))
                .await
        })
    };
    wait_for_ingesting(&engine).await;

    // The old corpus keeps serving, whole and unchanged
    let answer = engine.ask(&old_id, "Where was Rust started?").await.unwrap();
    assert_eq!(answer.answer, "rust was started at mozilla research.");
    assert_eq!(engine.active_corpus().unwrap().id, old_id);
    assert_eq!(
        engine.state(),
        CorpusState::Ingesting {
            serving: Some(old_id.clone())
        }
    );

    drop(held);
    let new_id = ingest.await.unwrap().unwrap();
    assert_ne!(new_id, old_id);
    assert_eq!(
        engine.state(),
        CorpusState::Ready {
            corpus_id: new_id.clone()
        }
    );

    assert!(matches!(
        engine.ask(&old_id, "Where was Rust started?").await,
        Err(RagError::IndexNotFound(_))
    ));
    let answer = engine.ask(&new_id, "Who is Ferris?").await.unwrap();
    assert_eq!(answer.answer, "ferris is the crab mascot of the community.");
}

#[tokio::test]
async fn test_concurrent_questions() {
    let engine = engine_with(test_config(), Arc::new(StubEmbedder::default()));
    let corpus_id = engine.ingest(text_document(NOTES)).await.unwrap();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let engine = engine.clone();
            let corpus_id = corpus_id.clone();
            tokio::spawn(async move { engine.ask(&corpus_id, "What does Cargo manage?").await })
        })
        .collect();

    for handle in handles {
        let answer = handle.await.unwrap().unwrap();
        assert_eq!(answer.answer, "cargo is the package manager.");
    }
}

#[tokio::test]
async fn test_extraction_failure_creates_nothing() {
    let engine = engine_with(test_config(), Arc::new(StubEmbedder::default()));
    let bad = Document::new(b"%PDF-garbage".to_vec(), DocumentFormat::Pdf, "broken.pdf");
    assert!(matches!(
        engine.ingest(bad).await,
        Err(RagError::Extraction(_))
    ));
    assert_eq!(engine.state(), CorpusState::Empty);
}

#[tokio::test]
async fn test_query_embedding_failure_surfaces() {
    let embedder = Arc::new(StubEmbedder::default());
    let engine = engine_with(test_config(), embedder.clone());
    let corpus_id = engine.ingest(text_document(NOTES)).await.unwrap();

    embedder.fail.store(true, Ordering::SeqCst);
    assert!(matches!(
        engine.ask(&corpus_id, "Where was Rust started?").await,
        Err(RagError::EmbeddingService(_))
    ));
}

#[tokio::test]
async fn test_cancelled_ingest_restores_state_and_index() {
    let index = Arc::new(GatedIndex {
        upsert_gate: Some(Arc::new(Semaphore::new(1))),
        ..Default::default()
    });
    let engine = engine_with_index(index.clone());
    let first = engine.ingest(text_document(NOTES)).await.unwrap();

    // The second ingest writes its corpus, then stalls before publishing
    let ingest = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.ingest(text_document("Ferris is a crab.")).await })
    };
    let mut abandoned = None;
    for _ in 0..1000 {
        abandoned = index.upserted.lock().unwrap().get(1).cloned();
        if abandoned.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    let abandoned = abandoned.expect("second upsert never happened");
    assert!(index.contains(&abandoned).await.unwrap());

    ingest.abort();
    assert!(ingest.await.unwrap_err().is_cancelled());

    assert_eq!(
        engine.state(),
        CorpusState::Ready {
            corpus_id: first.clone()
        }
    );
    assert!(engine.ask(&first, "Where was Rust started?").await.is_ok());

    // Removal of the abandoned corpus runs in the background
    let mut removed = false;
    for _ in 0..1000 {
        if !index.contains(&abandoned).await.unwrap() {
            removed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    assert!(removed, "abandoned corpus {} is still indexed", abandoned);
    assert!(index.contains(&first).await.unwrap());
}

#[tokio::test]
async fn test_in_flight_ask_sees_superseded_corpus_gone() {
    let query_gate = Arc::new(Semaphore::new(0));
    let index = Arc::new(GatedIndex {
        query_gate: Some(query_gate.clone()),
        ..Default::default()
    });
    let engine = engine_with_index(index.clone());
    let old_id = engine.ingest(text_document(NOTES)).await.unwrap();

    // Passes the corpus check now, reaches the index after the swap
    let ask = {
        let engine = engine.clone();
        let old_id = old_id.clone();
        tokio::spawn(async move { engine.ask(&old_id, "Where was Rust started?").await })
    };
    for _ in 0..1000 {
        if index.queries_started.load(Ordering::SeqCst) == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    assert_eq!(index.queries_started.load(Ordering::SeqCst), 1);

    let new_id = engine
        .ingest(text_document("Ferris is the crab mascot of the community."))
        .await
        .unwrap();
    assert!(!index.contains(&old_id).await.unwrap());

    query_gate.add_permits(1);
    assert!(matches!(
        ask.await.unwrap(),
        Err(RagError::IndexNotFound(id)) if id == old_id
    ));

    query_gate.add_permits(1);
    let answer = engine.ask(&new_id, "Who is Ferris?").await.unwrap();
    assert_eq!(answer.answer, "ferris is the crab mascot of the community.");
}
