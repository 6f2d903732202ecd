use anyhow::{Context, Result};
use clap::Parser;
use dotenv::dotenv;
use log::{error, info};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use pdf_rag::config::RagConfig;
use pdf_rag::database::{InMemoryIndex, QdrantConfig, QdrantIndex, VectorIndex};
use pdf_rag::document::Document;
use pdf_rag::gemini::{GeminiClient, GeminiConfig};
use pdf_rag::rag::RagEngine;

/// Ask questions about a PDF or text document using Gemini embeddings and generation
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the document to process (supports text and PDF)
    #[arg(index = 1)]
    file_path: PathBuf,

    /// JSON configuration file; RAG_* environment variables override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Segment length in characters
    #[arg(long)]
    chunk_size: Option<usize>,

    /// Characters shared by consecutive segments
    #[arg(long)]
    overlap: Option<usize>,

    /// Segments retrieved per question
    #[arg(short = 'k', long)]
    top_k: Option<usize>,

    #[arg(long)]
    temperature: Option<f32>,

    #[arg(long)]
    max_tokens: Option<u32>,

    /// Store vectors in Qdrant (QDRANT_URL) instead of in memory
    #[arg(long)]
    qdrant: bool,
}

impl Args {
    fn load_config(&self) -> Result<RagConfig> {
        let mut config = match &self.config {
            Some(path) => RagConfig::from_file(path)?,
            None => RagConfig::default(),
        };
        config.apply_env()?;

        if let Some(chunk_size) = self.chunk_size {
            config.chunk_size = chunk_size;
        }
        if let Some(overlap) = self.overlap {
            config.overlap = overlap;
        }
        if let Some(top_k) = self.top_k {
            config.top_k = top_k;
        }
        if let Some(temperature) = self.temperature {
            config.temperature = temperature;
        }
        if let Some(max_tokens) = self.max_tokens {
            config.max_tokens = max_tokens;
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize environment
    dotenv().ok();
    env_logger::init();

    let args = Args::parse();
    let file_path = args.file_path.as_path();

    info!("Processing file: {}", file_path.display());

    // Validate input file exists
    if !Path::new(file_path).exists() {
        error!("File not found: {}", file_path.display());
        return Err(anyhow::anyhow!("File not found"));
    }

    let config = args.load_config().context("Invalid configuration")?;

    let gemini_config = GeminiConfig::from_env(&config.embedding_model, &config.generation_model)
        .context("Missing GEMINI_API_KEY")?;
    let gemini = Arc::new(GeminiClient::new(gemini_config));

    let index: Arc<dyn VectorIndex> = if args.qdrant {
        let qdrant_config = QdrantConfig::from_env().context("Missing QDRANT_URL")?;
        Arc::new(QdrantIndex::new(qdrant_config).context("Failed to initialize Qdrant client")?)
    } else {
        Arc::new(InMemoryIndex::new())
    };

    let rag_engine = RagEngine::new(config, gemini.clone(), gemini, index)
        .context("Failed to initialize RAG engine")?;

    let document = Document::from_file(file_path).context("Failed to read document")?;
    info!("Document type: {:?}", document.format);

    let corpus_id = rag_engine
        .ingest(document)
        .await
        .context("Failed to process file")?;
    info!("Indexed corpus {}", corpus_id);

    // Enter interactive Q&A loop
    rag_engine
        .run_query_loop(&corpus_id)
        .await
        .context("Error in query loop")?;

    Ok(())
}
