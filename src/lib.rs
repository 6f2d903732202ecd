pub mod chunking;
pub mod config;
pub mod context;
pub mod database;
pub mod document;
pub mod embeddings;
pub mod error;
pub mod gemini;
pub mod generation;
pub mod rag;
pub mod retrieval;
pub mod retry;

pub use error::{RagError, Result};
