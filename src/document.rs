use crate::error::{RagError, Result};
use log::{debug, info, warn};
use mime_guess::from_path;
use pdf_extract::extract_text_from_mem;
use std::path::Path;

/// Formats the extractor knows how to decode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Pdf,
    PlainText,
}

impl DocumentFormat {
    /// Detect the format from a file path's MIME type
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mime = from_path(path.as_ref()).first_or_octet_stream();
        debug!("Detected MIME type: {}", mime);
        Self::from_mime(mime.essence_str())
    }

    pub fn from_mime(mime_type: &str) -> Result<Self> {
        match mime_type {
            mime if mime.starts_with("application/pdf") => Ok(DocumentFormat::Pdf),
            mime if mime.starts_with("text/") => Ok(DocumentFormat::PlainText),
            _ => Err(RagError::Extraction(format!(
                "Unsupported document format: {}. Only text and PDF files are supported.",
                mime_type
            ))),
        }
    }
}

/// Raw document bytes together with their declared format
#[derive(Debug, Clone)]
pub struct Document {
    pub bytes: Vec<u8>,
    pub format: DocumentFormat,
    /// Display name, usually the source file name
    pub name: String,
}

impl Document {
    pub fn new(bytes: Vec<u8>, format: DocumentFormat, name: impl Into<String>) -> Self {
        Document {
            bytes,
            format,
            name: name.into(),
        }
    }

    /// Read a document from disk, detecting its format from the path
    pub fn from_file<P: AsRef<Path>>(file_path: P) -> Result<Self> {
        let path = file_path.as_ref();
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| RagError::Extraction(format!("Invalid file name: {}", path.display())))?
            .to_string();

        let format = DocumentFormat::from_path(path)?;
        let bytes = std::fs::read(path).map_err(|e| {
            RagError::Extraction(format!("Failed to read {}: {}", path.display(), e))
        })?;

        Ok(Document::new(bytes, format, name))
    }
}

/// Decode document bytes into a single plain-text string
///
/// PDF pages are concatenated in document order with no separator beyond what
/// the decoder emits. Plain text must be valid UTF-8.
pub fn extract_text(bytes: &[u8], format: DocumentFormat) -> Result<String> {
    match format {
        DocumentFormat::Pdf => {
            info!("Extracting text from PDF ({} bytes)", bytes.len());
            let content = extract_text_from_mem(bytes)
                .map_err(|e| RagError::Extraction(format!("Failed to extract text from PDF: {}", e)))?;

            if content.trim().is_empty() {
                warn!("Extracted PDF content is empty or contains only whitespace");
            }

            Ok(content)
        }
        DocumentFormat::PlainText => {
            info!("Reading text document ({} bytes)", bytes.len());
            std::str::from_utf8(bytes)
                .map(str::to_string)
                .map_err(|e| RagError::Extraction(format!("Text document is not valid UTF-8: {}", e)))
        }
    }
}

/// Normalize whitespace in text (remove multiple consecutive spaces, newlines, etc.)
pub fn normalize_whitespace(text: &str) -> String {
    let result = text.replace('\r', "");

    let mut prev_char = ' ';
    let mut newline_count = 0;
    let mut normalized = String::with_capacity(result.len());

    for c in result.chars() {
        if c == '\n' {
            newline_count += 1;
            continue;
        }

        if newline_count > 0 {
            // At most one paragraph break
            normalized.push_str(if newline_count >= 2 { "\n\n" } else { "\n" });
            newline_count = 0;
        }

        if !(c == ' ' && prev_char == ' ') {
            normalized.push(c);
        }
        prev_char = c;
    }

    normalized.trim().to_string()
}
