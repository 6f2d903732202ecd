use crate::error::{RagError, Result};
use serde::Serialize;

/// A contiguous slice of the source text used as a retrieval unit
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Segment {
    /// Position of this segment within its corpus
    pub index: usize,
    /// Character offset of the first character in the source text
    pub start: usize,
    /// Character offset one past the last character
    pub end: usize,
    pub text: String,
    /// Estimated token count for this segment
    pub token_count: usize,
}

impl Segment {
    pub fn char_len(&self) -> usize {
        self.end - self.start
    }
}

/// Fixed-window splitter: segment `i` starts at `i * (chunk_size - overlap)`
#[derive(Debug, Clone, Copy)]
pub struct Chunker {
    chunk_size: usize,
    overlap: usize,
}

impl Chunker {
    pub fn new(chunk_size: usize, overlap: usize) -> Result<Self> {
        if chunk_size == 0 {
            return Err(RagError::InvalidRequest(
                "chunk_size must be positive".to_string(),
            ));
        }
        if overlap >= chunk_size {
            return Err(RagError::InvalidRequest(format!(
                "overlap ({}) must be smaller than chunk_size ({})",
                overlap, chunk_size
            )));
        }
        Ok(Chunker {
            chunk_size,
            overlap,
        })
    }

    pub fn stride(&self) -> usize {
        self.chunk_size - self.overlap
    }

    /// Split text into overlapping segments covering all of it
    ///
    /// Lengths and offsets are in characters, so multi-byte text is never cut
    /// inside a code point.
    pub fn split(&self, text: &str) -> Vec<Segment> {
        // Byte offset of every char boundary, plus the end of the string
        let boundaries: Vec<usize> = text
            .char_indices()
            .map(|(i, _)| i)
            .chain(std::iter::once(text.len()))
            .collect();
        let total_chars = boundaries.len() - 1;

        let mut segments = Vec::new();
        let mut start = 0;

        while start < total_chars {
            let end = (start + self.chunk_size).min(total_chars);
            let slice = &text[boundaries[start]..boundaries[end]];

            segments.push(Segment {
                index: segments.len(),
                start,
                end,
                text: slice.to_string(),
                token_count: estimate_token_count(slice),
            });

            if end == total_chars {
                break;
            }
            start += self.stride();
        }

        segments
    }
}

/// Calculate approximate token count for a text
/// This is a very simple estimation - words plus punctuation
pub fn estimate_token_count(text: &str) -> usize {
    let words = text.split_whitespace().count();
    let punctuation = text.chars().filter(|c| c.is_ascii_punctuation()).count();
    words + punctuation
}
