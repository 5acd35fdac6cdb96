
use serde::{Deserialize, Serialize};

use crate::{BreviaryError, Result};

/// A window of source text ready for embedding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk<'a> {
    /// The window's text, borrowed from the source document
    pub text: &'a str,
    /// Position of this window within the document, contiguous from 0
    pub index: usize,
}

/// Configuration for fixed-window chunking. Sizes are measured in characters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ChunkingConfig {
    /// Characters per window
    pub chunk_size: usize,
    /// Characters shared by consecutive windows
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    #[inline]
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            overlap: 200,
        }
    }
}

/// Splits text into overlapping fixed-size windows.
///
/// Consecutive window starts are `chunk_size - overlap` characters apart. The last window
/// is truncated to the end of the text and iteration stops once a window reaches it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunker {
    chunk_size: usize,
    overlap: usize,
}

impl Chunker {
    /// Create a chunker, rejecting parameters that would never advance
    #[inline]
    pub fn new(chunk_size: usize, overlap: usize) -> Result<Self> {
        if chunk_size == 0 {
            return Err(BreviaryError::Validation(
                "chunk size must be greater than zero".to_string(),
            ));
        }
        if overlap >= chunk_size {
            return Err(BreviaryError::Validation(format!(
                "overlap ({}) must be smaller than chunk size ({})",
                overlap, chunk_size
            )));
        }

        Ok(Self {
            chunk_size,
            overlap,
        })
    }

    #[inline]
    pub fn from_config(config: &ChunkingConfig) -> Result<Self> {
        Self::new(config.chunk_size, config.overlap)
    }

    #[inline]
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    #[inline]
    pub fn overlap(&self) -> usize {
        self.overlap
    }

    /// Distance in characters between consecutive window starts
    #[inline]
    pub fn step(&self) -> usize {
        self.chunk_size - self.overlap
    }

    /// Lazily iterate the windows of `text`. Each call starts a fresh pass.
    #[inline]
    pub fn chunks<'a>(&self, text: &'a str) -> Chunks<'a> {
        Chunks {
            text,
            chunk_size: self.chunk_size,
            step: self.step(),
            next_start: Some(0),
            index: 0,
        }
    }

    /// Number of windows `chunks` yields for `text`, computed without iterating
    #[inline]
    pub fn chunk_count(&self, text: &str) -> usize {
        let len = text.chars().count();
        if len == 0 {
            0
        } else if len <= self.chunk_size {
            1
        } else {
            1 + (len - self.chunk_size).div_ceil(self.step())
        }
    }
}

/// Iterator over the windows of one text, see [`Chunker::chunks`]
#[derive(Debug, Clone)]
pub struct Chunks<'a> {
    text: &'a str,
    chunk_size: usize,
    step: usize,
    /// Byte offset of the next window, `None` once the end of text has been reached
    next_start: Option<usize>,
    index: usize,
}

impl<'a> Iterator for Chunks<'a> {
    type Item = Chunk<'a>;

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        let start = self.next_start.take()?;
        let rest = self.text.get(start..)?;
        if rest.is_empty() {
            return None;
        }

        let end = start + byte_offset(rest, self.chunk_size);
        let text = self.text.get(start..end)?;
        let index = self.index;
        self.index += 1;

        if end < self.text.len() {
            self.next_start = Some(start + byte_offset(rest, self.step));
        }

        Some(Chunk { text, index })
    }
}

impl std::iter::FusedIterator for Chunks<'_> {}

/// Byte offset of the `chars`-th character of `s`, or `s.len()` if it is shorter
fn byte_offset(s: &str, chars: usize) -> usize {
    s.char_indices().nth(chars).map_or(s.len(), |(offset, _)| offset)
}
