// Embeddings module
// Fixed-window chunking and the embedding model seam

pub mod chunking;

use async_trait::async_trait;

use crate::Result;

pub use chunking::{Chunk, Chunker, ChunkingConfig, Chunks};

/// Converts text into a fixed-length vector through an external embedding model.
///
/// Every call is a fresh remote request; implementations do not cache. Failures surface as
/// [`crate::BreviaryError::Embedding`].
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}
