// Vector database module
// Record schema, the store seam and its Pinecone and LanceDB backends


pub mod lancedb;
pub mod pinecone;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::config::{Config, VectorBackend};
use crate::{BreviaryError, Result};

pub use self::lancedb::LanceStore;
pub use self::pinecone::PineconeStore;

/// Largest number of records or ids sent to the store in one request
pub const MAX_BATCH_SIZE: usize = 1000;

/// Result cap used when enumerating every record of one source. Far above any realistic
/// chunk count for a single document.
pub const SOURCE_SCAN_LIMIT: usize = 10_000;

/// Metadata stored alongside every chunk vector
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordMetadata {
    /// The chunk's text
    pub text: String,
    /// Canonical absolute path of the source document
    pub source: String,
    #[serde(deserialize_with = "deserialize_count")]
    pub chunk_index: u32,
    #[serde(deserialize_with = "deserialize_count")]
    pub total_chunks: u32,
}

/// A chunk vector keyed by its deterministic id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorRecord {
    pub id: String,
    pub values: Vec<f32>,
    pub metadata: RecordMetadata,
}

impl VectorRecord {
    /// Deterministic record id for a chunk of `source`. Re-ingesting the same path
    /// recomputes the same ids.
    #[inline]
    pub fn record_id(source: &str, chunk_index: usize) -> String {
        format!("{}_chunk_{}", source_id_prefix(source), chunk_index)
    }
}

/// `source` with every character outside `[A-Za-z0-9]` replaced by `_`
#[inline]
pub fn source_id_prefix(source: &str) -> String {
    source
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// One hit of a store query
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredMatch {
    pub id: String,
    /// Similarity, higher is closer
    pub score: f32,
    pub metadata: Option<RecordMetadata>,
}

/// Remote or local index of chunk vectors.
///
/// All operations are keyed by deterministic record ids; `upsert` overwrites records with
/// the same id and `delete_many` ignores ids that do not exist.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Dimension every stored vector must have
    fn dimension(&self) -> usize;

    async fn upsert(&self, records: &[VectorRecord]) -> Result<()>;

    /// Enumerate up to `limit` records whose metadata `source` equals `source` exactly.
    /// Only the ids are guaranteed; backends may leave `metadata` empty.
    async fn query_by_source(&self, source: &str, limit: usize) -> Result<Vec<ScoredMatch>>;

    async fn delete_many(&self, ids: &[String]) -> Result<()>;

    /// Nearest neighbours of `vector`, best first, at most `top_k`
    async fn query_similar(
        &self,
        vector: &[f32],
        top_k: usize,
        include_metadata: bool,
    ) -> Result<Vec<ScoredMatch>>;
}

/// Construct the configured backend
#[inline]
pub async fn connect(config: &Config) -> Result<Arc<dyn VectorStore>> {
    let dimension = config.ollama.embedding_dimension as usize;

    match config.vector_store.backend {
        VectorBackend::Pinecone => {
            let store = PineconeStore::connect(&config.vector_store, dimension).await?;
            info!("Connected to Pinecone index at {}", store.host());
            Ok(Arc::new(store))
        }
        VectorBackend::Lancedb => {
            let table_name = config.vector_store.index_name()?;
            let store =
                LanceStore::connect(&config.vector_database_path(), table_name, dimension).await?;
            Ok(Arc::new(store))
        }
    }
}

/// Reject vectors that would break the single-dimension invariant of the index
#[inline]
pub fn check_dimension(expected: usize, actual: usize, id: &str) -> Result<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(BreviaryError::Validation(format!(
            "vector '{}' has dimension {}, index expects {}",
            id, actual, expected
        )))
    }
}

/// Pinecone hands metadata numbers back as floats
fn deserialize_count<'de, D>(deserializer: D) -> std::result::Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    let value = f64::deserialize(deserializer)?;
    if value.fract() == 0.0 && (0.0..=f64::from(u32::MAX)).contains(&value) {
        Ok(value as u32)
    } else {
        Err(serde::de::Error::custom(format!(
            "expected a non-negative integer, got {}",
            value
        )))
    }
}
