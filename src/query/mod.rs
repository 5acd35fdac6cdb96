// Retrieval query module
// Embeds a question, gathers the closest chunks and streams an answer grounded in them


use std::sync::Arc;
use tracing::{debug, info};

use crate::database::{RecordMetadata, ScoredMatch, VectorStore};
use crate::embeddings::Embedder;
use crate::llm::{ChatModel, GenerateRequest, TokenStream};
use crate::{BreviaryError, Result};

/// Number of chunks retrieved when the caller does not ask for another amount
pub const DEFAULT_TOP_K: usize = 5;

const CONTEXT_SEPARATOR: &str = "\n\n---\n\n";

/// Result of a retrieval query
pub enum QueryOutcome {
    /// The store returned no chunks; nothing was sent to the chat model
    NoMatches,
    /// Chunks were found and the model is streaming its answer
    Answer {
        /// Retrieved chunks, most similar first
        matches: Vec<ScoredMatch>,
        stream: TokenStream,
    },
}

pub struct RetrievalEngine {
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn VectorStore>,
    chat: Arc<dyn ChatModel>,
    model: String,
}

impl RetrievalEngine {
    #[inline]
    pub fn new(
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn VectorStore>,
        chat: Arc<dyn ChatModel>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            embedder,
            store,
            chat,
            model: model.into(),
        }
    }

    #[inline]
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Answer `question` from the `top_k` most similar stored chunks
    #[inline]
    pub async fn query(&self, question: &str, top_k: usize) -> Result<QueryOutcome> {
        let question = question.trim();
        if question.is_empty() {
            return Err(BreviaryError::Validation(
                "query text must not be empty".to_string(),
            ));
        }
        if top_k == 0 {
            return Err(BreviaryError::Validation(
                "top-k must be at least 1".to_string(),
            ));
        }

        let vector = self.embedder.embed(question).await?;
        let mut matches: Vec<ScoredMatch> = self
            .store
            .query_similar(&vector, top_k, true)
            .await?
            .into_iter()
            .filter(|m| m.metadata.is_some())
            .collect();

        if matches.is_empty() {
            info!("No relevant documents for query");
            return Ok(QueryOutcome::NoMatches);
        }

        matches.sort_by(|a, b| b.score.total_cmp(&a.score));
        info!("Found {} relevant document(s)", matches.len());

        let context = build_context(&matches);
        debug!("Context is {} characters", context.len());

        let stream = self
            .chat
            .generate_stream(&GenerateRequest {
                model: self.model.clone(),
                prompt: grounding_prompt(&context, question),
            })
            .await?;

        Ok(QueryOutcome::Answer { matches, stream })
    }
}

/// Concatenate chunk texts in the given order, each under a numbered source header
#[inline]
pub fn build_context(matches: &[ScoredMatch]) -> String {
    matches
        .iter()
        .filter_map(|m| m.metadata.as_ref())
        .enumerate()
        .map(|(i, metadata)| source_block(i + 1, metadata))
        .collect::<Vec<_>>()
        .join(CONTEXT_SEPARATOR)
}

fn source_block(number: usize, metadata: &RecordMetadata) -> String {
    format!("[Source {}: {}]\n{}", number, metadata.source, metadata.text)
}

#[inline]
pub fn grounding_prompt(context: &str, question: &str) -> String {
    format!(
        "You are a helpful assistant that answers questions based on the provided context. \
         Use only the information from the context to answer the question. \
         If the context doesn't contain enough information to answer the question, say so.\n\n\
         Context:\n{}\n\nQuestion: {}\n\nAnswer:",
        context, question
    )
}
