use thiserror::Error;

pub type Result<T> = std::result::Result<T, BreviaryError>;

#[derive(Error, Debug)]
pub enum BreviaryError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Embedding service error: {0}")]
    Embedding(String),

    #[error("Chat model error: {0}")]
    Chat(String),

    #[error("Vector store error: {0}")]
    VectorStore(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("No response generated: the model returned neither content nor tool calls")]
    DegenerateResponse,

    #[error("Tool loop stopped after {0} iterations without a final answer")]
    IterationLimit(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl BreviaryError {
    /// Whether this error came from one of the external services (embedding model,
    /// chat model or vector store)
    #[inline]
    pub fn is_service_error(&self) -> bool {
        matches!(
            self,
            Self::Embedding(_) | Self::Chat(_) | Self::VectorStore(_)
        )
    }
}

pub mod agent;
pub mod commands;
pub mod config;
pub mod database;
pub mod embeddings;
pub mod http;
pub mod ingest;
pub mod llm;
pub mod ollama;
pub mod query;

#[cfg(test)]
mod testing;
