
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use url::Url;

use crate::BreviaryError;
use crate::embeddings::chunking::ChunkingConfig;

pub const DEFAULT_EMBEDDING_DIMENSION: u32 = 768;
pub const CONFIG_DIR_ENV: &str = "BREVIARY_CONFIG_DIR";

const PINECONE_API_KEY_ENV: &str = "PINECONE_API_KEY";
const PINECONE_INDEX_NAME_ENV: &str = "PINECONE_INDEX_NAME";
const PINECONE_ENVIRONMENT_ENV: &str = "PINECONE_ENVIRONMENT";
const PINECONE_HOST_ENV: &str = "PINECONE_HOST";
const OLLAMA_HOST_ENV: &str = "OLLAMA_HOST";

/// Keys shorter than this are masked completely
const MIN_PARTIALLY_MASKED_KEY_LEN: usize = 12;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub ollama: OllamaConfig,
    #[serde(default)]
    pub vector_store: VectorStoreConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(skip)]
    pub base_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OllamaConfig {
    pub protocol: String,
    pub host: String,
    pub port: u16,
    /// Model used for document and query embeddings
    pub embedding_model: String,
    /// Model used to stream grounded answers for `query`
    pub chat_model: String,
    /// Tool-calling model used by `pray`
    pub agent_model: String,
    pub embedding_dimension: u32,
    pub timeout_seconds: u64,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            protocol: "http".to_string(),
            host: "localhost".to_string(),
            port: 11434,
            embedding_model: "nomic-embed-text".to_string(),
            chat_model: "llama3.2:3b".to_string(),
            agent_model: "qwen2.5:7b".to_string(),
            embedding_dimension: DEFAULT_EMBEDDING_DIMENSION,
            timeout_seconds: 120,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VectorBackend {
    #[default]
    Pinecone,
    Lancedb,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VectorStoreConfig {
    pub backend: VectorBackend,
    pub api_key: Option<String>,
    pub index_name: Option<String>,
    pub environment: Option<String>,
    /// Data-plane host of the index. Resolved through the control plane when unset.
    pub host: Option<String>,
    pub control_plane_url: String,
    /// Directory of the local LanceDB database, defaults to `<config dir>/vectors`
    pub path: Option<PathBuf>,
}

impl Default for VectorStoreConfig {
    fn default() -> Self {
        Self {
            backend: VectorBackend::Pinecone,
            api_key: None,
            index_name: None,
            environment: None,
            host: None,
            control_plane_url: "https://api.pinecone.io".to_string(),
            path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetrievalConfig {
    pub top_k: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self { top_k: 5 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Directory holding the reference documents the tool loop may fetch
    pub docs_dir: PathBuf,
    pub max_iterations: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            docs_dir: PathBuf::from("docs"),
            max_iterations: 10,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration directory not found or could not be created")]
    DirectoryError,
    #[error("Missing required setting: {0}")]
    MissingSetting(&'static str),
    #[error("Invalid URL format: {0}")]
    InvalidUrl(String),
    #[error("Invalid protocol: {0} (must be 'http' or 'https')")]
    InvalidProtocol(String),
    #[error("Invalid port: {0} (must be between 1 and 65535)")]
    InvalidPort(u16),
    #[error("Invalid model name: {0} (cannot be empty)")]
    InvalidModel(String),
    #[error("Invalid embedding dimension: {0} (must be between 64 and 4096)")]
    InvalidEmbeddingDimension(u32),
    #[error("Invalid timeout: {0} (must be between 1 and 3600 seconds)")]
    InvalidTimeout(u64),
    #[error("Invalid chunk size: {0} (must be greater than zero)")]
    InvalidChunkSize(usize),
    #[error("Overlap ({overlap}) must be smaller than chunk size ({chunk_size})")]
    OverlapTooLarge { overlap: usize, chunk_size: usize },
    #[error("Invalid top_k: {0} (must be between 1 and 10000)")]
    InvalidTopK(usize),
    #[error("Invalid max_iterations: {0} (must be between 1 and 100)")]
    InvalidMaxIterations(usize),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),
}

impl From<ConfigError> for BreviaryError {
    #[inline]
    fn from(err: ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

impl Config {
    /// Get the configuration directory, honouring `BREVIARY_CONFIG_DIR`
    #[inline]
    pub fn config_dir() -> Result<PathBuf, ConfigError> {
        if let Some(dir) = std::env::var_os(CONFIG_DIR_ENV) {
            return Ok(PathBuf::from(dir));
        }

        dirs::home_dir()
            .map(|home| home.join(".breviary"))
            .or({
                #[cfg(windows)]
                {
                    dirs::data_dir().map(|data| data.join("breviary"))
                }
                #[cfg(not(windows))]
                {
                    None
                }
            })
            .ok_or(ConfigError::DirectoryError)
    }

    /// Load the process configuration: `.env`, `config.toml`, then environment overrides.
    /// The result is validated, so a missing credential fails here before any client exists.
    #[inline]
    pub fn load() -> Result<Self, ConfigError> {
        let config = Self::load_unvalidated()?;
        config.validate()?;
        Ok(config)
    }

    /// Same sources as [`Config::load`] without validation, for displaying a possibly
    /// incomplete configuration
    #[inline]
    pub fn load_unvalidated() -> Result<Self, ConfigError> {
        // A missing .env file is the normal case
        let _ = dotenvy::dotenv();

        let mut config = Self::load_from(Self::config_dir()?)?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Read `config.toml` from `config_dir`, falling back to defaults when it does not exist.
    /// No validation happens here.
    #[inline]
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();
        let config_path = config_dir.join("config.toml");

        let mut config = if config_path.exists() {
            let content = fs::read_to_string(&config_path)?;
            toml::from_str(&content)?
        } else {
            Self::default()
        };
        config.base_dir = config_dir.to_path_buf();

        Ok(config)
    }

    /// Overlay settings from the environment. `lookup` is `std::env::var` in production.
    #[inline]
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(api_key) = non_empty(PINECONE_API_KEY_ENV) {
            self.vector_store.api_key = Some(api_key);
        }
        if let Some(index_name) = non_empty(PINECONE_INDEX_NAME_ENV) {
            self.vector_store.index_name = Some(index_name);
        }
        if let Some(environment) = non_empty(PINECONE_ENVIRONMENT_ENV) {
            self.vector_store.environment = Some(environment);
        }
        if let Some(host) = non_empty(PINECONE_HOST_ENV) {
            self.vector_store.host = Some(host);
        }
        if let Some(ollama_host) = non_empty(OLLAMA_HOST_ENV) {
            self.ollama.apply_host_override(&ollama_host);
        }
    }

    #[inline]
    pub fn config_file_path(&self) -> PathBuf {
        self.base_dir.join("config.toml")
    }

    /// Directory of the local LanceDB database
    #[inline]
    pub fn vector_database_path(&self) -> PathBuf {
        self.vector_store
            .path
            .clone()
            .unwrap_or_else(|| self.base_dir.join("vectors"))
    }

    #[inline]
    pub fn ollama_url(&self) -> Result<Url, ConfigError> {
        self.ollama.ollama_url()
    }

    #[inline]
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.ollama.validate()?;
        self.vector_store.validate()?;
        self.validate_chunking_config()?;

        if !(1..=10_000).contains(&self.retrieval.top_k) {
            return Err(ConfigError::InvalidTopK(self.retrieval.top_k));
        }

        if !(1..=100).contains(&self.agent.max_iterations) {
            return Err(ConfigError::InvalidMaxIterations(self.agent.max_iterations));
        }

        Ok(())
    }

    fn validate_chunking_config(&self) -> Result<(), ConfigError> {
        let chunking = &self.chunking;

        if chunking.chunk_size == 0 {
            return Err(ConfigError::InvalidChunkSize(chunking.chunk_size));
        }

        if chunking.overlap >= chunking.chunk_size {
            return Err(ConfigError::OverlapTooLarge {
                overlap: chunking.overlap,
                chunk_size: chunking.chunk_size,
            });
        }

        Ok(())
    }
}

impl OllamaConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.protocol != "http" && self.protocol != "https" {
            return Err(ConfigError::InvalidProtocol(self.protocol.clone()));
        }

        self.ollama_url()?;

        if self.port == 0 {
            return Err(ConfigError::InvalidPort(self.port));
        }

        for model in [&self.embedding_model, &self.chat_model, &self.agent_model] {
            if model.trim().is_empty() {
                return Err(ConfigError::InvalidModel(model.clone()));
            }
        }

        if !(64..=4096).contains(&self.embedding_dimension) {
            return Err(ConfigError::InvalidEmbeddingDimension(
                self.embedding_dimension,
            ));
        }

        if !(1..=3600).contains(&self.timeout_seconds) {
            return Err(ConfigError::InvalidTimeout(self.timeout_seconds));
        }

        Ok(())
    }

    pub fn ollama_url(&self) -> Result<Url, ConfigError> {
        let url_str = format!("{}://{}:{}", self.protocol, self.host, self.port);
        Url::parse(&url_str).map_err(|_| ConfigError::InvalidUrl(url_str))
    }

    /// Accepts either a bare host name or a full `scheme://host:port` URL, the two forms
    /// `OLLAMA_HOST` is commonly set to
    fn apply_host_override(&mut self, value: &str) {
        match Url::parse(value) {
            Ok(url) if url.host_str().is_some() => {
                self.protocol = url.scheme().to_string();
                if let Some(host) = url.host_str() {
                    self.host = host.to_string();
                }
                if let Some(port) = url.port() {
                    self.port = port;
                }
            }
            _ => match value.rsplit_once(':') {
                Some((host, port)) if port.parse::<u16>().is_ok() => {
                    self.host = host.to_string();
                    self.port = port.parse().unwrap_or(self.port);
                }
                _ => self.host = value.to_string(),
            },
        }
    }
}

impl VectorStoreConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.backend {
            VectorBackend::Pinecone => {
                self.api_key()?;
                self.index_name()?;
                self.environment()?;
                if let Some(host) = &self.host {
                    Self::parse_host(host)?;
                }
                Url::parse(&self.control_plane_url)
                    .map_err(|_| ConfigError::InvalidUrl(self.control_plane_url.clone()))?;
            }
            VectorBackend::Lancedb => {
                self.index_name()?;
            }
        }
        Ok(())
    }

    pub fn api_key(&self) -> Result<&str, ConfigError> {
        required(self.api_key.as_deref(), "vector_store.api_key (PINECONE_API_KEY)")
    }

    pub fn index_name(&self) -> Result<&str, ConfigError> {
        required(
            self.index_name.as_deref(),
            "vector_store.index_name (PINECONE_INDEX_NAME)",
        )
    }

    pub fn environment(&self) -> Result<&str, ConfigError> {
        required(
            self.environment.as_deref(),
            "vector_store.environment (PINECONE_ENVIRONMENT)",
        )
    }

    /// Parse a data-plane host, adding `https://` when the scheme is omitted
    pub fn parse_host(host: &str) -> Result<Url, ConfigError> {
        let with_scheme = if host.contains("://") {
            host.to_string()
        } else {
            format!("https://{}", host)
        };
        Url::parse(&with_scheme).map_err(|_| ConfigError::InvalidUrl(host.to_string()))
    }

    /// The api key with everything but the last four characters hidden
    pub fn masked_api_key(&self) -> Option<String> {
        self.api_key.as_deref().map(|key| {
            if key.chars().count() < MIN_PARTIALLY_MASKED_KEY_LEN {
                return "****".to_string();
            }
            let visible: String = key
                .chars()
                .rev()
                .take(4)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect();
            format!("****{}", visible)
        })
    }
}

fn required<'a>(value: Option<&'a str>, name: &'static str) -> Result<&'a str, ConfigError> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or(ConfigError::MissingSetting(name))
}
