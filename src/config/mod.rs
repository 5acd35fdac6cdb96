// Configuration management module
// TOML settings under the config directory, overlaid with environment variables

pub mod settings;


pub use settings::{
    AgentConfig, Config, ConfigError, OllamaConfig, RetrievalConfig, VectorBackend,
    VectorStoreConfig,
};
