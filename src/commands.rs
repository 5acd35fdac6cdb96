use anyhow::{Context, Result};
use console::style;
use futures::StreamExt;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use crate::agent::{DocumentRegistry, ToolLoop};
use crate::config::{Config, VectorBackend};
use crate::database;
use crate::embeddings::{Chunker, Embedder};
use crate::ingest::{IngestSummary, IngestionPipeline, SUPPORTED_EXTENSIONS, collect_text_files};
use crate::llm::ChatModel;
use crate::ollama::OllamaClient;
use crate::query::{QueryOutcome, RetrievalEngine};

/// Ingest every supported document under `docs_dir`.
///
/// Per-document failures are listed in the summary; only failures before the walk starts
/// (configuration, connecting, listing the directory) are returned as errors.
#[inline]
pub async fn run_ingest(docs_dir: &Path) -> Result<IngestSummary> {
    let config = Config::load().context("Failed to load configuration")?;
    let docs_dir = std::fs::canonicalize(docs_dir)
        .with_context(|| format!("Documents directory {} not found", docs_dir.display()))?;

    println!("Scanning for documents in: {}", docs_dir.display());
    let files = collect_text_files(&docs_dir)
        .await
        .context("Failed to list documents")?;

    if files.is_empty() {
        println!("{}", style("No text files found in docs directory.").yellow());
        println!(
            "Supported extensions: {}",
            SUPPORTED_EXTENSIONS
                .iter()
                .map(|ext| format!(".{}", ext))
                .collect::<Vec<_>>()
                .join(", ")
        );
        return Ok(IngestSummary::default());
    }

    println!("Found {} document(s) to ingest:\n", files.len());
    for (i, file) in files.iter().enumerate() {
        println!("  {}. {}", i + 1, file.display());
    }

    let ollama = connect_ollama(&config, &[config.ollama.embedding_model.as_str()]).await?;
    let store = database::connect(&config)
        .await
        .context("Failed to connect to the vector store")?;
    let chunker = Chunker::from_config(&config.chunking)?;

    let pipeline = IngestionPipeline::new(ollama as Arc<dyn Embedder>, store, chunker)
        .with_progress(true);
    let summary = pipeline.ingest_files(&files).await;

    println!("\n{}", "═".repeat(60));
    if summary.is_complete() {
        println!("{}", style("✓ All documents processed!").green().bold());
    } else {
        println!(
            "{}",
            style(format!(
                "Processed {} of {} document(s), {} failed:",
                summary.succeeded,
                summary.files_found,
                summary.failed.len()
            ))
            .yellow()
            .bold()
        );
        for failure in &summary.failed {
            println!(
                "  {} {}: {}",
                style("✗").red(),
                failure.path.display(),
                failure.error
            );
        }
    }
    println!("Chunks stored: {}", summary.chunks_upserted);

    Ok(summary)
}

/// Answer `text` from the stored chunks, printing the answer as it streams in
#[inline]
pub async fn run_query(text: &str, top_k: Option<usize>, model: Option<String>) -> Result<()> {
    let config = Config::load().context("Failed to load configuration")?;
    let model = model.unwrap_or_else(|| config.ollama.chat_model.clone());
    let top_k = top_k.unwrap_or(config.retrieval.top_k);

    let ollama = connect_ollama(
        &config,
        &[config.ollama.embedding_model.as_str(), model.as_str()],
    )
    .await?;
    let store = database::connect(&config)
        .await
        .context("Failed to connect to the vector store")?;

    let engine = RetrievalEngine::new(
        Arc::clone(&ollama) as Arc<dyn Embedder>,
        store,
        ollama as Arc<dyn ChatModel>,
        model,
    );
    info!("Answering with {} from the top {} chunk(s)", engine.model(), top_k);

    match engine.query(text, top_k).await? {
        QueryOutcome::NoMatches => {
            println!("No relevant documents found.");
        }
        QueryOutcome::Answer { matches, mut stream } => {
            println!("Found {} relevant document(s)\n", matches.len());

            let mut stdout = std::io::stdout();
            while let Some(fragment) = stream.next().await {
                stdout.write_all(fragment?.as_bytes())?;
                stdout.flush()?;
            }
            writeln!(stdout, "\n")?;
        }
    }

    Ok(())
}

/// Compose a prayer through the document-fetching tool loop
#[inline]
pub async fn run_pray(prompt: &str, model: Option<String>) -> Result<()> {
    let config = Config::load().context("Failed to load configuration")?;
    let model = model.unwrap_or_else(|| config.ollama.agent_model.clone());

    let ollama = connect_ollama(&config, &[model.as_str()]).await?;
    let tool_loop = ToolLoop::new(
        ollama as Arc<dyn ChatModel>,
        DocumentRegistry::new(&config.agent.docs_dir),
        model,
    )
    .with_max_iterations(config.agent.max_iterations);
    info!("Composing with {}", tool_loop.model());

    let outcome = tool_loop.run(prompt).await?;
    info!(
        "Prayer composed after {} turn(s) with {} document fetch(es)",
        outcome.iterations,
        outcome.fetched.len()
    );
    println!("{}", outcome.content);

    Ok(())
}

/// Print the effective configuration with the api key masked
#[inline]
pub fn show_config() -> Result<()> {
    let config = Config::load_unvalidated().context("Failed to load configuration")?;
    let unset = || style("(not set)".to_string()).red();

    eprintln!("{}", style("📋 Current Configuration").bold().cyan());
    eprintln!();

    eprintln!("{}", style("Ollama Settings:").bold().yellow());
    match config.ollama_url() {
        Ok(url) => eprintln!("  URL: {}", style(url).cyan()),
        Err(e) => eprintln!("  URL: {} ({})", style("Invalid").red(), e),
    }
    eprintln!(
        "  Embedding model: {} ({} dimensions)",
        style(&config.ollama.embedding_model).cyan(),
        config.ollama.embedding_dimension
    );
    eprintln!("  Query model: {}", style(&config.ollama.chat_model).cyan());
    eprintln!("  Prayer model: {}", style(&config.ollama.agent_model).cyan());

    eprintln!();
    eprintln!("{}", style("Vector Store:").bold().yellow());
    let vector_store = &config.vector_store;
    match vector_store.backend {
        VectorBackend::Pinecone => {
            eprintln!("  Backend: {}", style("pinecone").cyan());
            eprintln!(
                "  API key: {}",
                vector_store
                    .masked_api_key()
                    .map_or_else(unset, |key| style(key).cyan())
            );
            eprintln!(
                "  Environment: {}",
                vector_store
                    .environment
                    .clone()
                    .map_or_else(unset, |env| style(env).cyan())
            );
            if let Some(host) = &vector_store.host {
                eprintln!("  Host: {}", style(host).cyan());
            }
        }
        VectorBackend::Lancedb => {
            eprintln!("  Backend: {}", style("lancedb").cyan());
            eprintln!(
                "  Path: {}",
                style(config.vector_database_path().display()).cyan()
            );
        }
    }
    eprintln!(
        "  Index: {}",
        vector_store
            .index_name
            .clone()
            .map_or_else(unset, |name| style(name).cyan())
    );

    eprintln!();
    eprintln!("{}", style("Pipeline:").bold().yellow());
    eprintln!(
        "  Chunking: {} characters, {} overlap",
        config.chunking.chunk_size, config.chunking.overlap
    );
    eprintln!("  Top-k: {}", config.retrieval.top_k);
    eprintln!(
        "  Documents: {} (max {} tool turns)",
        config.agent.docs_dir.display(),
        config.agent.max_iterations
    );

    eprintln!();
    if let Err(e) = config.validate() {
        eprintln!("{} {}", style("⚠").yellow(), style(e).yellow());
    }
    eprintln!("Config file: {}", style(config.config_file_path().display()).dim());

    Ok(())
}

/// Print where settings are read from
#[inline]
pub fn show_config_location() -> Result<()> {
    let dir = Config::config_dir().context("Failed to get config directory")?;
    eprintln!("Config file: {}", style(dir.join("config.toml").display()).cyan());
    eprintln!(
        "Environment variables PINECONE_API_KEY, PINECONE_INDEX_NAME, PINECONE_ENVIRONMENT, \
         PINECONE_HOST and OLLAMA_HOST override the file, and a .env file in the working \
         directory is loaded first."
    );
    eprintln!("Run {} to see the effective settings.", style("breviary config --show").bold());
    Ok(())
}

/// Build the Ollama client and make sure `models` are installed before any work starts
async fn connect_ollama(config: &Config, models: &[&str]) -> Result<Arc<OllamaClient>> {
    let client = OllamaClient::new(&config.ollama)?;
    let models: Vec<String> = models.iter().map(|m| m.to_string()).collect();

    let checked = client.clone();
    tokio::task::spawn_blocking(move || {
        let models: Vec<&str> = models.iter().map(String::as_str).collect();
        checked.health_check(&models)
    })
    .await
    .context("Health check task failed")?
    .with_context(|| format!("Ollama at {} is not ready", client.base_url()))?;

    Ok(Arc::new(client))
}
