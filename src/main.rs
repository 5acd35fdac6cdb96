use clap::{Parser, Subcommand};
use console::style;
use std::path::PathBuf;
use std::process::ExitCode;

use breviary::commands::{run_ingest, run_pray, run_query, show_config, show_config_location};

#[derive(Parser)]
#[command(name = "breviary")]
#[command(about = "Retrieval-augmented answers and prayer composition over the Targossas corpus")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Chunk, embed and store every text document under a directory
    Ingest {
        /// Directory to scan recursively for .txt, .md, .markdown and .text files
        #[arg(default_value = "docs")]
        docs_dir: PathBuf,
    },
    /// Answer a question from the ingested documents
    Query {
        /// The question; multiple words are joined with spaces
        text: Vec<String>,
        /// Number of chunks to retrieve
        #[arg(long = "top-k", visible_alias = "topK")]
        top_k: Option<usize>,
        /// Chat model used to write the answer
        #[arg(long)]
        model: Option<String>,
    },
    /// Compose a prayer in the style of the Breviary of Targossas
    Pray {
        /// What the prayer is about; multiple words are joined with spaces
        prompt: Vec<String>,
        /// Tool-calling chat model
        #[arg(long)]
        model: Option<String>,
    },
    /// Locate or show the configuration
    Config {
        /// Show the effective configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Ingest { docs_dir } => run_ingest(&docs_dir).await.map(|_| ()),
        Commands::Query {
            text,
            top_k,
            model,
        } => {
            let Some(text) = joined(&text) else {
                return usage_error(
                    "Please provide a query string",
                    &[
                        "breviary query \"your question here\"",
                        "breviary query \"your question\" --top-k 10",
                        "breviary query \"your question\" --model llama3.2:3b",
                    ],
                );
            };
            run_query(&text, top_k, model).await
        }
        Commands::Pray { prompt, model } => {
            let Some(prompt) = joined(&prompt) else {
                return usage_error(
                    "Please provide a prayer prompt",
                    &[
                        "breviary pray \"your prayer prompt here\"",
                        "breviary pray \"your prompt\" --model qwen2.5:7b",
                    ],
                );
            };
            run_pray(&prompt, model).await
        }
        Commands::Config { show } => {
            if show {
                show_config()
            } else {
                show_config_location()
            }
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), failure_message(&e));
            ExitCode::FAILURE
        }
    }
}

/// Words joined with spaces, `None` when nothing but whitespace was given
fn joined(words: &[String]) -> Option<String> {
    let text = words.join(" ");
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

/// The error and its causes on one line; this is the only place a fatal error is printed
fn failure_message(error: &anyhow::Error) -> String {
    format!("{:#}", error)
}

fn usage_error(message: &str, usage: &[&str]) -> ExitCode {
    eprintln!("{} {}", style("Error:").red().bold(), message);
    eprintln!("\nUsage:");
    for line in usage {
        eprintln!("  {}", line);
    }
    ExitCode::FAILURE
}
