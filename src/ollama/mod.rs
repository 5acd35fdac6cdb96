#[cfg(test)]
mod tests;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use url::Url;

use crate::BreviaryError;
use crate::config::OllamaConfig;
use crate::embeddings::Embedder;
use crate::http::{self, RetryPolicy};
use crate::llm::{ChatMessage, ChatModel, ChatRequest, GenerateRequest, TokenStream, ToolDefinition};

/// Fragments buffered between the blocking reader and the async consumer
const STREAM_BUFFER: usize = 16;

#[derive(Debug, Clone)]
pub struct OllamaClient {
    base_url: Url,
    embedding_model: String,
    agent: ureq::Agent,
    streaming_agent: ureq::Agent,
    retry: RetryPolicy,
}

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embedding: Vec<f32>,
}

#[derive(Debug, Serialize)]
struct ChatPayload<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "<[_]>::is_empty")]
    tools: &'a [ToolDefinition],
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    message: ChatMessage,
}

#[derive(Debug, Serialize)]
struct GeneratePayload<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
}

/// One NDJSON line of a streamed `/api/generate` response
#[derive(Debug, Deserialize)]
struct GenerateLine {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum StreamEvent {
    Fragment(String),
    Done,
    Skip,
}

#[derive(Debug, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    pub size: Option<u64>,
    pub digest: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    models: Vec<ModelInfo>,
}

impl OllamaClient {
    #[inline]
    pub fn new(config: &OllamaConfig) -> Result<Self> {
        let base_url = config
            .ollama_url()
            .context("Failed to generate Ollama URL from config")?;

        let timeout = Duration::from_secs(config.timeout_seconds);
        Ok(Self {
            base_url,
            embedding_model: config.embedding_model.clone(),
            agent: http::agent(timeout),
            streaming_agent: http::streaming_agent(timeout),
            retry: RetryPolicy::default(),
        })
    }

    /// Replace the request timeout. Streamed generations only use it for connecting and
    /// waiting for the first response bytes.
    #[inline]
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.agent = http::agent(timeout);
        self.streaming_agent = http::streaming_agent(timeout);
        self
    }

    #[inline]
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[inline]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Test connection to the Ollama server and verify the given models are installed
    #[inline]
    pub fn health_check(&self, models: &[&str]) -> Result<()> {
        debug!("Performing health check for Ollama at {}", self.base_url);

        let available = self.list_models().context("Server ping failed")?;

        let missing: Vec<&str> = models
            .iter()
            .copied()
            .filter(|wanted| !available.iter().any(|m| model_matches(&m.name, wanted)))
            .collect();

        if !missing.is_empty() {
            let names: Vec<&str> = available.iter().map(|m| m.name.as_str()).collect();
            warn!("Models {:?} not found. Available models: {:?}", missing, names);
            return Err(anyhow::anyhow!(
                "Models {:?} are not available. Available models: {:?}",
                missing,
                names
            ));
        }

        info!("Health check passed for Ollama server at {}", self.base_url);
        Ok(())
    }

    /// List all installed models
    #[inline]
    pub fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let url = self
            .base_url
            .join("/api/tags")
            .context("Failed to build models URL")?;

        debug!("Fetching available models from {}", url);

        let response_text = self
            .retry
            .run(url.as_str(), || {
                self.agent
                    .get(url.as_str())
                    .call()
                    .and_then(|mut resp| resp.body_mut().read_to_string())
            })
            .context("Failed to fetch models")?;

        let models_response: ModelsResponse =
            serde_json::from_str(&response_text).context("Failed to parse models response")?;

        debug!("Found {} models", models_response.models.len());
        Ok(models_response.models)
    }

    /// Generate the embedding for a single text with one `/api/embeddings` call
    #[inline]
    pub fn generate_embedding(&self, text: &str) -> Result<Vec<f32>> {
        debug!("Generating embedding for text (length: {})", text.len());

        let url = self
            .base_url
            .join("/api/embeddings")
            .context("Failed to build embedding URL")?;

        let request_json = serde_json::to_string(&EmbedRequest {
            model: &self.embedding_model,
            prompt: text,
        })
        .context("Failed to serialize embedding request")?;

        let response_text = self
            .post_json(&url, &request_json)
            .context("Failed to generate embedding")?;

        let embed_response: EmbedResponse =
            serde_json::from_str(&response_text).context("Failed to parse embedding response")?;

        if embed_response.embedding.is_empty() {
            return Err(anyhow::anyhow!(
                "Model '{}' returned an empty embedding",
                self.embedding_model
            ));
        }

        debug!(
            "Generated embedding with {} dimensions",
            embed_response.embedding.len()
        );
        Ok(embed_response.embedding)
    }

    /// Send one non-streaming `/api/chat` request
    #[inline]
    pub fn chat_blocking(&self, request: &ChatRequest) -> Result<ChatMessage> {
        let url = self
            .base_url
            .join("/api/chat")
            .context("Failed to build chat URL")?;

        debug!(
            "Sending chat request with {} messages and {} tools to {}",
            request.messages.len(),
            request.tools.len(),
            request.model
        );

        let request_json = serde_json::to_string(&ChatPayload {
            model: &request.model,
            messages: &request.messages,
            tools: &request.tools,
            stream: false,
        })
        .context("Failed to serialize chat request")?;

        // Timed-out chat turns are never re-sent
        let retry = self.retry.with_timeout_retries(false);
        let response_text = retry
            .run(url.as_str(), || self.send_json(&url, &request_json))
            .context("Failed to complete chat request")?;

        let response: ChatResponse =
            serde_json::from_str(&response_text).context("Failed to parse chat response")?;

        debug!(
            "Chat response: {} characters, {} tool calls",
            response.message.content.len(),
            response.message.tool_calls.len()
        );
        Ok(response.message)
    }

    /// Start a streaming `/api/generate` request and return the NDJSON body reader.
    /// Retries cover establishing the response only, never a partially read stream.
    fn open_generate_stream(&self, request: &GenerateRequest) -> Result<Box<dyn BufRead + Send>> {
        let url = self
            .base_url
            .join("/api/generate")
            .context("Failed to build generate URL")?;

        let request_json = serde_json::to_string(&GeneratePayload {
            model: &request.model,
            prompt: &request.prompt,
            stream: true,
        })
        .context("Failed to serialize generate request")?;

        let response = self
            .retry
            .run(url.as_str(), || {
                self.streaming_agent
                    .post(url.as_str())
                    .header("Content-Type", "application/json")
                    .send(&request_json)
            })
            .context("Failed to start generation")?;

        Ok(Box::new(BufReader::new(response.into_body().into_reader())))
    }

    fn post_json(&self, url: &Url, body: &str) -> Result<String> {
        self.retry.run(url.as_str(), || self.send_json(url, body))
    }

    fn send_json(&self, url: &Url, body: &str) -> Result<String, ureq::Error> {
        self.agent
            .post(url.as_str())
            .header("Content-Type", "application/json")
            .send(body)
            .and_then(|mut resp| resp.body_mut().read_to_string())
    }
}

#[async_trait]
impl Embedder for OllamaClient {
    async fn embed(&self, text: &str) -> crate::Result<Vec<f32>> {
        let client = self.clone();
        let text = text.to_string();

        tokio::task::spawn_blocking(move || client.generate_embedding(&text))
            .await
            .map_err(|e| BreviaryError::Embedding(format!("Embedding task failed: {}", e)))?
            .map_err(|e| BreviaryError::Embedding(format!("{:#}", e)))
    }
}

#[async_trait]
impl ChatModel for OllamaClient {
    async fn chat(&self, request: &ChatRequest) -> crate::Result<ChatMessage> {
        let client = self.clone();
        let request = request.clone();

        tokio::task::spawn_blocking(move || client.chat_blocking(&request))
            .await
            .map_err(|e| BreviaryError::Chat(format!("Chat task failed: {}", e)))?
            .map_err(|e| BreviaryError::Chat(format!("{:#}", e)))
    }

    async fn generate_stream(&self, request: &GenerateRequest) -> crate::Result<TokenStream> {
        let client = self.clone();
        let request = request.clone();

        let reader = tokio::task::spawn_blocking(move || client.open_generate_stream(&request))
            .await
            .map_err(|e| BreviaryError::Chat(format!("Generate task failed: {}", e)))?
            .map_err(|e| BreviaryError::Chat(format!("{:#}", e)))?;

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        tokio::task::spawn_blocking(move || forward_fragments(reader, &tx));

        Ok(Box::pin(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })))
    }
}

/// Read NDJSON lines and push each text fragment into `tx` until the model reports
/// completion, the body ends, an error occurs or the consumer goes away
fn forward_fragments<R: BufRead>(reader: R, tx: &mpsc::Sender<crate::Result<String>>) {
    for line in reader.lines() {
        let event = line
            .context("Failed to read generation stream")
            .and_then(|line| parse_generate_line(&line));

        match event {
            Ok(StreamEvent::Skip) => {}
            Ok(StreamEvent::Fragment(text)) => {
                if tx.blocking_send(Ok(text)).is_err() {
                    debug!("Stream consumer dropped, stopping generation reader");
                    return;
                }
            }
            Ok(StreamEvent::Done) => return,
            Err(e) => {
                let _ = tx.blocking_send(Err(BreviaryError::Chat(format!("{:#}", e))));
                return;
            }
        }
    }
}

fn parse_generate_line(line: &str) -> Result<StreamEvent> {
    if line.trim().is_empty() {
        return Ok(StreamEvent::Skip);
    }

    let parsed: GenerateLine =
        serde_json::from_str(line).context("Failed to parse generation stream line")?;

    if let Some(error) = parsed.error {
        return Err(anyhow::anyhow!("Model reported an error: {}", error));
    }

    if parsed.done {
        // The final line may still carry trailing text
        return Ok(if parsed.response.is_empty() {
            StreamEvent::Done
        } else {
            StreamEvent::Fragment(parsed.response)
        });
    }

    Ok(if parsed.response.is_empty() {
        StreamEvent::Skip
    } else {
        StreamEvent::Fragment(parsed.response)
    })
}

/// Ollama reports `name:latest` for models requested without a tag
fn model_matches(installed: &str, wanted: &str) -> bool {
    installed == wanted
        || (!wanted.contains(':') && installed.strip_suffix(":latest") == Some(wanted))
}
