//! Agentic tool loop
//!
//! The chat model is given a catalog of reference documents and a `fetch_document` tool.
//! It may fetch documents over several turns before writing its answer; every turn sends
//! the full conversation. The loop ends when the model replies with content, replies with
//! nothing, or the iteration cap is reached.

pub mod registry;


use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::llm::{ChatMessage, ChatModel, ChatRequest, ToolCall};
use crate::{BreviaryError, Result};

pub use registry::{DocumentId, DocumentRegistry, FETCH_DOCUMENT_TOOL};

/// Model turns allowed before the loop gives up
pub const DEFAULT_MAX_ITERATIONS: usize = 10;

/// Successful end of a tool loop run
#[derive(Debug, Clone, PartialEq)]
pub struct LoopOutcome {
    /// The model's final answer, verbatim
    pub content: String,
    /// Documents fetched across all turns, in order
    pub fetched: Vec<DocumentId>,
    /// Model turns taken, including the final one
    pub iterations: usize,
    /// Full conversation, ending with the final assistant message
    pub transcript: Vec<ChatMessage>,
}

/// Bounded conversation in which the model fetches reference documents before answering
pub struct ToolLoop {
    chat: Arc<dyn ChatModel>,
    registry: DocumentRegistry,
    model: String,
    max_iterations: usize,
}

impl ToolLoop {
    #[inline]
    pub fn new(chat: Arc<dyn ChatModel>, registry: DocumentRegistry, model: impl Into<String>) -> Self {
        Self {
            chat,
            registry,
            model: model.into(),
            max_iterations: DEFAULT_MAX_ITERATIONS,
        }
    }

    /// Cap on model turns; at least one turn is always allowed
    #[inline]
    #[must_use]
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations.max(1);
        self
    }

    #[inline]
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Compose a prayer for `request`
    #[inline]
    pub async fn run(&self, request: &str) -> Result<LoopOutcome> {
        let request = request.trim();
        if request.is_empty() {
            return Err(BreviaryError::Validation(
                "prayer prompt must not be empty".to_string(),
            ));
        }

        let mut conversation = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage::system(system_prompt(&self.registry.catalog())),
                ChatMessage::user(request),
            ],
            tools: vec![self.registry.tool_definition()],
        };
        let mut fetched = Vec::new();

        for iteration in 1..=self.max_iterations {
            debug!(
                "Tool loop turn {} with {} messages",
                iteration,
                conversation.messages.len()
            );
            let reply = self.chat.chat(&conversation).await?;
            let tool_calls = reply.tool_calls.clone();
            let content = reply.has_content().then(|| reply.content.clone());
            conversation.messages.push(reply);

            if !tool_calls.is_empty() {
                for call in &tool_calls {
                    let id = resolve_call(call)?;
                    info!("Model requested document {}", id);
                    let text = self.registry.read(id).await?;
                    conversation
                        .messages
                        .push(ChatMessage::tool(tool_result(&text, request)));
                    fetched.push(id);
                }
                continue;
            }

            let Some(content) = content else {
                warn!("Model returned neither content nor tool calls");
                return Err(BreviaryError::DegenerateResponse);
            };

            info!(
                "Tool loop finished after {} turn(s), {} document(s) fetched",
                iteration,
                fetched.len()
            );
            return Ok(LoopOutcome {
                content,
                fetched,
                iterations: iteration,
                transcript: conversation.messages,
            });
        }

        warn!("Tool loop hit the cap of {} turns", self.max_iterations);
        Err(BreviaryError::IterationLimit(self.max_iterations))
    }
}

/// Validate a tool call against the closed tool and document sets
fn resolve_call(call: &ToolCall) -> Result<DocumentId> {
    if call.function.name != FETCH_DOCUMENT_TOOL {
        return Err(BreviaryError::Validation(format!(
            "model called unknown tool '{}'",
            call.function.name
        )));
    }

    call.function
        .string_argument("document_id")
        .ok_or_else(|| {
            BreviaryError::Validation(format!(
                "{} call is missing a string 'document_id' argument",
                FETCH_DOCUMENT_TOOL
            ))
        })?
        .parse()
}

fn system_prompt(catalog: &str) -> String {
    format!(
        "You are a prayer composer for the holy city of Targossas. You write prayers in the \
         style of the Breviary of Targossas.\n\n\
         Use the {} tool to read the reference documents you need before writing. \
         Available documents:\n{}\n\n\
         CRITICAL: You must ONLY output prayer text. Never explain, discuss, or analyze. \
         Only write the prayer itself.",
        FETCH_DOCUMENT_TOOL, catalog
    )
}

/// Document text followed by the original request and its requirements, so the request
/// stays the last thing the model reads
fn tool_result(document: &str, request: &str) -> String {
    format!(
        "{}\n\n---\n\n\
         Write a prayer about: \"{}\"\n\n\
         Requirements:\n\
         - Match the Breviary's style exactly (numbered lines, call-and-response with <brackets>)\n\
         - Use phrases like: \"We pray...\", \"May we...\", \"So mote it be\", \"Amen\"\n\
         - Reference: Lady Aurora, Lord Deucalion, Light, Fire, Good, Righteousness, Creation\n\
         - Be reverent and formal\n\n\
         Output ONLY the prayer text. Do not explain or discuss. Begin now:",
        document, request
    )
}
