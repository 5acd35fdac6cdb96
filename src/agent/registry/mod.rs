#[cfg(test)]
mod tests;

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::debug;

use crate::llm::ToolDefinition;
use crate::{BreviaryError, Result};

/// Name of the single tool offered to the model
pub const FETCH_DOCUMENT_TOOL: &str = "fetch_document";

/// Reference documents the model may fetch. The set is closed: any other identifier is
/// rejected before touching the filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentId {
    BreviaryOfTargossas,
}

impl DocumentId {
    pub const ALL: &'static [Self] = &[Self::BreviaryOfTargossas];

    #[inline]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BreviaryOfTargossas => "breviary_of_targossas",
        }
    }

    #[inline]
    pub fn file_name(self) -> &'static str {
        match self {
            Self::BreviaryOfTargossas => "breviary_of_targossas.txt",
        }
    }

    /// One-line description shown to the model so it can choose without reading the text
    #[inline]
    pub fn summary(self) -> &'static str {
        match self {
            Self::BreviaryOfTargossas => {
                "The Breviary of Targossas: the canonical prayers of the holy city, written as \
                 numbered lines with call-and-response passages in <brackets>, invoking Lady \
                 Aurora, Lord Deucalion, the Light and the Fire. Fetch it before composing any \
                 prayer."
            }
        }
    }
}

impl fmt::Display for DocumentId {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentId {
    type Err = BreviaryError;

    #[inline]
    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|id| id.as_str() == s)
            .ok_or_else(|| BreviaryError::Validation(format!("unknown document id '{}'", s)))
    }
}

/// Maps document ids to files under a docs directory
#[derive(Debug, Clone)]
pub struct DocumentRegistry {
    docs_dir: PathBuf,
}

impl DocumentRegistry {
    #[inline]
    pub fn new(docs_dir: impl Into<PathBuf>) -> Self {
        Self {
            docs_dir: docs_dir.into(),
        }
    }

    #[inline]
    pub fn docs_dir(&self) -> &Path {
        &self.docs_dir
    }

    #[inline]
    pub fn path(&self, id: DocumentId) -> PathBuf {
        self.docs_dir.join(id.file_name())
    }

    /// `- id: summary` line per document
    #[inline]
    pub fn catalog(&self) -> String {
        DocumentId::ALL
            .iter()
            .map(|id| format!("- {}: {}", id, id.summary()))
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[inline]
    pub async fn read(&self, id: DocumentId) -> Result<String> {
        let path = self.path(id);
        debug!("Reading document {} from {:?}", id, path);
        tokio::fs::read_to_string(&path).await.map_err(|e| {
            BreviaryError::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to read {}: {}", path.display(), e),
            ))
        })
    }

    /// Schema of the `fetch_document` tool, restricted to the known ids
    #[inline]
    pub fn tool_definition(&self) -> ToolDefinition {
        let ids: Vec<&str> = DocumentId::ALL.iter().map(|id| id.as_str()).collect();
        ToolDefinition::function(
            FETCH_DOCUMENT_TOOL,
            "Fetch the full text of a reference document by its id",
            json!({
                "type": "object",
                "properties": {
                    "document_id": {
                        "type": "string",
                        "enum": ids,
                        "description": "Identifier of the document to fetch"
                    }
                },
                "required": ["document_id"]
            }),
        )
    }
}
