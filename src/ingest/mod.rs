// Ingestion module
// Replaces a document's vectors in the store: delete every existing chunk of the source,
// then embed and upsert the new chunks one at a time.


use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::database::{RecordMetadata, SOURCE_SCAN_LIMIT, VectorRecord, VectorStore};
use crate::embeddings::{Chunker, Embedder};
use crate::{BreviaryError, Result};

/// File extensions picked up by directory ingestion, compared case-insensitively
pub const SUPPORTED_EXTENSIONS: &[&str] = &["txt", "md", "markdown", "text"];

/// Outcome of ingesting one document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentReport {
    /// Canonical path recorded as the `source` of every chunk
    pub source: String,
    /// Chunks of a previous ingestion that were removed
    pub chunks_deleted: usize,
    pub chunks_upserted: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedDocument {
    pub path: PathBuf,
    pub error: String,
}

/// Totals of a directory ingestion
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestSummary {
    pub files_found: usize,
    pub succeeded: usize,
    pub failed: Vec<FailedDocument>,
    pub chunks_upserted: usize,
}

impl IngestSummary {
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Chunks, embeds and stores documents through injected service handles
pub struct IngestionPipeline {
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn VectorStore>,
    chunker: Chunker,
    show_progress: bool,
}

impl IngestionPipeline {
    #[inline]
    pub fn new(embedder: Arc<dyn Embedder>, store: Arc<dyn VectorStore>, chunker: Chunker) -> Self {
        Self {
            embedder,
            store,
            chunker,
            show_progress: false,
        }
    }

    /// Print a header per document and a chunk progress bar on an attended terminal
    #[inline]
    #[must_use]
    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    /// Replace all stored chunks of `path` with freshly embedded ones.
    ///
    /// Chunks are upserted one at a time, so when chunk `k` fails the chunks before it
    /// remain stored and the error is returned.
    #[inline]
    pub async fn ingest_document(&self, path: &Path) -> Result<DocumentReport> {
        let canonical = tokio::fs::canonicalize(path).await?;
        let source = canonical
            .to_str()
            .ok_or_else(|| {
                BreviaryError::Validation(format!("path {:?} is not valid UTF-8", canonical))
            })?
            .to_string();

        let text = tokio::fs::read_to_string(&canonical).await?;

        info!("Ingesting {}", source);
        debug!(
            "Chunk size {}, overlap {}",
            self.chunker.chunk_size(),
            self.chunker.overlap()
        );

        let existing: Vec<String> = self
            .store
            .query_by_source(&source, SOURCE_SCAN_LIMIT)
            .await?
            .into_iter()
            .map(|m| m.id)
            .collect();

        if existing.is_empty() {
            info!("New file, nothing to replace");
        } else {
            self.store.delete_many(&existing).await?;
            info!("Deleted {} existing chunks", existing.len());
        }

        let total = self.chunker.chunk_count(&text);
        let total_chunks = u32::try_from(total).map_err(|_| {
            BreviaryError::Validation(format!("{} produces too many chunks ({})", source, total))
        })?;

        let bar = self.progress_bar(total);
        for chunk in self.chunker.chunks(&text) {
            let values = self.embedder.embed(chunk.text).await?;
            let record = VectorRecord {
                id: VectorRecord::record_id(&source, chunk.index),
                values,
                metadata: RecordMetadata {
                    text: chunk.text.to_string(),
                    source: source.clone(),
                    chunk_index: chunk.index as u32,
                    total_chunks,
                },
            };

            self.store.upsert(std::slice::from_ref(&record)).await?;
            debug!("Upserted chunk {}/{}", chunk.index + 1, total);
            bar.inc(1);
        }
        bar.finish_and_clear();

        info!("Stored {} chunks for {}", total, source);

        Ok(DocumentReport {
            source,
            chunks_deleted: existing.len(),
            chunks_upserted: total,
        })
    }

    /// Ingest every supported file under `dir`. A failing document is recorded in the
    /// summary and the remaining documents are still processed.
    #[inline]
    pub async fn ingest_directory(&self, dir: &Path) -> Result<IngestSummary> {
        let files = collect_text_files(dir).await?;
        Ok(self.ingest_files(&files).await)
    }

    /// Ingest `files` in order with per-file failure isolation
    #[inline]
    pub async fn ingest_files(&self, files: &[PathBuf]) -> IngestSummary {
        let mut summary = IngestSummary {
            files_found: files.len(),
            ..IngestSummary::default()
        };

        for (i, path) in files.iter().enumerate() {
            if self.show_progress {
                eprintln!(
                    "\n[{}/{}] {} {}",
                    i + 1,
                    files.len(),
                    style("Processing:").cyan().bold(),
                    path.display()
                );
                eprintln!("{}", style("─".repeat(60)).dim());
            }

            match self.ingest_document(path).await {
                Ok(report) => {
                    summary.succeeded += 1;
                    summary.chunks_upserted += report.chunks_upserted;
                }
                Err(e) => {
                    error!("Failed to ingest {}: {}", path.display(), e);
                    summary.failed.push(FailedDocument {
                        path: path.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        summary
    }

    fn progress_bar(&self, total: usize) -> ProgressBar {
        if !self.show_progress || !console::user_attended_stderr() {
            return ProgressBar::hidden();
        }

        let bar = ProgressBar::new(total as u64);
        if let Ok(template) = ProgressStyle::with_template("{bar:40} [{pos}/{len}] Embedding chunks")
        {
            bar.set_style(template);
        }
        bar
    }
}

/// Recursively list files under `dir` with a supported extension, sorted by path
#[inline]
pub async fn collect_text_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];

    while let Some(current) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&current).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_dir() {
                pending.push(path);
            } else if has_supported_extension(&path) {
                files.push(path);
            }
        }
    }

    files.sort();
    Ok(files)
}

#[inline]
pub fn has_supported_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            SUPPORTED_EXTENSIONS
                .iter()
                .any(|supported| ext.eq_ignore_ascii_case(supported))
        })
}
