//! In-memory fakes for the service seams, shared by unit tests

use async_trait::async_trait;
use futures::stream;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::database::{ScoredMatch, VectorRecord, VectorStore, check_dimension};
use crate::embeddings::Embedder;
use crate::llm::{ChatMessage, ChatModel, ChatRequest, GenerateRequest, TokenStream};
use crate::{BreviaryError, Result};

/// Deterministic embedder: equal texts always map to equal vectors
pub struct FakeEmbedder {
    dimension: usize,
    fail_marker: Option<String>,
    calls: AtomicUsize,
}

impl FakeEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            fail_marker: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Fail every text containing `marker`
    pub fn failing_on(mut self, marker: &str) -> Self {
        self.fail_marker = Some(marker.to_string());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn vector_for(&self, text: &str) -> Vec<f32> {
        let mut values = vec![0.0_f32; self.dimension];
        for (i, byte) in text.bytes().enumerate() {
            if let Some(slot) = values.get_mut(i % self.dimension) {
                *slot += f32::from(byte) / 255.0;
            }
        }
        if values.iter().all(|v| *v == 0.0) {
            if let Some(first) = values.first_mut() {
                *first = 1.0;
            }
        }
        values
    }
}

#[async_trait]
impl Embedder for FakeEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(marker) = &self.fail_marker {
            if text.contains(marker.as_str()) {
                return Err(BreviaryError::Embedding(format!(
                    "refusing to embed text containing '{}'",
                    marker
                )));
            }
        }
        Ok(self.vector_for(text))
    }
}

/// Vector store kept in a map keyed by record id
pub struct MemoryStore {
    dimension: usize,
    records: Mutex<BTreeMap<String, VectorRecord>>,
    fail_queries: AtomicBool,
    upserts: AtomicUsize,
}

impl MemoryStore {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            records: Mutex::new(BTreeMap::new()),
            fail_queries: AtomicBool::new(false),
            upserts: AtomicUsize::new(0),
        }
    }

    pub fn fail_queries(&self) {
        self.fail_queries.store(true, Ordering::SeqCst);
    }

    /// Number of upsert calls seen
    pub fn upserts(&self) -> usize {
        self.upserts.load(Ordering::SeqCst)
    }

    pub fn records(&self) -> Vec<VectorRecord> {
        self.records
            .lock()
            .expect("store lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn ids(&self) -> Vec<String> {
        self.records
            .lock()
            .expect("store lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    fn check_available(&self) -> Result<()> {
        if self.fail_queries.load(Ordering::SeqCst) {
            Err(BreviaryError::VectorStore("store unavailable".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl VectorStore for MemoryStore {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn upsert(&self, records: &[VectorRecord]) -> Result<()> {
        for record in records {
            check_dimension(self.dimension, record.values.len(), &record.id)?;
        }
        self.upserts.fetch_add(1, Ordering::SeqCst);
        let mut map = self.records.lock().expect("store lock poisoned");
        for record in records {
            map.insert(record.id.clone(), record.clone());
        }
        Ok(())
    }

    async fn query_by_source(&self, source: &str, limit: usize) -> Result<Vec<ScoredMatch>> {
        self.check_available()?;
        Ok(self
            .records
            .lock()
            .expect("store lock poisoned")
            .values()
            .filter(|r| r.metadata.source == source)
            .take(limit)
            .map(|r| ScoredMatch {
                id: r.id.clone(),
                score: 0.0,
                metadata: Some(r.metadata.clone()),
            })
            .collect())
    }

    async fn delete_many(&self, ids: &[String]) -> Result<()> {
        let mut map = self.records.lock().expect("store lock poisoned");
        for id in ids {
            map.remove(id);
        }
        Ok(())
    }

    async fn query_similar(
        &self,
        vector: &[f32],
        top_k: usize,
        include_metadata: bool,
    ) -> Result<Vec<ScoredMatch>> {
        self.check_available()?;
        check_dimension(self.dimension, vector.len(), "query")?;

        let mut matches: Vec<ScoredMatch> = self
            .records
            .lock()
            .expect("store lock poisoned")
            .values()
            .map(|r| ScoredMatch {
                id: r.id.clone(),
                score: cosine(vector, &r.values),
                metadata: include_metadata.then(|| r.metadata.clone()),
            })
            .collect();
        matches.sort_by(|a, b| b.score.total_cmp(&a.score));
        matches.truncate(top_k);
        Ok(matches)
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm = |v: &[f32]| v.iter().map(|x| x * x).sum::<f32>().sqrt();
    let denominator = norm(a) * norm(b);
    if denominator == 0.0 { 0.0 } else { dot / denominator }
}

/// Chat model that replays a fixed script of replies and records what it was sent
#[derive(Default)]
pub struct ScriptedChatModel {
    replies: Mutex<VecDeque<ChatMessage>>,
    fragments: Vec<String>,
    chat_requests: Mutex<Vec<ChatRequest>>,
    generate_requests: Mutex<Vec<GenerateRequest>>,
}

impl ScriptedChatModel {
    pub fn with_replies(replies: Vec<ChatMessage>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            ..Self::default()
        }
    }

    pub fn with_fragments(fragments: &[&str]) -> Self {
        Self {
            fragments: fragments.iter().map(|f| f.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn chat_requests(&self) -> Vec<ChatRequest> {
        self.chat_requests
            .lock()
            .expect("request lock poisoned")
            .clone()
    }

    pub fn generate_requests(&self) -> Vec<GenerateRequest> {
        self.generate_requests
            .lock()
            .expect("request lock poisoned")
            .clone()
    }
}

#[async_trait]
impl ChatModel for ScriptedChatModel {
    async fn chat(&self, request: &ChatRequest) -> Result<ChatMessage> {
        self.chat_requests
            .lock()
            .expect("request lock poisoned")
            .push(request.clone());
        self.replies
            .lock()
            .expect("reply lock poisoned")
            .pop_front()
            .ok_or_else(|| BreviaryError::Chat("script exhausted".to_string()))
    }

    async fn generate_stream(&self, request: &GenerateRequest) -> Result<TokenStream> {
        self.generate_requests
            .lock()
            .expect("request lock poisoned")
            .push(request.clone());
        let fragments: Vec<Result<String>> = self.fragments.iter().cloned().map(Ok).collect();
        Ok(Box::pin(stream::iter(fragments)))
    }
}
