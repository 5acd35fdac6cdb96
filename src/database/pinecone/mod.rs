//! Pinecone REST backend
//!
//! Talks to the index data plane with blocking `ureq` calls run on the tokio blocking pool.
//! The data-plane host is taken from configuration or resolved once by describing the index
//! through the control plane.


use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use super::{
    MAX_BATCH_SIZE, RecordMetadata, ScoredMatch, VectorRecord, VectorStore, check_dimension,
};
use crate::BreviaryError;
use crate::config::VectorStoreConfig;
use crate::http::{self, RetryPolicy};

const API_VERSION: &str = "2024-07";
const REQUEST_TIMEOUT_SECONDS: u64 = 30;

#[derive(Debug, Clone)]
pub struct PineconeStore {
    host: Url,
    api_key: String,
    dimension: usize,
    agent: ureq::Agent,
    retry: RetryPolicy,
}

#[derive(Debug, Serialize)]
struct UpsertRequest<'a> {
    vectors: &'a [VectorRecord],
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryRequest<'a> {
    vector: &'a [f32],
    top_k: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    filter: Option<Value>,
    include_metadata: bool,
    include_values: bool,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    matches: Vec<QueryMatch>,
}

#[derive(Debug, Deserialize)]
struct QueryMatch {
    id: String,
    #[serde(default)]
    score: f32,
    metadata: Option<RecordMetadata>,
}

#[derive(Debug, Serialize)]
struct DeleteRequest<'a> {
    ids: &'a [String],
}

#[derive(Debug, Deserialize)]
struct IndexDescription {
    host: String,
    dimension: Option<usize>,
    #[serde(default)]
    spec: Value,
}

impl IndexDescription {
    /// Pod indexes report an environment, serverless ones a region
    fn location(&self) -> Option<&str> {
        self.spec
            .pointer("/pod/environment")
            .or_else(|| self.spec.pointer("/serverless/region"))
            .and_then(Value::as_str)
    }
}

impl PineconeStore {
    /// Build a store for the configured index, describing it through the control plane
    /// when no data-plane host is configured
    #[inline]
    pub async fn connect(config: &VectorStoreConfig, dimension: usize) -> crate::Result<Self> {
        let config = config.clone();
        tokio::task::spawn_blocking(move || Self::connect_blocking(&config, dimension))
            .await
            .map_err(|e| BreviaryError::VectorStore(format!("Connect task failed: {}", e)))?
    }

    fn connect_blocking(config: &VectorStoreConfig, dimension: usize) -> crate::Result<Self> {
        let api_key = config.api_key()?.to_string();
        let index_name = config.index_name()?;
        let environment = config.environment()?;
        let agent = http::agent(Duration::from_secs(REQUEST_TIMEOUT_SECONDS));
        let retry = RetryPolicy::default();

        let host = match &config.host {
            Some(host) => VectorStoreConfig::parse_host(host)?,
            None => {
                let description = describe_index(
                    &agent,
                    retry,
                    &config.control_plane_url,
                    &api_key,
                    index_name,
                )
                .map_err(|e| BreviaryError::VectorStore(format!("{:#}", e)))?;

                if let Some(location) = description.location() {
                    if location != environment {
                        warn!(
                            "Index '{}' is in '{}' but PINECONE_ENVIRONMENT is '{}'",
                            index_name, location, environment
                        );
                    }
                }

                if let Some(index_dimension) = description.dimension {
                    if index_dimension != dimension {
                        return Err(BreviaryError::Validation(format!(
                            "index '{}' has dimension {}, embedding model produces {}",
                            index_name, index_dimension, dimension
                        )));
                    }
                }

                VectorStoreConfig::parse_host(&description.host)?
            }
        };

        info!("Using Pinecone index '{}' ({})", index_name, environment);

        Ok(Self {
            host,
            api_key,
            dimension,
            agent,
            retry,
        })
    }

    /// Build a store against a known data-plane host without contacting the control plane
    #[inline]
    pub fn with_host(host: Url, api_key: impl Into<String>, dimension: usize) -> Self {
        Self {
            host,
            api_key: api_key.into(),
            dimension,
            agent: http::agent(Duration::from_secs(REQUEST_TIMEOUT_SECONDS)),
            retry: RetryPolicy::default(),
        }
    }

    #[inline]
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[inline]
    pub fn host(&self) -> &Url {
        &self.host
    }

    fn upsert_blocking(&self, records: &[VectorRecord]) -> Result<()> {
        for batch in records.chunks(MAX_BATCH_SIZE) {
            let body = serde_json::to_string(&UpsertRequest { vectors: batch })
                .context("Failed to serialize upsert request")?;
            self.post("/vectors/upsert", &body)
                .with_context(|| format!("Failed to upsert batch of {} vectors", batch.len()))?;
            debug!("Upserted batch of {} vectors", batch.len());
        }
        Ok(())
    }

    fn query_blocking(&self, request: &QueryRequest<'_>) -> Result<Vec<ScoredMatch>> {
        let body = serde_json::to_string(request).context("Failed to serialize query")?;
        let response_text = self.post("/query", &body).context("Failed to query index")?;
        let response: QueryResponse =
            serde_json::from_str(&response_text).context("Failed to parse query response")?;

        let mut matches: Vec<ScoredMatch> = response
            .matches
            .into_iter()
            .map(|m| ScoredMatch {
                id: m.id,
                score: m.score,
                metadata: m.metadata,
            })
            .collect();
        matches.sort_by(|a, b| b.score.total_cmp(&a.score));
        matches.truncate(request.top_k);

        Ok(matches)
    }

    fn delete_blocking(&self, ids: &[String]) -> Result<()> {
        for batch in ids.chunks(MAX_BATCH_SIZE) {
            let body = serde_json::to_string(&DeleteRequest { ids: batch })
                .context("Failed to serialize delete request")?;
            self.post("/vectors/delete", &body)
                .with_context(|| format!("Failed to delete batch of {} ids", batch.len()))?;
            debug!("Deleted batch of {} ids", batch.len());
        }
        Ok(())
    }

    fn post(&self, endpoint: &str, body: &str) -> Result<String> {
        let url = self
            .host
            .join(endpoint)
            .with_context(|| format!("Failed to build {} URL", endpoint))?;

        self.retry.run(url.as_str(), || {
            self.agent
                .post(url.as_str())
                .header("Api-Key", &self.api_key)
                .header("X-Pinecone-API-Version", API_VERSION)
                .header("Content-Type", "application/json")
                .send(body)
                .and_then(|mut resp| resp.body_mut().read_to_string())
        })
    }

    /// Run a blocking operation against a clone of this store on the blocking pool
    async fn blocking<T, F>(&self, op: F) -> crate::Result<T>
    where
        F: FnOnce(&Self) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || op(&store))
            .await
            .map_err(|e| BreviaryError::VectorStore(format!("Pinecone task failed: {}", e)))?
            .map_err(|e| BreviaryError::VectorStore(format!("{:#}", e)))
    }
}

#[async_trait]
impl VectorStore for PineconeStore {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn upsert(&self, records: &[VectorRecord]) -> crate::Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        for record in records {
            check_dimension(self.dimension, record.values.len(), &record.id)?;
        }

        let records = records.to_vec();
        self.blocking(move |store| store.upsert_blocking(&records))
            .await
    }

    async fn query_by_source(&self, source: &str, limit: usize) -> crate::Result<Vec<ScoredMatch>> {
        let source = source.to_string();
        let placeholder = vec![0.0_f32; self.dimension];

        self.blocking(move |store| {
            store.query_blocking(&QueryRequest {
                vector: &placeholder,
                top_k: limit,
                filter: Some(json!({ "source": { "$eq": source } })),
                include_metadata: false,
                include_values: false,
            })
        })
        .await
    }

    async fn delete_many(&self, ids: &[String]) -> crate::Result<()> {
        if ids.is_empty() {
            return Ok(());
        }

        let ids = ids.to_vec();
        self.blocking(move |store| store.delete_blocking(&ids)).await
    }

    async fn query_similar(
        &self,
        vector: &[f32],
        top_k: usize,
        include_metadata: bool,
    ) -> crate::Result<Vec<ScoredMatch>> {
        check_dimension(self.dimension, vector.len(), "query")?;
        let vector = vector.to_vec();

        self.blocking(move |store| {
            store.query_blocking(&QueryRequest {
                vector: &vector,
                top_k,
                filter: None,
                include_metadata,
                include_values: false,
            })
        })
        .await
    }
}

fn describe_index(
    agent: &ureq::Agent,
    retry: RetryPolicy,
    control_plane_url: &str,
    api_key: &str,
    index_name: &str,
) -> Result<IndexDescription> {
    let url = Url::parse(control_plane_url)
        .and_then(|base| base.join(&format!("/indexes/{}", index_name)))
        .context("Failed to build describe index URL")?;

    debug!("Describing Pinecone index at {}", url);

    let response_text = retry
        .run(url.as_str(), || {
            agent
                .get(url.as_str())
                .header("Api-Key", api_key)
                .header("X-Pinecone-API-Version", API_VERSION)
                .call()
                .and_then(|mut resp| resp.body_mut().read_to_string())
        })
        .with_context(|| format!("Failed to describe index '{}'", index_name))?;

    serde_json::from_str(&response_text).context("Failed to parse index description")
}
