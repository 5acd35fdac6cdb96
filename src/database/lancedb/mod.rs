// LanceDB vector database module
// Local on-disk backend for the vector store, one table per index name


use arrow::array::{
    Array, FixedSizeListArray, Float32Array, RecordBatchIterator, StringArray, UInt32Array,
};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use futures::TryStreamExt;
use lancedb::query::{ExecutableQuery, QueryBase};
use lancedb::{DistanceType, Table};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use super::{MAX_BATCH_SIZE, RecordMetadata, ScoredMatch, VectorRecord, VectorStore, check_dimension};
use crate::{BreviaryError, Result};

/// Vector store backed by a LanceDB table on local disk
pub struct LanceStore {
    table: Table,
    dimension: usize,
}

impl LanceStore {
    /// Open (or create) `table_name` in the database at `path`.
    ///
    /// An existing table whose vector column has another dimension is rejected rather than
    /// recreated, so stored chunks are never dropped silently.
    #[inline]
    pub async fn connect(path: &Path, table_name: &str, dimension: usize) -> Result<Self> {
        debug!("Initializing LanceDB at path: {:?}", path);

        std::fs::create_dir_all(path).map_err(|e| {
            BreviaryError::VectorStore(format!("Failed to create vector database directory: {}", e))
        })?;

        let uri = path.display().to_string();
        let connection = lancedb::connect(&uri)
            .execute()
            .await
            .map_err(|e| store_error("Failed to connect to LanceDB", e))?;

        let table_names = connection
            .table_names()
            .execute()
            .await
            .map_err(|e| store_error("Failed to list tables", e))?;

        let table = if table_names.iter().any(|name| name == table_name) {
            let table = connection
                .open_table(table_name)
                .execute()
                .await
                .map_err(|e| store_error("Failed to open table", e))?;

            let existing = existing_dimension(&table).await?;
            if existing != dimension {
                return Err(BreviaryError::Validation(format!(
                    "table '{}' stores vectors of dimension {}, embedding model produces {}",
                    table_name, existing, dimension
                )));
            }
            table
        } else {
            info!(
                "Creating table '{}' with {} dimensions",
                table_name, dimension
            );
            connection
                .create_empty_table(table_name, create_schema(dimension))
                .execute()
                .await
                .map_err(|e| store_error("Failed to create table", e))?
        };

        Ok(Self { table, dimension })
    }

    /// Number of stored records
    #[inline]
    pub async fn count(&self) -> Result<usize> {
        self.table
            .count_rows(None)
            .await
            .map_err(|e| store_error("Failed to count rows", e))
    }

    async fn delete_ids(&self, ids: &[String]) -> Result<()> {
        for batch in ids.chunks(MAX_BATCH_SIZE) {
            let predicate = format!(
                "id IN ({})",
                batch
                    .iter()
                    .map(|id| quote(id))
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            self.table
                .delete(&predicate)
                .await
                .map_err(|e| store_error("Failed to delete records", e))?;
            debug!("Deleted batch of {} ids", batch.len());
        }
        Ok(())
    }

    fn create_record_batch(&self, records: &[VectorRecord]) -> Result<RecordBatch> {
        let len = records.len();
        let mut flat_values = Vec::with_capacity(len * self.dimension);
        for record in records {
            flat_values.extend_from_slice(&record.values);
        }

        let field = Arc::new(Field::new("item", DataType::Float32, false));
        let vector_array = FixedSizeListArray::try_new(
            field,
            self.dimension as i32,
            Arc::new(Float32Array::from(flat_values)),
            None,
        )
        .map_err(|e| store_error("Failed to create vector array", e))?;

        let arrays: Vec<Arc<dyn Array>> = vec![
            Arc::new(StringArray::from_iter_values(
                records.iter().map(|r| r.id.as_str()),
            )),
            Arc::new(vector_array),
            Arc::new(StringArray::from_iter_values(
                records.iter().map(|r| r.metadata.text.as_str()),
            )),
            Arc::new(StringArray::from_iter_values(
                records.iter().map(|r| r.metadata.source.as_str()),
            )),
            Arc::new(UInt32Array::from_iter_values(
                records.iter().map(|r| r.metadata.chunk_index),
            )),
            Arc::new(UInt32Array::from_iter_values(
                records.iter().map(|r| r.metadata.total_chunks),
            )),
        ];

        RecordBatch::try_new(create_schema(self.dimension), arrays)
            .map_err(|e| store_error("Failed to create record batch", e))
    }
}

#[async_trait]
impl VectorStore for LanceStore {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn upsert(&self, records: &[VectorRecord]) -> Result<()> {
        for record in records {
            check_dimension(self.dimension, record.values.len(), &record.id)?;
        }

        for batch in records.chunks(MAX_BATCH_SIZE) {
            let ids: Vec<String> = batch.iter().map(|r| r.id.clone()).collect();
            self.delete_ids(&ids).await?;

            let record_batch = self.create_record_batch(batch)?;
            let schema = record_batch.schema();
            let reader = RecordBatchIterator::new(std::iter::once(Ok(record_batch)), schema);
            self.table
                .add(reader)
                .execute()
                .await
                .map_err(|e| store_error("Failed to insert records", e))?;
            debug!("Upserted batch of {} records", batch.len());
        }
        Ok(())
    }

    async fn query_by_source(&self, source: &str, limit: usize) -> Result<Vec<ScoredMatch>> {
        let stream = self
            .table
            .query()
            .only_if(format!("source = {}", quote(source)))
            .limit(limit)
            .execute()
            .await
            .map_err(|e| store_error("Failed to query by source", e))?;

        collect_matches(stream, true).await
    }

    async fn delete_many(&self, ids: &[String]) -> Result<()> {
        self.delete_ids(ids).await
    }

    async fn query_similar(
        &self,
        vector: &[f32],
        top_k: usize,
        include_metadata: bool,
    ) -> Result<Vec<ScoredMatch>> {
        check_dimension(self.dimension, vector.len(), "query")?;

        let stream = self
            .table
            .vector_search(vector)
            .map_err(|e| store_error("Failed to create vector search", e))?
            .column("vector")
            .distance_type(DistanceType::Cosine)
            .limit(top_k)
            .execute()
            .await
            .map_err(|e| store_error("Failed to execute search", e))?;

        let mut matches = collect_matches(stream, include_metadata).await?;
        matches.sort_by(|a, b| b.score.total_cmp(&a.score));
        matches.truncate(top_k);
        Ok(matches)
    }
}

fn create_schema(dimension: usize) -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("id", DataType::Utf8, false),
        Field::new(
            "vector",
            DataType::FixedSizeList(
                Arc::new(Field::new("item", DataType::Float32, false)),
                dimension as i32,
            ),
            false,
        ),
        Field::new("text", DataType::Utf8, false),
        Field::new("source", DataType::Utf8, false),
        Field::new("chunk_index", DataType::UInt32, false),
        Field::new("total_chunks", DataType::UInt32, false),
    ]))
}

async fn existing_dimension(table: &Table) -> Result<usize> {
    let schema = table
        .schema()
        .await
        .map_err(|e| store_error("Failed to get table schema", e))?;

    schema
        .field_with_name("vector")
        .ok()
        .and_then(|field| match field.data_type() {
            DataType::FixedSizeList(_, size) => usize::try_from(*size).ok(),
            _ => None,
        })
        .ok_or_else(|| {
            BreviaryError::VectorStore(
                "Could not find vector column or determine dimension".to_string(),
            )
        })
}

async fn collect_matches(
    mut stream: lancedb::arrow::SendableRecordBatchStream,
    include_metadata: bool,
) -> Result<Vec<ScoredMatch>> {
    let mut matches = Vec::new();
    while let Some(batch) = stream
        .try_next()
        .await
        .map_err(|e| store_error("Failed to read result stream", e))?
    {
        matches.extend(parse_batch(&batch, include_metadata)?);
    }
    Ok(matches)
}

fn parse_batch(batch: &RecordBatch, include_metadata: bool) -> Result<Vec<ScoredMatch>> {
    let ids = column::<StringArray>(batch, "id")?;
    let texts = column::<StringArray>(batch, "text")?;
    let sources = column::<StringArray>(batch, "source")?;
    let chunk_indices = column::<UInt32Array>(batch, "chunk_index")?;
    let totals = column::<UInt32Array>(batch, "total_chunks")?;

    // Plain scans carry no distance column
    let distances = batch
        .column_by_name("_distance")
        .and_then(|col| col.as_any().downcast_ref::<Float32Array>());

    Ok((0..batch.num_rows())
        .map(|row| {
            let distance = distances.map_or(1.0, |d| if d.is_null(row) { 1.0 } else { d.value(row) });
            ScoredMatch {
                id: ids.value(row).to_string(),
                score: 1.0 - distance,
                metadata: include_metadata.then(|| RecordMetadata {
                    text: texts.value(row).to_string(),
                    source: sources.value(row).to_string(),
                    chunk_index: chunk_indices.value(row),
                    total_chunks: totals.value(row),
                }),
            }
        })
        .collect())
}

fn column<'a, T: 'static>(batch: &'a RecordBatch, name: &str) -> Result<&'a T> {
    batch
        .column_by_name(name)
        .ok_or_else(|| BreviaryError::VectorStore(format!("Missing {} column", name)))?
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| BreviaryError::VectorStore(format!("Invalid {} column type", name)))
}

/// SQL string literal with embedded quotes doubled
fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn store_error(context: &str, e: impl std::fmt::Display) -> BreviaryError {
    BreviaryError::VectorStore(format!("{}: {}", context, e))
}
