//! Vector storage using LanceDB for semantic search

use std::sync::Arc;

use arrow_array::{Array, FixedSizeListArray, Float32Array, RecordBatch, RecordBatchIterator, StringArray};
use arrow_schema::{DataType, Field, Schema};
use futures::TryStreamExt;
use lance_arrow::FixedSizeListArrayExt;
use lancedb::connect;
use lancedb::query::{ExecutableQuery, QueryBase};
use lancedb::DistanceType;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::memory::{ContentType, Tier};

/// Vector storage backend using LanceDB
pub struct VectorStorage {
    db: lancedb::Connection,
    dimensions: usize,
    table_name: String,
}

/// One nearest-neighbour hit
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub id: String,
    /// Cosine similarity, 1.0 for identical direction
    pub similarity: f32,
}

fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

impl VectorStorage {
    /// Open the index. Each embedding width gets its own table, so switching
    /// embedders never mixes vector spaces.
    pub async fn new(config: &Config, dimensions: usize) -> Result<Self> {
        let path = config.vector_db_path();
        let uri = path
            .to_str()
            .ok_or_else(|| Error::vector_db(format!("Non UTF-8 path: {}", path.display())))?;

        let db = connect(uri)
            .execute()
            .await
            .map_err(|e| Error::vector_db(e.to_string()))?;

        let storage = Self {
            db,
            dimensions,
            table_name: format!("items_{}", dimensions),
        };

        storage.ensure_table().await?;

        Ok(storage)
    }

    fn schema(&self) -> Schema {
        Schema::new(vec![
            Field::new("id", DataType::Utf8, false),
            Field::new("tier", DataType::Utf8, false),
            Field::new("item_type", DataType::Utf8, false),
            Field::new(
                "vector",
                DataType::FixedSizeList(
                    Arc::new(Field::new("item", DataType::Float32, true)),
                    self.dimensions as i32,
                ),
                false,
            ),
        ])
    }

    async fn ensure_table(&self) -> Result<()> {
        let tables = self
            .db
            .table_names()
            .execute()
            .await
            .map_err(|e| Error::vector_db(e.to_string()))?;

        if !tables.contains(&self.table_name) {
            let schema = Arc::new(self.schema());
            let empty_batch = RecordBatch::new_empty(schema.clone());
            let reader = RecordBatchIterator::new(vec![empty_batch].into_iter().map(Ok), schema);

            self.db
                .create_table(&self.table_name, Box::new(reader))
                .execute()
                .await
                .map_err(|e| Error::vector_db(e.to_string()))?;
        }

        Ok(())
    }

    async fn table(&self) -> Result<lancedb::Table> {
        self.db
            .open_table(&self.table_name)
            .execute()
            .await
            .map_err(|e| Error::vector_db(e.to_string()))
    }

    /// Insert or replace the vector for an item
    pub async fn upsert(
        &self,
        id: &str,
        tier: Tier,
        item_type: ContentType,
        embedding: &[f32],
    ) -> Result<()> {
        if embedding.len() != self.dimensions {
            return Err(Error::vector_db(format!(
                "Embedding dimension mismatch: expected {}, got {}",
                self.dimensions,
                embedding.len()
            )));
        }

        self.delete(id).await?;

        let values = Float32Array::from(embedding.to_vec());
        let vector_array = FixedSizeListArray::try_new_from_values(values, self.dimensions as i32)
            .map_err(|e: arrow_schema::ArrowError| Error::vector_db(e.to_string()))?;

        let schema = Arc::new(self.schema());
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(StringArray::from(vec![id.to_string()])) as Arc<dyn Array>,
                Arc::new(StringArray::from(vec![tier.to_string()])),
                Arc::new(StringArray::from(vec![item_type.to_string()])),
                Arc::new(vector_array),
            ],
        )
        .map_err(|e| Error::vector_db(e.to_string()))?;

        let reader = RecordBatchIterator::new(vec![batch].into_iter().map(Ok), schema);

        self.table()
            .await?
            .add(Box::new(reader))
            .execute()
            .await
            .map_err(|e| Error::vector_db(e.to_string()))?;

        Ok(())
    }

    /// Delete the vector for an item
    pub async fn delete(&self, id: &str) -> Result<()> {
        self.table()
            .await?
            .delete(&format!("id = {}", quote(id)))
            .await
            .map_err(|e| Error::vector_db(e.to_string()))?;
        Ok(())
    }

    /// Nearest neighbours by cosine similarity, best first
    pub async fn search(
        &self,
        query_embedding: &[f32],
        limit: usize,
        tier: Option<Tier>,
        item_type: Option<ContentType>,
    ) -> Result<Vec<VectorHit>> {
        let table = self.table().await?;

        let mut query = table
            .vector_search(query_embedding.to_vec())
            .map_err(|e: lancedb::Error| Error::vector_db(e.to_string()))?
            .distance_type(DistanceType::Cosine)
            .limit(limit);

        let mut filters = Vec::new();
        if let Some(tier) = tier {
            filters.push(format!("tier = {}", quote(tier.as_str())));
        }
        if let Some(item_type) = item_type {
            filters.push(format!("item_type = {}", quote(item_type.as_str())));
        }
        if !filters.is_empty() {
            query = query.only_if(filters.join(" AND "));
        }

        let batches: Vec<RecordBatch> = query
            .execute()
            .await
            .map_err(|e: lancedb::Error| Error::vector_db(e.to_string()))?
            .try_collect::<Vec<RecordBatch>>()
            .await
            .map_err(|e: lancedb::Error| Error::vector_db(e.to_string()))?;

        let mut hits = Vec::new();

        for batch in batches {
            let ids = batch
                .column_by_name("id")
                .and_then(|col| col.as_any().downcast_ref::<StringArray>())
                .ok_or_else(|| Error::vector_db("Missing or mistyped id column"))?;
            let distances = batch
                .column_by_name("_distance")
                .and_then(|col| col.as_any().downcast_ref::<Float32Array>())
                .ok_or_else(|| Error::vector_db("Missing or mistyped _distance column"))?;

            for i in 0..batch.num_rows() {
                let distance = distances.value(i);
                if !distance.is_finite() {
                    continue;
                }
                // Cosine distance is 1 - cos(theta)
                let similarity = (1.0 - distance).clamp(0.0, 1.0);
                hits.push(VectorHit {
                    id: ids.value(i).to_string(),
                    similarity,
                });
            }
        }

        hits.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(hits)
    }
}
