use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

use super::{cosine_distance, VectorStore};
use crate::error::{AppError, AppResult};
use crate::models::{VectorCollection, VectorQueryResult, VectorRecord};

/// `episodic`/`semantic` rows are restricted by row-level security to
/// `metadata->>'user_id' = current_setting('app.current_user_id', true)`;
/// `stoic_wisdom`/`psychoanalysis` are world-readable. As with the relational
/// store, setting `app.current_user_id` per session is the caller's
/// responsibility — this store does not authenticate callers.
const MIGRATION: &str = r#"
CREATE TABLE IF NOT EXISTS vector_records (
    collection TEXT NOT NULL,
    id TEXT NOT NULL,
    document TEXT NOT NULL,
    embedding JSONB NOT NULL,
    metadata JSONB NOT NULL DEFAULT '{}'::jsonb,
    PRIMARY KEY (collection, id)
);
CREATE INDEX IF NOT EXISTS idx_vector_records_collection ON vector_records(collection);

ALTER TABLE vector_records ENABLE ROW LEVEL SECURITY;

DROP POLICY IF EXISTS vector_records_user_scoped ON vector_records;
CREATE POLICY vector_records_user_scoped ON vector_records
    USING (
        collection IN ('stoic_wisdom', 'psychoanalysis')
        OR metadata->>'user_id' = current_setting('app.current_user_id', true)
    );
"#;

pub struct PostgresVectorStore {
    pool: PgPool,
}

impl PostgresVectorStore {
    pub async fn connect(database_url: &str) -> AppResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(16)
            .test_before_acquire(true)
            .connect(database_url)
            .await
            .map_err(AppError::from)?;
        sqlx::query(MIGRATION).execute(&pool).await?;
        Ok(Self { pool })
    }
}

fn matches_where(metadata: &HashMap<String, String>, where_: &HashMap<String, String>) -> bool {
    where_.iter().all(|(k, v)| metadata.get(k) == Some(v))
}

#[async_trait]
impl VectorStore for PostgresVectorStore {
    async fn add(&self, collection: VectorCollection, records: Vec<VectorRecord>) -> AppResult<()> {
        let mut tx = self.pool.begin().await?;
        for record in records {
            let embedding = serde_json::to_value(&record.embedding)?;
            let metadata = serde_json::to_value(&record.metadata)?;
            sqlx::query(
                r#"INSERT INTO vector_records (collection, id, document, embedding, metadata)
                   VALUES ($1, $2, $3, $4, $5)
                   ON CONFLICT (collection, id) DO UPDATE SET
                       document = excluded.document,
                       embedding = excluded.embedding,
                       metadata = excluded.metadata"#,
            )
            .bind(collection.as_str())
            .bind(&record.id)
            .bind(&record.document)
            .bind(embedding)
            .bind(metadata)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn query(
        &self,
        collection: VectorCollection,
        query_embedding: &[f32],
        n: usize,
        where_: &HashMap<String, String>,
    ) -> AppResult<VectorQueryResult> {
        // No pgvector-specific index dependency is introduced by this
        // transform (see DESIGN.md); this mirrors the sqlite backend's
        // brute-force scan, which the server backend would replace with a
        // native IVFFlat-equivalent index if the extension were available.
        let rows = sqlx::query("SELECT id, document, embedding, metadata FROM vector_records WHERE collection = $1")
            .bind(collection.as_str())
            .fetch_all(&self.pool)
            .await?;

        let mut scored: Vec<(f32, String, String, HashMap<String, String>)> = Vec::with_capacity(rows.len());
        for row in rows {
            let metadata_value: serde_json::Value = row.try_get("metadata").map_err(AppError::from)?;
            let metadata: HashMap<String, String> = serde_json::from_value(metadata_value)?;
            if !matches_where(&metadata, where_) {
                continue;
            }
            let embedding_value: serde_json::Value = row.try_get("embedding").map_err(AppError::from)?;
            let embedding: Vec<f32> = serde_json::from_value(embedding_value)?;
            let distance = cosine_distance(query_embedding, &embedding);
            scored.push((
                distance,
                row.try_get("id").map_err(AppError::from)?,
                row.try_get("document").map_err(AppError::from)?,
                metadata,
            ));
        }

        scored.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(n);

        let mut out = VectorQueryResult::default();
        for (distance, id, document, metadata) in scored {
            out.distances.push(distance);
            out.ids.push(id);
            out.documents.push(document);
            out.metadatas.push(metadata);
        }
        Ok(out)
    }

    async fn get(
        &self,
        collection: VectorCollection,
        ids: Option<&[String]>,
        where_: Option<&HashMap<String, String>>,
        limit: Option<usize>,
    ) -> AppResult<Vec<VectorRecord>> {
        let rows = sqlx::query("SELECT id, document, embedding, metadata FROM vector_records WHERE collection = $1")
            .bind(collection.as_str())
            .fetch_all(&self.pool)
            .await?;

        let mut out = Vec::new();
        for row in rows {
            let id: String = row.try_get("id").map_err(AppError::from)?;
            let metadata_value: serde_json::Value = row.try_get("metadata").map_err(AppError::from)?;
            let metadata: HashMap<String, String> = serde_json::from_value(metadata_value)?;

            let matches = if let Some(ids) = ids {
                ids.iter().any(|i| i == &id)
            } else if let Some(where_) = where_ {
                matches_where(&metadata, where_)
            } else {
                true
            };
            if !matches {
                continue;
            }

            let embedding_value: serde_json::Value = row.try_get("embedding").map_err(AppError::from)?;
            out.push(VectorRecord {
                id,
                document: row.try_get("document").map_err(AppError::from)?,
                embedding: serde_json::from_value(embedding_value)?,
                metadata,
            });
            if limit.is_some_and(|limit| out.len() >= limit) {
                break;
            }
        }
        Ok(out)
    }

    async fn delete(
        &self,
        collection: VectorCollection,
        ids: Option<&[String]>,
        where_: Option<&HashMap<String, String>>,
    ) -> AppResult<()> {
        let target_ids: Vec<String> = if let Some(ids) = ids {
            ids.to_vec()
        } else if let Some(where_) = where_ {
            let rows = sqlx::query("SELECT id, metadata FROM vector_records WHERE collection = $1")
                .bind(collection.as_str())
                .fetch_all(&self.pool)
                .await?;
            let mut matched = Vec::new();
            for row in rows {
                let metadata_value: serde_json::Value = row.try_get("metadata").map_err(AppError::from)?;
                let metadata: HashMap<String, String> = serde_json::from_value(metadata_value)?;
                if matches_where(&metadata, where_) {
                    matched.push(row.try_get("id").map_err(AppError::from)?);
                }
            }
            matched
        } else {
            sqlx::query("DELETE FROM vector_records WHERE collection = $1")
                .bind(collection.as_str())
                .execute(&self.pool)
                .await?;
            return Ok(());
        };

        if target_ids.is_empty() {
            return Ok(());
        }

        let placeholders = (1..=target_ids.len())
            .map(|i| format!("${}", i + 1))
            .collect::<Vec<_>>()
            .join(",");
        let sql = format!("DELETE FROM vector_records WHERE collection = $1 AND id IN ({placeholders})");
        let mut query = sqlx::query(&sql).bind(collection.as_str());
        for id in &target_ids {
            query = query.bind(id);
        }
        query.execute(&self.pool).await?;
        Ok(())
    }

    async fn count(&self, collection: VectorCollection) -> AppResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM vector_records WHERE collection = $1")
            .bind(collection.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}
