use std::collections::HashMap;
use std::str::FromStr;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

use super::{cosine_distance, VectorStore};
use crate::error::{AppError, AppResult};
use crate::models::{VectorCollection, VectorQueryResult, VectorRecord};

const MIGRATION: &str = r#"
CREATE TABLE IF NOT EXISTS vector_records (
    collection TEXT NOT NULL,
    id TEXT NOT NULL,
    document TEXT NOT NULL,
    embedding TEXT NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{}',
    PRIMARY KEY (collection, id)
);
CREATE INDEX IF NOT EXISTS idx_vector_records_collection ON vector_records(collection);
"#;

/// Brute-force over a materialized blob: every record's embedding is stored
/// as a JSON array and scanned in full on query, matching the sqlite path of
/// `vector_store.py` exactly (no native vector index available here).
pub struct SqliteVectorStore {
    pool: SqlitePool,
}

impl SqliteVectorStore {
    pub async fn connect(database_url: &str) -> AppResult<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| AppError::Config(format!("invalid sqlite url: {e}")))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
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
impl VectorStore for SqliteVectorStore {
    async fn add(&self, collection: VectorCollection, records: Vec<VectorRecord>) -> AppResult<()> {
        let mut tx = self.pool.begin().await?;
        for record in records {
            let embedding = serde_json::to_string(&record.embedding)?;
            let metadata = serde_json::to_string(&record.metadata)?;
            sqlx::query(
                r#"INSERT INTO vector_records (collection, id, document, embedding, metadata)
                   VALUES (?, ?, ?, ?, ?)
                   ON CONFLICT(collection, id) DO UPDATE SET
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
        let rows = sqlx::query("SELECT id, document, embedding, metadata FROM vector_records WHERE collection = ?")
            .bind(collection.as_str())
            .fetch_all(&self.pool)
            .await?;

        let mut scored: Vec<(f32, String, String, HashMap<String, String>)> = Vec::with_capacity(rows.len());
        for row in rows {
            let metadata_json: String = row.try_get("metadata").map_err(AppError::from)?;
            let metadata: HashMap<String, String> = serde_json::from_str(&metadata_json)?;
            if !matches_where(&metadata, where_) {
                continue;
            }
            let embedding_json: String = row.try_get("embedding").map_err(AppError::from)?;
            let embedding: Vec<f32> = serde_json::from_str(&embedding_json)?;
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
        let rows = sqlx::query("SELECT id, document, embedding, metadata FROM vector_records WHERE collection = ?")
            .bind(collection.as_str())
            .fetch_all(&self.pool)
            .await?;

        let mut out = Vec::new();
        for row in rows {
            let id: String = row.try_get("id").map_err(AppError::from)?;
            let metadata_json: String = row.try_get("metadata").map_err(AppError::from)?;
            let metadata: HashMap<String, String> = serde_json::from_str(&metadata_json)?;

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

            let embedding_json: String = row.try_get("embedding").map_err(AppError::from)?;
            out.push(VectorRecord {
                id,
                document: row.try_get("document").map_err(AppError::from)?,
                embedding: serde_json::from_str(&embedding_json)?,
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
            let rows = sqlx::query("SELECT id, metadata FROM vector_records WHERE collection = ?")
                .bind(collection.as_str())
                .fetch_all(&self.pool)
                .await?;
            let mut matched = Vec::new();
            for row in rows {
                let metadata_json: String = row.try_get("metadata").map_err(AppError::from)?;
                let metadata: HashMap<String, String> = serde_json::from_str(&metadata_json)?;
                if matches_where(&metadata, where_) {
                    matched.push(row.try_get("id").map_err(AppError::from)?);
                }
            }
            matched
        } else {
            sqlx::query("DELETE FROM vector_records WHERE collection = ?")
                .bind(collection.as_str())
                .execute(&self.pool)
                .await?;
            return Ok(());
        };

        if target_ids.is_empty() {
            return Ok(());
        }

        let placeholders = vec!["?"; target_ids.len()].join(",");
        let sql = format!("DELETE FROM vector_records WHERE collection = ? AND id IN ({placeholders})");
        let mut query = sqlx::query(&sql).bind(collection.as_str());
        for id in &target_ids {
            query = query.bind(id);
        }
        query.execute(&self.pool).await?;
        Ok(())
    }

    async fn count(&self, collection: VectorCollection) -> AppResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM vector_records WHERE collection = ?")
            .bind(collection.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> SqliteVectorStore {
        SqliteVectorStore::connect("sqlite::memory:").await.unwrap()
    }

    fn record(id: &str, doc: &str, embedding: Vec<f32>) -> VectorRecord {
        VectorRecord {
            id: id.to_string(),
            document: doc.to_string(),
            embedding,
            metadata: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn add_then_get_returns_exact_record() {
        let store = store().await;
        store
            .add(VectorCollection::Episodic, vec![record("a", "hello", vec![1.0, 0.0])])
            .await
            .unwrap();
        let got = store
            .get(VectorCollection::Episodic, Some(&["a".to_string()]), None, None)
            .await
            .unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].document, "hello");
        assert_eq!(got[0].embedding, vec![1.0, 0.0]);
    }

    #[tokio::test]
    async fn add_add_same_id_upserts() {
        let store = store().await;
        store
            .add(VectorCollection::Episodic, vec![record("a", "doc1", vec![1.0, 0.0])])
            .await
            .unwrap();
        store
            .add(VectorCollection::Episodic, vec![record("a", "doc2", vec![0.0, 1.0])])
            .await
            .unwrap();
        let got = store
            .get(VectorCollection::Episodic, Some(&["a".to_string()]), None, None)
            .await
            .unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].document, "doc2");
        assert_eq!(got[0].embedding, vec![0.0, 1.0]);
        assert_eq!(store.count(VectorCollection::Episodic).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn query_sorts_ascending_by_distance() {
        let store = store().await;
        store
            .add(
                VectorCollection::Semantic,
                vec![
                    record("near", "near doc", vec![1.0, 0.0]),
                    record("far", "far doc", vec![0.0, 1.0]),
                ],
            )
            .await
            .unwrap();
        let result = store
            .query(VectorCollection::Semantic, &[1.0, 0.0], 2, &HashMap::new())
            .await
            .unwrap();
        assert_eq!(result.ids[0], "near");
        assert_eq!(result.ids[1], "far");
        assert!(result.distances[0] <= result.distances[1]);
    }

    #[tokio::test]
    async fn get_with_where_filters_by_metadata() {
        let store = store().await;
        let mut alice = record("a", "alice doc", vec![1.0, 0.0]);
        alice.metadata.insert("user_id".to_string(), "alice".to_string());
        let mut bob = record("b", "bob doc", vec![0.0, 1.0]);
        bob.metadata.insert("user_id".to_string(), "bob".to_string());
        store.add(VectorCollection::Episodic, vec![alice, bob]).await.unwrap();

        let where_ = HashMap::from([("user_id".to_string(), "alice".to_string())]);
        let got = store.get(VectorCollection::Episodic, None, Some(&where_), None).await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].id, "a");
    }

    #[tokio::test]
    async fn get_with_no_filter_returns_everything_up_to_limit() {
        let store = store().await;
        store
            .add(
                VectorCollection::Episodic,
                vec![
                    record("a", "doc a", vec![1.0, 0.0]),
                    record("b", "doc b", vec![0.0, 1.0]),
                    record("c", "doc c", vec![1.0, 1.0]),
                ],
            )
            .await
            .unwrap();
        let got = store.get(VectorCollection::Episodic, None, None, Some(2)).await.unwrap();
        assert_eq!(got.len(), 2);
    }

    #[tokio::test]
    async fn delete_by_ids_removes_only_those_records() {
        let store = store().await;
        store
            .add(
                VectorCollection::Episodic,
                vec![record("a", "doc a", vec![1.0, 0.0]), record("b", "doc b", vec![0.0, 1.0])],
            )
            .await
            .unwrap();
        store
            .delete(VectorCollection::Episodic, Some(&["a".to_string()]), None)
            .await
            .unwrap();
        assert_eq!(store.count(VectorCollection::Episodic).await.unwrap(), 1);
        let remaining = store.get(VectorCollection::Episodic, None, None, None).await.unwrap();
        assert_eq!(remaining[0].id, "b");
    }

    #[tokio::test]
    async fn delete_with_no_filter_clears_the_collection() {
        let store = store().await;
        store
            .add(VectorCollection::Episodic, vec![record("a", "doc a", vec![1.0, 0.0])])
            .await
            .unwrap();
        store.delete(VectorCollection::Episodic, None, None).await.unwrap();
        assert_eq!(store.count(VectorCollection::Episodic).await.unwrap(), 0);
    }
}
