//! The vector store: four fixed collections, cosine-distance search, upsert
//! semantics, backend chosen by the same database URL that selects the
//! relational backend. Grounded on `vector_store.py`; no teacher file
//! implements a vector store directly.

mod postgres;
mod sqlite;

pub use postgres::PostgresVectorStore;
pub use sqlite::SqliteVectorStore;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{AppError, AppResult};
use crate::llm::LlmClient;
use crate::models::{VectorCollection, VectorQueryResult, VectorRecord};

#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Upserts by id: an `add` call reusing an existing id within the same
    /// collection replaces that record's document/metadata/embedding.
    async fn add(
        &self,
        collection: VectorCollection,
        records: Vec<VectorRecord>,
    ) -> AppResult<()>;

    /// `where_` is a conjunction of metadata equality predicates. Results are
    /// sorted ascending by cosine distance.
    async fn query(
        &self,
        collection: VectorCollection,
        query_embedding: &[f32],
        n: usize,
        where_: &HashMap<String, String>,
    ) -> AppResult<VectorQueryResult>;

    /// Looks up records by id, by a metadata `where_` conjunction, or (if
    /// both are absent) every record in the collection. `ids` takes priority
    /// over `where_` when both are given. `limit` caps the number returned.
    async fn get(
        &self,
        collection: VectorCollection,
        ids: Option<&[String]>,
        where_: Option<&HashMap<String, String>>,
        limit: Option<usize>,
    ) -> AppResult<Vec<VectorRecord>>;

    /// Deletes by id, by a metadata `where_` conjunction, or (if both are
    /// absent) the entire collection. `ids` takes priority over `where_`.
    async fn delete(
        &self,
        collection: VectorCollection,
        ids: Option<&[String]>,
        where_: Option<&HashMap<String, String>>,
    ) -> AppResult<()>;

    async fn count(&self, collection: VectorCollection) -> AppResult<i64>;
}

/// cosine distance = 1 - (a . b) / (||a|| * ||b||). A zero-norm vector is
/// treated as maximally distant (distance 1.0) rather than producing NaN.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 1.0;
    }
    1.0 - dot / (norm_a * norm_b)
}

pub async fn connect(database_url: &str) -> AppResult<Arc<dyn VectorStore>> {
    let scheme = url::Url::parse(database_url)
        .map_err(|e| AppError::Config(format!("invalid database url: {e}")))?
        .scheme()
        .to_string();

    match scheme.as_str() {
        "sqlite" => Ok(Arc::new(SqliteVectorStore::connect(database_url).await?)),
        "postgres" | "postgresql" => Ok(Arc::new(PostgresVectorStore::connect(database_url).await?)),
        other => Err(AppError::Config(format!("unsupported database scheme: {other}"))),
    }
}

/// Embeds `texts` that arrive without precomputed embeddings via the LLM
/// client's `embed`, used by both backends' `add` when embeddings are absent.
pub async fn embed_missing(
    llm: &LlmClient,
    embedding_model: &str,
    mut records: Vec<VectorRecord>,
) -> AppResult<Vec<VectorRecord>> {
    for record in records.iter_mut() {
        if record.embedding.is_empty() {
            record.embedding = llm.embed(&record.document, embedding_model).await?;
        }
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_vectors_have_zero_distance() {
        let a = vec![1.0, 2.0, 3.0];
        assert!(cosine_distance(&a, &a) < 1e-6);
    }

    #[test]
    fn orthogonal_vectors_have_unit_distance() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        assert!((cosine_distance(&a, &b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn zero_vector_is_maximally_distant() {
        let a = vec![0.0, 0.0];
        let b = vec![1.0, 1.0];
        assert_eq!(cosine_distance(&a, &b), 1.0);
    }
}
