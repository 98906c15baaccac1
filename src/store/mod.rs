//! The relational store: a single [`RelationalStore`] trait implemented by
//! two concrete backends (embedded sqlite, server-based postgres), selected
//! at construction time by the database URL's scheme. Call sites never
//! branch on backend.

mod postgres;
mod sqlite;

pub use postgres::PostgresStore;
pub use sqlite::SqliteStore;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{AppError, AppResult};
use crate::models::{
    CondensedSummary, ConsensusResult, Message, Profile, SemanticInsight, Session, SessionWithCount, User,
};

#[async_trait]
pub trait RelationalStore: Send + Sync {
    async fn get_or_create_user(&self, user_id: &str) -> AppResult<User>;
    async fn get_user(&self, user_id: &str) -> AppResult<Option<User>>;
    async fn update_user_name(&self, user_id: &str, name: &str) -> AppResult<()>;

    async fn create_session(&self, session: &Session) -> AppResult<()>;
    async fn get_session(&self, session_id: &str) -> AppResult<Option<Session>>;
    async fn latest_session(&self, user_id: &str) -> AppResult<Option<Session>>;
    async fn list_sessions(&self, user_id: &str) -> AppResult<Vec<SessionWithCount>>;

    async fn save_message(&self, message: &Message) -> AppResult<()>;
    async fn list_messages_by_session(&self, session_id: &str) -> AppResult<Vec<Message>>;
    async fn list_messages_in_range(
        &self,
        user_id: &str,
        start: Option<DateTime<Utc>>,
        end: DateTime<Utc>,
    ) -> AppResult<Vec<Message>>;
    async fn recent_messages(&self, user_id: &str, n: u32) -> AppResult<Vec<Message>>;
    async fn list_unprocessed_messages(&self, user_id: &str) -> AppResult<Vec<Message>>;
    async fn mark_message_processed(&self, message_id: &str) -> AppResult<()>;

    async fn save_insight(&self, insight: &SemanticInsight) -> AppResult<()>;
    async fn list_user_insights(&self, user_id: &str) -> AppResult<Vec<SemanticInsight>>;

    /// Assigns the next monotonic version server-side (MAX(version)+1, or 1).
    async fn save_profile(
        &self,
        user_id: &str,
        body: &str,
        consensus_log: Option<&ConsensusResult>,
    ) -> AppResult<Profile>;
    async fn latest_profile(&self, user_id: &str) -> AppResult<Option<Profile>>;

    async fn save_summary(&self, summary: &CondensedSummary) -> AppResult<()>;
    async fn list_summaries(&self, user_id: &str, level: Option<i64>) -> AppResult<Vec<CondensedSummary>>;

    /// All sessions if no profile exists yet, else sessions created strictly
    /// after the latest profile's timestamp.
    async fn count_sessions_since_last_profile(&self, user_id: &str) -> AppResult<i64>;
}

/// Dispatches on URL scheme: `sqlite://...` -> embedded single-file backend,
/// `postgres://...`/`postgresql://...` -> server backend. The same URL also
/// drives the vector store backend (see `vector_store::connect`).
pub async fn connect(database_url: &str) -> AppResult<Arc<dyn RelationalStore>> {
    let scheme = url::Url::parse(database_url)
        .map_err(|e| AppError::Config(format!("invalid database url: {e}")))?
        .scheme()
        .to_string();

    match scheme.as_str() {
        "sqlite" => Ok(Arc::new(SqliteStore::connect(database_url).await?)),
        "postgres" | "postgresql" => Ok(Arc::new(PostgresStore::connect(database_url).await?)),
        other => Err(AppError::Config(format!("unsupported database scheme: {other}"))),
    }
}
