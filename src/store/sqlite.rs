use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;

use super::RelationalStore;
use crate::error::{AppError, AppResult};
use crate::models::{
    CondensedSummary, ConsensusResult, Message, MessageRole, Profile, PsychUpdate, SemanticInsight, Session,
    SessionWithCount, User,
};

const SCHEMA_VERSION: i64 = 1;

const MIGRATION_V1: &str = r#"
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS users (
    id TEXT PRIMARY KEY,
    name TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL REFERENCES users(id),
    created_at TEXT NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{}'
);

CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL REFERENCES sessions(id),
    role TEXT NOT NULL,
    body TEXT NOT NULL,
    psych_update TEXT,
    created_at TEXT NOT NULL,
    semantic_processed_at TEXT
);

CREATE TABLE IF NOT EXISTS semantic_insights (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL REFERENCES users(id),
    source_message_id TEXT NOT NULL REFERENCES messages(id),
    assertion TEXT NOT NULL,
    confidence REAL NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS profiles (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL REFERENCES users(id),
    version INTEGER NOT NULL,
    body TEXT NOT NULL,
    consensus_log TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS condensed_summaries (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL REFERENCES users(id),
    level INTEGER NOT NULL,
    body TEXT NOT NULL,
    period_start TEXT NOT NULL,
    period_end TEXT NOT NULL,
    source_message_count INTEGER NOT NULL,
    source_word_count INTEGER NOT NULL,
    source_summary_ids TEXT NOT NULL DEFAULT '[]',
    consensus_log TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id);
CREATE INDEX IF NOT EXISTS idx_messages_semantic ON messages(semantic_processed_at);
CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(user_id);
CREATE INDEX IF NOT EXISTS idx_insights_user ON semantic_insights(user_id);
CREATE INDEX IF NOT EXISTS idx_summaries_user_level ON condensed_summaries(user_id, level);
"#;

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn connect(database_url: &str) -> AppResult<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| AppError::Config(format!("invalid sqlite url: {e}")))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .map_err(AppError::from)?;
        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> AppResult<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY, applied_at TEXT NOT NULL DEFAULT (datetime('now')))",
        )
        .execute(&self.pool)
        .await?;

        let current: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(version), 0) FROM schema_version")
            .fetch_one(&self.pool)
            .await?;

        if current < 1 {
            let mut tx = self.pool.begin().await?;
            sqlx::query(MIGRATION_V1).execute(&mut *tx).await?;
            sqlx::query("INSERT INTO schema_version (version) VALUES (1)")
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
        }
        let _ = SCHEMA_VERSION;
        Ok(())
    }
}

fn rfc3339(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn parse_rfc3339(s: &str) -> AppResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| AppError::internal(format!("corrupt timestamp in store: {e}")))
}

fn row_to_message(row: &sqlx::sqlite::SqliteRow) -> AppResult<Message> {
    let role_str: String = row.try_get("role").map_err(AppError::from)?;
    let role = MessageRole::from_str(&role_str)
        .ok_or_else(|| AppError::internal(format!("corrupt message role: {role_str}")))?;
    let psych_json: Option<String> = row.try_get("psych_update").map_err(AppError::from)?;
    let psych_update = psych_json
        .map(|j| serde_json::from_str::<PsychUpdate>(&j))
        .transpose()?;
    let semantic_at: Option<String> = row.try_get("semantic_processed_at").map_err(AppError::from)?;
    let created_at: String = row.try_get("created_at").map_err(AppError::from)?;

    Ok(Message {
        id: row.try_get("id").map_err(AppError::from)?,
        session_id: row.try_get("session_id").map_err(AppError::from)?,
        role,
        body: row.try_get("body").map_err(AppError::from)?,
        created_at: parse_rfc3339(&created_at)?,
        psych_update,
        semantic_processed_at: semantic_at.map(|s| parse_rfc3339(&s)).transpose()?,
    })
}

fn row_to_summary(row: &sqlx::sqlite::SqliteRow) -> AppResult<CondensedSummary> {
    let period_start: String = row.try_get("period_start").map_err(AppError::from)?;
    let period_end: String = row.try_get("period_end").map_err(AppError::from)?;
    let created_at: String = row.try_get("created_at").map_err(AppError::from)?;
    let source_summary_ids: String = row.try_get("source_summary_ids").map_err(AppError::from)?;
    let consensus_log: Option<String> = row.try_get("consensus_log").map_err(AppError::from)?;

    Ok(CondensedSummary {
        id: row.try_get("id").map_err(AppError::from)?,
        user_id: row.try_get("user_id").map_err(AppError::from)?,
        level: row.try_get("level").map_err(AppError::from)?,
        body: row.try_get("body").map_err(AppError::from)?,
        period_start: parse_rfc3339(&period_start)?,
        period_end: parse_rfc3339(&period_end)?,
        source_message_count: row.try_get("source_message_count").map_err(AppError::from)?,
        source_word_count: row.try_get("source_word_count").map_err(AppError::from)?,
        source_summary_ids: serde_json::from_str(&source_summary_ids)?,
        consensus_log: consensus_log.map(|j| serde_json::from_str(&j)).transpose()?,
        created_at: parse_rfc3339(&created_at)?,
    })
}

#[async_trait]
impl RelationalStore for SqliteStore {
    async fn get_or_create_user(&self, user_id: &str) -> AppResult<User> {
        if let Some(user) = self.get_user(user_id).await? {
            return Ok(user);
        }
        let user = User::new(user_id);
        sqlx::query("INSERT INTO users (id, name, created_at) VALUES (?, ?, ?)")
            .bind(&user.id)
            .bind(&user.name)
            .bind(rfc3339(user.created_at))
            .execute(&self.pool)
            .await?;
        Ok(user)
    }

    async fn get_user(&self, user_id: &str) -> AppResult<Option<User>> {
        let row = sqlx::query("SELECT id, name, created_at FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let created_at: String = row.try_get("created_at").map_err(AppError::from)?;
                Ok(Some(User {
                    id: row.try_get("id").map_err(AppError::from)?,
                    name: row.try_get("name").map_err(AppError::from)?,
                    created_at: parse_rfc3339(&created_at)?,
                }))
            }
            None => Ok(None),
        }
    }

    async fn update_user_name(&self, user_id: &str, name: &str) -> AppResult<()> {
        let result = sqlx::query("UPDATE users SET name = ? WHERE id = ?")
            .bind(name)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("user {user_id} not found")));
        }
        Ok(())
    }

    async fn create_session(&self, session: &Session) -> AppResult<()> {
        let metadata = serde_json::to_string(&session.metadata)?;
        sqlx::query("INSERT INTO sessions (id, user_id, created_at, metadata) VALUES (?, ?, ?, ?)")
            .bind(&session.id)
            .bind(&session.user_id)
            .bind(rfc3339(session.created_at))
            .bind(metadata)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> AppResult<Option<Session>> {
        let row = sqlx::query("SELECT id, user_id, created_at, metadata FROM sessions WHERE id = ?")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let created_at: String = row.try_get("created_at").map_err(AppError::from)?;
                let metadata: String = row.try_get("metadata").map_err(AppError::from)?;
                Ok(Some(Session {
                    id: row.try_get("id").map_err(AppError::from)?,
                    user_id: row.try_get("user_id").map_err(AppError::from)?,
                    created_at: parse_rfc3339(&created_at)?,
                    metadata: serde_json::from_str(&metadata)?,
                }))
            }
            None => Ok(None),
        }
    }

    async fn latest_session(&self, user_id: &str) -> AppResult<Option<Session>> {
        let row = sqlx::query(
            "SELECT id, user_id, created_at, metadata FROM sessions WHERE user_id = ? ORDER BY created_at DESC LIMIT 1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => {
                let created_at: String = row.try_get("created_at").map_err(AppError::from)?;
                let metadata: String = row.try_get("metadata").map_err(AppError::from)?;
                Ok(Some(Session {
                    id: row.try_get("id").map_err(AppError::from)?,
                    user_id: row.try_get("user_id").map_err(AppError::from)?,
                    created_at: parse_rfc3339(&created_at)?,
                    metadata: serde_json::from_str(&metadata)?,
                }))
            }
            None => Ok(None),
        }
    }

    async fn list_sessions(&self, user_id: &str) -> AppResult<Vec<SessionWithCount>> {
        let rows = sqlx::query(
            r#"SELECT s.id, s.user_id, s.created_at, s.metadata, COUNT(m.id) as message_count
               FROM sessions s LEFT JOIN messages m ON m.session_id = s.id
               WHERE s.user_id = ?
               GROUP BY s.id
               ORDER BY s.created_at DESC"#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let created_at: String = row.try_get("created_at").map_err(AppError::from)?;
            let metadata: String = row.try_get("metadata").map_err(AppError::from)?;
            out.push(SessionWithCount {
                session: Session {
                    id: row.try_get("id").map_err(AppError::from)?,
                    user_id: row.try_get("user_id").map_err(AppError::from)?,
                    created_at: parse_rfc3339(&created_at)?,
                    metadata: serde_json::from_str(&metadata)?,
                },
                message_count: row.try_get("message_count").map_err(AppError::from)?,
            });
        }
        Ok(out)
    }

    async fn save_message(&self, message: &Message) -> AppResult<()> {
        let psych_json = message
            .psych_update
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let semantic_at = message.semantic_processed_at.map(rfc3339);
        sqlx::query(
            r#"INSERT INTO messages (id, session_id, role, body, psych_update, created_at, semantic_processed_at)
               VALUES (?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&message.id)
        .bind(&message.session_id)
        .bind(message.role.as_str())
        .bind(&message.body)
        .bind(psych_json)
        .bind(rfc3339(message.created_at))
        .bind(semantic_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_messages_by_session(&self, session_id: &str) -> AppResult<Vec<Message>> {
        let rows = sqlx::query(
            "SELECT id, session_id, role, body, psych_update, created_at, semantic_processed_at
             FROM messages WHERE session_id = ? ORDER BY created_at ASC, id ASC",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_message).collect()
    }

    async fn list_messages_in_range(
        &self,
        user_id: &str,
        start: Option<DateTime<Utc>>,
        end: DateTime<Utc>,
    ) -> AppResult<Vec<Message>> {
        let rows = match start {
            Some(start) => {
                sqlx::query(
                    r#"SELECT m.id, m.session_id, m.role, m.body, m.psych_update, m.created_at, m.semantic_processed_at
                       FROM messages m JOIN sessions s ON m.session_id = s.id
                       WHERE s.user_id = ? AND m.created_at > ? AND m.created_at <= ?
                       ORDER BY m.created_at ASC, m.id ASC"#,
                )
                .bind(user_id)
                .bind(rfc3339(start))
                .bind(rfc3339(end))
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    r#"SELECT m.id, m.session_id, m.role, m.body, m.psych_update, m.created_at, m.semantic_processed_at
                       FROM messages m JOIN sessions s ON m.session_id = s.id
                       WHERE s.user_id = ? AND m.created_at <= ?
                       ORDER BY m.created_at ASC, m.id ASC"#,
                )
                .bind(user_id)
                .bind(rfc3339(end))
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(row_to_message).collect()
    }

    async fn recent_messages(&self, user_id: &str, n: u32) -> AppResult<Vec<Message>> {
        let rows = sqlx::query(
            r#"SELECT m.id, m.session_id, m.role, m.body, m.psych_update, m.created_at, m.semantic_processed_at
               FROM messages m JOIN sessions s ON m.session_id = s.id
               WHERE s.user_id = ?
               ORDER BY m.created_at DESC, m.id DESC
               LIMIT ?"#,
        )
        .bind(user_id)
        .bind(n as i64)
        .fetch_all(&self.pool)
        .await?;
        let mut messages: Vec<Message> = rows.iter().map(row_to_message).collect::<AppResult<_>>()?;
        messages.reverse();
        Ok(messages)
    }

    async fn list_unprocessed_messages(&self, user_id: &str) -> AppResult<Vec<Message>> {
        let rows = sqlx::query(
            r#"SELECT m.id, m.session_id, m.role, m.body, m.psych_update, m.created_at, m.semantic_processed_at
               FROM messages m JOIN sessions s ON m.session_id = s.id
               WHERE s.user_id = ? AND m.psych_update IS NOT NULL AND m.semantic_processed_at IS NULL
               ORDER BY m.created_at ASC, m.id ASC"#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_message).collect()
    }

    async fn mark_message_processed(&self, message_id: &str) -> AppResult<()> {
        sqlx::query("UPDATE messages SET semantic_processed_at = ? WHERE id = ?")
            .bind(rfc3339(Utc::now()))
            .bind(message_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn save_insight(&self, insight: &SemanticInsight) -> AppResult<()> {
        sqlx::query(
            r#"INSERT INTO semantic_insights (id, user_id, source_message_id, assertion, confidence, created_at)
               VALUES (?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&insight.id)
        .bind(&insight.user_id)
        .bind(&insight.source_message_id)
        .bind(&insight.assertion)
        .bind(insight.confidence)
        .bind(rfc3339(insight.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_user_insights(&self, user_id: &str) -> AppResult<Vec<SemanticInsight>> {
        let rows = sqlx::query(
            "SELECT id, user_id, source_message_id, assertion, confidence, created_at
             FROM semantic_insights WHERE user_id = ? ORDER BY created_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let created_at: String = row.try_get("created_at").map_err(AppError::from)?;
            out.push(SemanticInsight {
                id: row.try_get("id").map_err(AppError::from)?,
                user_id: row.try_get("user_id").map_err(AppError::from)?,
                source_message_id: row.try_get("source_message_id").map_err(AppError::from)?,
                assertion: row.try_get("assertion").map_err(AppError::from)?,
                confidence: row.try_get("confidence").map_err(AppError::from)?,
                created_at: parse_rfc3339(&created_at)?,
            });
        }
        Ok(out)
    }

    async fn save_profile(
        &self,
        user_id: &str,
        body: &str,
        consensus_log: Option<&ConsensusResult>,
    ) -> AppResult<Profile> {
        let mut tx = self.pool.begin().await?;
        let next_version: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(version), 0) + 1 FROM profiles WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_one(&mut *tx)
        .await?;

        let profile = Profile {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            version: next_version,
            body: body.to_string(),
            consensus_log: consensus_log.cloned(),
            created_at: Utc::now(),
        };
        let consensus_json = consensus_log.map(serde_json::to_string).transpose()?;

        sqlx::query(
            "INSERT INTO profiles (id, user_id, version, body, consensus_log, created_at) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&profile.id)
        .bind(&profile.user_id)
        .bind(profile.version)
        .bind(&profile.body)
        .bind(consensus_json)
        .bind(rfc3339(profile.created_at))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(profile)
    }

    async fn latest_profile(&self, user_id: &str) -> AppResult<Option<Profile>> {
        let row = sqlx::query(
            "SELECT id, user_id, version, body, consensus_log, created_at
             FROM profiles WHERE user_id = ? ORDER BY version DESC LIMIT 1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => {
                let created_at: String = row.try_get("created_at").map_err(AppError::from)?;
                let consensus_log: Option<String> = row.try_get("consensus_log").map_err(AppError::from)?;
                Ok(Some(Profile {
                    id: row.try_get("id").map_err(AppError::from)?,
                    user_id: row.try_get("user_id").map_err(AppError::from)?,
                    version: row.try_get("version").map_err(AppError::from)?,
                    body: row.try_get("body").map_err(AppError::from)?,
                    consensus_log: consensus_log.map(|j| serde_json::from_str(&j)).transpose()?,
                    created_at: parse_rfc3339(&created_at)?,
                }))
            }
            None => Ok(None),
        }
    }

    async fn save_summary(&self, summary: &CondensedSummary) -> AppResult<()> {
        let source_ids = serde_json::to_string(&summary.source_summary_ids)?;
        let consensus_json = summary.consensus_log.as_ref().map(serde_json::to_string).transpose()?;
        sqlx::query(
            r#"INSERT INTO condensed_summaries
               (id, user_id, level, body, period_start, period_end, source_message_count,
                source_word_count, source_summary_ids, consensus_log, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&summary.id)
        .bind(&summary.user_id)
        .bind(summary.level)
        .bind(&summary.body)
        .bind(rfc3339(summary.period_start))
        .bind(rfc3339(summary.period_end))
        .bind(summary.source_message_count)
        .bind(summary.source_word_count)
        .bind(source_ids)
        .bind(consensus_json)
        .bind(rfc3339(summary.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_summaries(&self, user_id: &str, level: Option<i64>) -> AppResult<Vec<CondensedSummary>> {
        let rows = match level {
            Some(level) => {
                sqlx::query(
                    "SELECT * FROM condensed_summaries WHERE user_id = ? AND level = ? ORDER BY period_start ASC",
                )
                .bind(user_id)
                .bind(level)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT * FROM condensed_summaries WHERE user_id = ? ORDER BY period_start ASC")
                    .bind(user_id)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(row_to_summary).collect()
    }

    async fn count_sessions_since_last_profile(&self, user_id: &str) -> AppResult<i64> {
        let last_profile_at: Option<String> =
            sqlx::query_scalar("SELECT MAX(created_at) FROM profiles WHERE user_id = ?")
                .bind(user_id)
                .fetch_one(&self.pool)
                .await?;

        let count: i64 = match last_profile_at {
            Some(ts) => {
                sqlx::query_scalar("SELECT COUNT(*) FROM sessions WHERE user_id = ? AND created_at > ?")
                    .bind(user_id)
                    .bind(ts)
                    .fetch_one(&self.pool)
                    .await?
            }
            None => {
                sqlx::query_scalar("SELECT COUNT(*) FROM sessions WHERE user_id = ?")
                    .bind(user_id)
                    .fetch_one(&self.pool)
                    .await?
            }
        };
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Backs the store with a throwaway on-disk file rather than
    /// `sqlite::memory:`, so migrations and reconnect-shaped behavior are
    /// exercised against the same code path production uses.
    async fn store() -> (SqliteStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("runtime.db");
        let url = format!("sqlite://{}", path.display());
        let store = SqliteStore::connect(&url).await.expect("connect");
        (store, dir)
    }

    #[tokio::test]
    async fn get_or_create_user_is_idempotent() {
        let (store, _dir) = store().await;
        let first = store.get_or_create_user("u1").await.unwrap();
        let second = store.get_or_create_user("u1").await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.created_at, second.created_at);
    }

    #[tokio::test]
    async fn update_user_name_on_unknown_user_is_not_found() {
        let (store, _dir) = store().await;
        let err = store.update_user_name("nobody", "x").await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn save_and_list_messages_round_trip_in_order() {
        let (store, _dir) = store().await;
        store.get_or_create_user("u1").await.unwrap();
        let session = Session::new("u1");
        store.create_session(&session).await.unwrap();

        let first = Message::new_user(session.id.clone(), "first");
        let second = Message::new_agent(session.id.clone(), "second", None);
        store.save_message(&first).await.unwrap();
        store.save_message(&second).await.unwrap();

        let messages = store.list_messages_by_session(&session.id).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].body, "first");
        assert_eq!(messages[1].body, "second");
    }

    #[tokio::test]
    async fn save_profile_assigns_monotonic_versions() {
        let (store, _dir) = store().await;
        store.get_or_create_user("u1").await.unwrap();
        let p1 = store.save_profile("u1", "body one", None).await.unwrap();
        let p2 = store.save_profile("u1", "body two", None).await.unwrap();
        assert_eq!(p1.version, 1);
        assert_eq!(p2.version, 2);
        let latest = store.latest_profile("u1").await.unwrap().unwrap();
        assert_eq!(latest.version, 2);
        assert_eq!(latest.body, "body two");
    }

    #[tokio::test]
    async fn list_summaries_filters_by_level() {
        let (store, _dir) = store().await;
        store.get_or_create_user("u1").await.unwrap();
        let now = Utc::now();
        let summary = CondensedSummary {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: "u1".to_string(),
            level: 1,
            body: "summary body".to_string(),
            period_start: now,
            period_end: now,
            source_message_count: 2,
            source_word_count: 10,
            source_summary_ids: Vec::new(),
            consensus_log: None,
            created_at: now,
        };
        store.save_summary(&summary).await.unwrap();

        assert_eq!(store.list_summaries("u1", Some(1)).await.unwrap().len(), 1);
        assert!(store.list_summaries("u1", Some(2)).await.unwrap().is_empty());
        assert_eq!(store.list_summaries("u1", None).await.unwrap().len(), 1);
    }
}
