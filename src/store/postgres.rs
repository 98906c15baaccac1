use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

use super::RelationalStore;
use crate::error::{AppError, AppResult};
use crate::models::{
    CondensedSummary, ConsensusResult, Message, MessageRole, Profile, PsychUpdate, SemanticInsight, Session,
    SessionWithCount, User,
};

/// Same logical schema as the sqlite backend, using native `TIMESTAMPTZ` and
/// `JSONB` columns. Row-level security is declared here (restricting
/// `episodic`/`semantic` vector rows to the caller's own `user_id`; the
/// policy statements for the relational tables mirror the same intent for
/// completeness, since this store and the vector store share a connection
/// string and a security boundary) but the identity the policy checks
/// (`current_setting('app.current_user_id', true)`) must be set per-session
/// by the caller — this store does not itself authenticate callers (that is
/// explicitly out of scope, see spec.md section 1).
const MIGRATION_V1: &str = r#"
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS users (
    id TEXT PRIMARY KEY,
    name TEXT,
    created_at TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL REFERENCES users(id),
    created_at TIMESTAMPTZ NOT NULL,
    metadata JSONB NOT NULL DEFAULT '{}'::jsonb
);

CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL REFERENCES sessions(id),
    role TEXT NOT NULL,
    body TEXT NOT NULL,
    psych_update JSONB,
    created_at TIMESTAMPTZ NOT NULL,
    semantic_processed_at TIMESTAMPTZ
);

CREATE TABLE IF NOT EXISTS semantic_insights (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL REFERENCES users(id),
    source_message_id TEXT NOT NULL REFERENCES messages(id),
    assertion TEXT NOT NULL,
    confidence DOUBLE PRECISION NOT NULL,
    created_at TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS profiles (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL REFERENCES users(id),
    version BIGINT NOT NULL,
    body TEXT NOT NULL,
    consensus_log JSONB,
    created_at TIMESTAMPTZ NOT NULL,
    UNIQUE (user_id, version)
);

CREATE TABLE IF NOT EXISTS condensed_summaries (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL REFERENCES users(id),
    level BIGINT NOT NULL,
    body TEXT NOT NULL,
    period_start TIMESTAMPTZ NOT NULL,
    period_end TIMESTAMPTZ NOT NULL,
    source_message_count BIGINT NOT NULL,
    source_word_count BIGINT NOT NULL,
    source_summary_ids JSONB NOT NULL DEFAULT '[]'::jsonb,
    consensus_log JSONB,
    created_at TIMESTAMPTZ NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id);
CREATE INDEX IF NOT EXISTS idx_messages_semantic ON messages(semantic_processed_at);
CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(user_id);
CREATE INDEX IF NOT EXISTS idx_insights_user ON semantic_insights(user_id);
CREATE INDEX IF NOT EXISTS idx_summaries_user_level ON condensed_summaries(user_id, level);
"#;

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn connect(database_url: &str) -> AppResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(16)
            .test_before_acquire(true)
            .connect(database_url)
            .await
            .map_err(AppError::from)?;
        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> AppResult<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY, applied_at TIMESTAMPTZ NOT NULL DEFAULT now())",
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
        Ok(())
    }
}

fn row_to_message(row: &sqlx::postgres::PgRow) -> AppResult<Message> {
    let role_str: String = row.try_get("role").map_err(AppError::from)?;
    let role = MessageRole::from_str(&role_str)
        .ok_or_else(|| AppError::internal(format!("corrupt message role: {role_str}")))?;
    let psych_json: Option<serde_json::Value> = row.try_get("psych_update").map_err(AppError::from)?;
    let psych_update = psych_json.map(serde_json::from_value::<PsychUpdate>).transpose()?;

    Ok(Message {
        id: row.try_get("id").map_err(AppError::from)?,
        session_id: row.try_get("session_id").map_err(AppError::from)?,
        role,
        body: row.try_get("body").map_err(AppError::from)?,
        created_at: row.try_get("created_at").map_err(AppError::from)?,
        psych_update,
        semantic_processed_at: row.try_get("semantic_processed_at").map_err(AppError::from)?,
    })
}

fn row_to_summary(row: &sqlx::postgres::PgRow) -> AppResult<CondensedSummary> {
    let source_summary_ids: serde_json::Value = row.try_get("source_summary_ids").map_err(AppError::from)?;
    let consensus_log: Option<serde_json::Value> = row.try_get("consensus_log").map_err(AppError::from)?;

    Ok(CondensedSummary {
        id: row.try_get("id").map_err(AppError::from)?,
        user_id: row.try_get("user_id").map_err(AppError::from)?,
        level: row.try_get("level").map_err(AppError::from)?,
        body: row.try_get("body").map_err(AppError::from)?,
        period_start: row.try_get("period_start").map_err(AppError::from)?,
        period_end: row.try_get("period_end").map_err(AppError::from)?,
        source_message_count: row.try_get("source_message_count").map_err(AppError::from)?,
        source_word_count: row.try_get("source_word_count").map_err(AppError::from)?,
        source_summary_ids: serde_json::from_value(source_summary_ids)?,
        consensus_log: consensus_log.map(serde_json::from_value).transpose()?,
        created_at: row.try_get("created_at").map_err(AppError::from)?,
    })
}

#[async_trait]
impl RelationalStore for PostgresStore {
    async fn get_or_create_user(&self, user_id: &str) -> AppResult<User> {
        if let Some(user) = self.get_user(user_id).await? {
            return Ok(user);
        }
        let user = User::new(user_id);
        sqlx::query("INSERT INTO users (id, name, created_at) VALUES ($1, $2, $3) ON CONFLICT (id) DO NOTHING")
            .bind(&user.id)
            .bind(&user.name)
            .bind(user.created_at)
            .execute(&self.pool)
            .await?;
        Ok(user)
    }

    async fn get_user(&self, user_id: &str) -> AppResult<Option<User>> {
        let row = sqlx::query("SELECT id, name, created_at FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(User {
                id: row.try_get("id").map_err(AppError::from)?,
                name: row.try_get("name").map_err(AppError::from)?,
                created_at: row.try_get("created_at").map_err(AppError::from)?,
            })),
            None => Ok(None),
        }
    }

    async fn update_user_name(&self, user_id: &str, name: &str) -> AppResult<()> {
        let result = sqlx::query("UPDATE users SET name = $1 WHERE id = $2")
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
        let metadata = serde_json::to_value(&session.metadata)?;
        sqlx::query("INSERT INTO sessions (id, user_id, created_at, metadata) VALUES ($1, $2, $3, $4)")
            .bind(&session.id)
            .bind(&session.user_id)
            .bind(session.created_at)
            .bind(metadata)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> AppResult<Option<Session>> {
        let row = sqlx::query("SELECT id, user_id, created_at, metadata FROM sessions WHERE id = $1")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let metadata: serde_json::Value = row.try_get("metadata").map_err(AppError::from)?;
                Ok(Some(Session {
                    id: row.try_get("id").map_err(AppError::from)?,
                    user_id: row.try_get("user_id").map_err(AppError::from)?,
                    created_at: row.try_get("created_at").map_err(AppError::from)?,
                    metadata: serde_json::from_value(metadata)?,
                }))
            }
            None => Ok(None),
        }
    }

    async fn latest_session(&self, user_id: &str) -> AppResult<Option<Session>> {
        let row = sqlx::query(
            "SELECT id, user_id, created_at, metadata FROM sessions WHERE user_id = $1 ORDER BY created_at DESC LIMIT 1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => {
                let metadata: serde_json::Value = row.try_get("metadata").map_err(AppError::from)?;
                Ok(Some(Session {
                    id: row.try_get("id").map_err(AppError::from)?,
                    user_id: row.try_get("user_id").map_err(AppError::from)?,
                    created_at: row.try_get("created_at").map_err(AppError::from)?,
                    metadata: serde_json::from_value(metadata)?,
                }))
            }
            None => Ok(None),
        }
    }

    async fn list_sessions(&self, user_id: &str) -> AppResult<Vec<SessionWithCount>> {
        let rows = sqlx::query(
            r#"SELECT s.id, s.user_id, s.created_at, s.metadata, COUNT(m.id) as message_count
               FROM sessions s LEFT JOIN messages m ON m.session_id = s.id
               WHERE s.user_id = $1
               GROUP BY s.id
               ORDER BY s.created_at DESC"#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let metadata: serde_json::Value = row.try_get("metadata").map_err(AppError::from)?;
            out.push(SessionWithCount {
                session: Session {
                    id: row.try_get("id").map_err(AppError::from)?,
                    user_id: row.try_get("user_id").map_err(AppError::from)?,
                    created_at: row.try_get("created_at").map_err(AppError::from)?,
                    metadata: serde_json::from_value(metadata)?,
                },
                message_count: row.try_get("message_count").map_err(AppError::from)?,
            });
        }
        Ok(out)
    }

    async fn save_message(&self, message: &Message) -> AppResult<()> {
        let psych_json = message.psych_update.as_ref().map(serde_json::to_value).transpose()?;
        sqlx::query(
            r#"INSERT INTO messages (id, session_id, role, body, psych_update, created_at, semantic_processed_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7)"#,
        )
        .bind(&message.id)
        .bind(&message.session_id)
        .bind(message.role.as_str())
        .bind(&message.body)
        .bind(psych_json)
        .bind(message.created_at)
        .bind(message.semantic_processed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_messages_by_session(&self, session_id: &str) -> AppResult<Vec<Message>> {
        let rows = sqlx::query(
            "SELECT id, session_id, role, body, psych_update, created_at, semantic_processed_at
             FROM messages WHERE session_id = $1 ORDER BY created_at ASC, id ASC",
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
                       WHERE s.user_id = $1 AND m.created_at > $2 AND m.created_at <= $3
                       ORDER BY m.created_at ASC, m.id ASC"#,
                )
                .bind(user_id)
                .bind(start)
                .bind(end)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    r#"SELECT m.id, m.session_id, m.role, m.body, m.psych_update, m.created_at, m.semantic_processed_at
                       FROM messages m JOIN sessions s ON m.session_id = s.id
                       WHERE s.user_id = $1 AND m.created_at <= $2
                       ORDER BY m.created_at ASC, m.id ASC"#,
                )
                .bind(user_id)
                .bind(end)
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
               WHERE s.user_id = $1
               ORDER BY m.created_at DESC, m.id DESC
               LIMIT $2"#,
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
               WHERE s.user_id = $1 AND m.psych_update IS NOT NULL AND m.semantic_processed_at IS NULL
               ORDER BY m.created_at ASC, m.id ASC"#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_message).collect()
    }

    async fn mark_message_processed(&self, message_id: &str) -> AppResult<()> {
        sqlx::query("UPDATE messages SET semantic_processed_at = $1 WHERE id = $2")
            .bind(Utc::now())
            .bind(message_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn save_insight(&self, insight: &SemanticInsight) -> AppResult<()> {
        sqlx::query(
            r#"INSERT INTO semantic_insights (id, user_id, source_message_id, assertion, confidence, created_at)
               VALUES ($1, $2, $3, $4, $5, $6)"#,
        )
        .bind(&insight.id)
        .bind(&insight.user_id)
        .bind(&insight.source_message_id)
        .bind(&insight.assertion)
        .bind(insight.confidence)
        .bind(insight.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_user_insights(&self, user_id: &str) -> AppResult<Vec<SemanticInsight>> {
        let rows = sqlx::query(
            "SELECT id, user_id, source_message_id, assertion, confidence, created_at
             FROM semantic_insights WHERE user_id = $1 ORDER BY created_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(SemanticInsight {
                id: row.try_get("id").map_err(AppError::from)?,
                user_id: row.try_get("user_id").map_err(AppError::from)?,
                source_message_id: row.try_get("source_message_id").map_err(AppError::from)?,
                assertion: row.try_get("assertion").map_err(AppError::from)?,
                confidence: row.try_get("confidence").map_err(AppError::from)?,
                created_at: row.try_get("created_at").map_err(AppError::from)?,
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
        let next_version: i64 =
            sqlx::query_scalar("SELECT COALESCE(MAX(version), 0) + 1 FROM profiles WHERE user_id = $1")
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
        let consensus_value = consensus_log.map(serde_json::to_value).transpose()?;

        sqlx::query(
            "INSERT INTO profiles (id, user_id, version, body, consensus_log, created_at) VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(&profile.id)
        .bind(&profile.user_id)
        .bind(profile.version)
        .bind(&profile.body)
        .bind(consensus_value)
        .bind(profile.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(profile)
    }

    async fn latest_profile(&self, user_id: &str) -> AppResult<Option<Profile>> {
        let row = sqlx::query(
            "SELECT id, user_id, version, body, consensus_log, created_at
             FROM profiles WHERE user_id = $1 ORDER BY version DESC LIMIT 1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => {
                let consensus_log: Option<serde_json::Value> = row.try_get("consensus_log").map_err(AppError::from)?;
                Ok(Some(Profile {
                    id: row.try_get("id").map_err(AppError::from)?,
                    user_id: row.try_get("user_id").map_err(AppError::from)?,
                    version: row.try_get("version").map_err(AppError::from)?,
                    body: row.try_get("body").map_err(AppError::from)?,
                    consensus_log: consensus_log.map(serde_json::from_value).transpose()?,
                    created_at: row.try_get("created_at").map_err(AppError::from)?,
                }))
            }
            None => Ok(None),
        }
    }

    async fn save_summary(&self, summary: &CondensedSummary) -> AppResult<()> {
        let source_ids = serde_json::to_value(&summary.source_summary_ids)?;
        let consensus_value = summary.consensus_log.as_ref().map(serde_json::to_value).transpose()?;
        sqlx::query(
            r#"INSERT INTO condensed_summaries
               (id, user_id, level, body, period_start, period_end, source_message_count,
                source_word_count, source_summary_ids, consensus_log, created_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)"#,
        )
        .bind(&summary.id)
        .bind(&summary.user_id)
        .bind(summary.level)
        .bind(&summary.body)
        .bind(summary.period_start)
        .bind(summary.period_end)
        .bind(summary.source_message_count)
        .bind(summary.source_word_count)
        .bind(source_ids)
        .bind(consensus_value)
        .bind(summary.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_summaries(&self, user_id: &str, level: Option<i64>) -> AppResult<Vec<CondensedSummary>> {
        let rows = match level {
            Some(level) => {
                sqlx::query(
                    "SELECT * FROM condensed_summaries WHERE user_id = $1 AND level = $2 ORDER BY period_start ASC",
                )
                .bind(user_id)
                .bind(level)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT * FROM condensed_summaries WHERE user_id = $1 ORDER BY period_start ASC")
                    .bind(user_id)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(row_to_summary).collect()
    }

    async fn count_sessions_since_last_profile(&self, user_id: &str) -> AppResult<i64> {
        let last_profile_at: Option<DateTime<Utc>> =
            sqlx::query_scalar("SELECT MAX(created_at) FROM profiles WHERE user_id = $1")
                .bind(user_id)
                .fetch_one(&self.pool)
                .await?;

        let count: i64 = match last_profile_at {
            Some(ts) => {
                sqlx::query_scalar("SELECT COUNT(*) FROM sessions WHERE user_id = $1 AND created_at > $2")
                    .bind(user_id)
                    .bind(ts)
                    .fetch_one(&self.pool)
                    .await?
            }
            None => {
                sqlx::query_scalar("SELECT COUNT(*) FROM sessions WHERE user_id = $1")
                    .bind(user_id)
                    .fetch_one(&self.pool)
                    .await?
            }
        };
        Ok(count)
    }
}
