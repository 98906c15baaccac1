use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A durable semantic fact extracted from one agent turn's psych update,
/// weakly referencing the message it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemanticInsight {
    pub id: String,
    pub user_id: String,
    pub source_message_id: String,
    pub assertion: String,
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
}

impl SemanticInsight {
    pub fn new(
        user_id: impl Into<String>,
        source_message_id: impl Into<String>,
        assertion: impl Into<String>,
        confidence: f64,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            source_message_id: source_message_id.into(),
            assertion: assertion.into(),
            confidence,
            created_at: Utc::now(),
        }
    }
}
