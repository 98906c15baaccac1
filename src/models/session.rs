use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A session exclusively owns its messages. Metadata is a free-form string
/// map, matching the data model's "free-form string map metadata".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Session {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            created_at: Utc::now(),
            metadata: HashMap::new(),
        }
    }
}

/// A session plus its message count, as returned by the "list sessions with
/// message counts" operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionWithCount {
    #[serde(flatten)]
    pub session: Session,
    pub message_count: i64,
}
