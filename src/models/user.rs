use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A user owns sessions, insights, profiles, and condensed summaries.
/// `name` is the only mutable field; everything else is append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            created_at: Utc::now(),
        }
    }
}
