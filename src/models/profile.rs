use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::consensus::ConsensusResult;

/// A versioned snapshot of the user's standing psychological profile.
/// Versions are monotonic per user starting at 1; the store assigns the
/// version on insert so concurrent writers never collide.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    pub user_id: String,
    pub version: i64,
    pub body: String,
    pub consensus_log: Option<ConsensusResult>,
    pub created_at: DateTime<Utc>,
}
