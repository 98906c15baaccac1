use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::consensus::ConsensusResult;

/// One node in the multi-level condensation tree. Level 1 summarizes raw
/// messages directly (empty `source_summary_ids`); level L>1 summarizes a
/// batch of level-(L-1) summaries (`source_summary_ids` non-empty, len >= 2).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CondensedSummary {
    pub id: String,
    pub user_id: String,
    pub level: i64,
    pub body: String,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub source_message_count: i64,
    pub source_word_count: i64,
    pub source_summary_ids: Vec<String>,
    pub consensus_log: Option<ConsensusResult>,
    pub created_at: DateTime<Utc>,
}

impl CondensedSummary {
    pub fn estimated_tokens(&self) -> u32 {
        crate::condensation::estimate_tokens(&self.body)
    }
}
