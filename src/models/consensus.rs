use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConcernSeverity {
    Minor,
    Moderate,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewConcern {
    pub issue: String,
    pub severity: ConcernSeverity,
}

/// One model's review of the other's output for a single round.
/// Produced either by parsing the reviewer's JSON or, on parse failure,
/// synthesized as `{approved:false, reasoning:<raw>, concerns:[]}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewResult {
    pub approved: bool,
    #[serde(default)]
    pub strengths: Vec<String>,
    #[serde(default)]
    pub concerns: Vec<ReviewConcern>,
    pub reasoning: String,
}

impl ReviewResult {
    pub fn unparseable(raw: impl Into<String>) -> Self {
        Self {
            approved: false,
            strengths: Vec::new(),
            concerns: Vec::new(),
            reasoning: raw.into(),
        }
    }
}

/// One full round of the consensus loop: both models' outputs, both
/// cross-reviews, and whether this round reached the approval bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusRound {
    pub round_number: u32,
    pub output_a: String,
    pub output_b: String,
    pub review_a_of_b: ReviewResult,
    pub review_b_of_a: ReviewResult,
    pub reached: bool,
    pub timestamp: DateTime<Utc>,
}

/// The outcome of a full consensus run, persisted alongside the artifact it
/// produced (a condensed summary or a profile).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusResult {
    pub final_output: String,
    pub reached: bool,
    pub rounds: Vec<ConsensusRound>,
    pub model_a: String,
    pub model_b: String,
    pub stability_score: f64,
    pub critical_flags: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Unknown keys from the synthesizing LLM's JSON reply, round-tripped
    /// verbatim instead of being dropped by the known-field set above.
    #[serde(flatten, default)]
    pub extras: HashMap<String, serde_json::Value>,
}
