use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Agent,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Agent => "agent",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "user" => Some(MessageRole::User),
            "agent" => Some(MessageRole::Agent),
            _ => None,
        }
    }
}

/// One assertion extracted from an agent turn's psychological read of the user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemanticAssertion {
    pub text: String,
    pub confidence: f64,
}

/// Structured introspection an agent turn attaches to its own message.
/// Never present on user messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PsychUpdate {
    pub detected_patterns: Vec<String>,
    pub emotional_state: String,
    pub applied_principle: String,
    pub next_direction: String,
    pub confidence: f64,
    pub assertions: Vec<SemanticAssertion>,
    /// Unknown keys from the LLM's JSON reply, round-tripped verbatim
    /// instead of being dropped by the known-field set above.
    #[serde(flatten)]
    pub extras: HashMap<String, serde_json::Value>,
}

impl Default for PsychUpdate {
    fn default() -> Self {
        Self {
            detected_patterns: Vec::new(),
            emotional_state: String::new(),
            applied_principle: String::new(),
            next_direction: String::new(),
            confidence: 0.0,
            assertions: Vec::new(),
            extras: HashMap::new(),
        }
    }
}

/// A single turn within a session. Strictly monotonic `(created_at, id)`
/// ordering within a session is an invariant enforced by callers appending
/// messages in order, not by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub session_id: String,
    pub role: MessageRole,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub psych_update: Option<PsychUpdate>,
    pub semantic_processed_at: Option<DateTime<Utc>>,
}

impl Message {
    pub fn new_user(session_id: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            role: MessageRole::User,
            body: body.into(),
            created_at: Utc::now(),
            psych_update: None,
            semantic_processed_at: None,
        }
    }

    pub fn new_agent(
        session_id: impl Into<String>,
        body: impl Into<String>,
        psych_update: Option<PsychUpdate>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            role: MessageRole::Agent,
            body: body.into(),
            created_at: Utc::now(),
            psych_update,
            semantic_processed_at: None,
        }
    }
}
