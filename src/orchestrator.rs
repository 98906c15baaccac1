//! The agent orchestrator: the thin coordinator that ties retrieval, the LLM
//! call, the response guard, and persistence together into `respond`, plus
//! the background `analyze` path (semantic processing, condensation,
//! profile synthesis). Grounded on `memory_manager.py`'s top-level
//! `chat`/`analyze_user` entry points; the retry-with-temperature-bump shape
//! follows the teacher's `advisory/session.rs` turn loop.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;

use crate::config::{AegeanConsensusConfig, Config, ModelsConfig};
use crate::consensus::{ConsensusConfig, ConsensusProtocol};
use crate::error::{AppError, AppResult};
use crate::guard::guard_response;
use crate::llm::{GenerateParams, LlmClient};
use crate::locks::LockRegistry;
use crate::models::{Message, Session};
use crate::retrieval::RetrievalEngine;
use crate::store::RelationalStore;

const MAX_REPLY_ATTEMPTS: u32 = 3;
const TEMPERATURE_BUMP: f64 = 0.1;
const APOLOGY_TEXT: &str =
    "I'm having trouble forming a reply right now. Could you say that again in a moment?";
const RESPONSE_GENERATION_FAILED: &str = "response_generation_failed";
const PROMPT_EXTRACTION_ATTEMPT: &str = "prompt_extraction_attempt";

#[derive(Debug, Deserialize)]
struct AgentTurnResponse {
    #[serde(alias = "text", alias = "reply")]
    response_text: String,
    #[serde(default)]
    psych_update: Option<crate::models::PsychUpdate>,
}

#[derive(Debug, Clone)]
pub struct RespondOutput {
    pub reply_text: String,
    pub session_id: String,
    pub message_id: String,
}

#[derive(Debug, Clone, Default)]
pub struct AnalyzeOutput {
    pub messages_processed: u32,
    pub new_summary: bool,
    pub profile_refreshed: bool,
}

pub struct Orchestrator {
    store: Arc<dyn RelationalStore>,
    llm: Arc<LlmClient>,
    retrieval: Arc<RetrievalEngine>,
    locks: Arc<LockRegistry>,
    models: ModelsConfig,
    consensus: AegeanConsensusConfig,
    persona_prompt: String,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn RelationalStore>,
        llm: Arc<LlmClient>,
        retrieval: Arc<RetrievalEngine>,
        locks: Arc<LockRegistry>,
        config: &Config,
        persona_prompt: impl Into<String>,
    ) -> Self {
        Self {
            store,
            llm,
            retrieval,
            locks,
            models: config.models.clone(),
            consensus: config.aegean_consensus.clone(),
            persona_prompt: persona_prompt.into(),
        }
    }

    /// Composes retrieval + LLM + guard + persistence for one user turn.
    /// Persisting the user/agent messages is the one fatal step in this
    /// path; every other failure (retrieval degradation, condensation,
    /// profile refresh) is absorbed and logged instead of failing the turn.
    /// Condensation and profile synthesis run under the per-user advisory
    /// lock so two sessions for the same user never race each other's
    /// summary inserts or `save_profile` calls.
    pub async fn respond(
        &self,
        user_id: &str,
        session_id: Option<&str>,
        text: &str,
    ) -> AppResult<RespondOutput> {
        self.store.get_or_create_user(user_id).await?;
        let session = self.resolve_session(user_id, session_id).await?;

        let _guard = self.locks.acquire(&LockRegistry::session_key(&session.id)).await;

        let context = self
            .retrieval
            .assemble(user_id, &session.id, text)
            .await
            .unwrap_or_default();

        let (reply_text, psych_update, failed) = self.generate_reply(&context, text).await;

        let (guarded_text, blocked) = guard_response(&reply_text, &self.persona_prompt);
        let mut psych_update = psych_update;
        if let Some(update) = psych_update.as_mut() {
            if failed {
                update.detected_patterns.push(RESPONSE_GENERATION_FAILED.to_string());
            }
            if blocked {
                update.detected_patterns.push(PROMPT_EXTRACTION_ATTEMPT.to_string());
            }
        }

        let user_message = Message::new_user(session.id.clone(), text);
        let agent_message = Message::new_agent(session.id.clone(), guarded_text.clone(), psych_update);

        self.store.save_message(&user_message).await?;
        self.store.save_message(&agent_message).await?;

        {
            let _user_guard = self.locks.acquire(&LockRegistry::user_key(user_id)).await;

            let new_summary = self
                .retrieval
                .record_turn(user_id, &session.id, &user_message, &agent_message)
                .await;

            if new_summary {
                match self.retrieval.profile_refresh_due(user_id).await {
                    Ok(true) => {
                        if let Err(e) = self.synthesize_profile(user_id).await {
                            tracing::warn!(error = %e, user_id, "profile synthesis failed, continuing");
                        }
                    }
                    Ok(false) => {}
                    Err(e) => tracing::warn!(error = %e, user_id, "profile refresh check failed, continuing"),
                }
            }
        }

        Ok(RespondOutput {
            reply_text: guarded_text,
            session_id: session.id,
            message_id: agent_message.id,
        })
    }

    async fn resolve_session(&self, user_id: &str, session_id: Option<&str>) -> AppResult<Session> {
        match session_id {
            Some(id) => match self.store.get_session(id).await? {
                Some(session) => Ok(session),
                None => Err(AppError::NotFound(format!("session {id} not found"))),
            },
            None => {
                let session = Session::new(user_id);
                self.store.create_session(&session).await?;
                Ok(session)
            }
        }
    }

    /// Attempts up to `MAX_REPLY_ATTEMPTS` generations, bumping temperature by
    /// `TEMPERATURE_BUMP` after each parse failure. Returns the fixed apology
    /// with `failed=true` if every attempt fails to parse.
    async fn generate_reply(
        &self,
        context: &crate::retrieval::AssembledContext,
        text: &str,
    ) -> (String, Option<crate::models::PsychUpdate>, bool) {
        let prompt = context.render_prompt(text);
        let mut temperature = 0.7;

        for attempt in 1..=MAX_REPLY_ATTEMPTS {
            let params = GenerateParams::new(prompt.clone(), self.persona_prompt.clone(), self.models.main.clone())
                .with_temperature(temperature)
                .with_json_mode(true);

            match self.llm.generate(params).await {
                Ok(out) => match serde_json::from_str::<AgentTurnResponse>(&out.text) {
                    Ok(parsed) => return (parsed.response_text, parsed.psych_update, false),
                    Err(e) => {
                        tracing::warn!(attempt, error = %e, "agent reply failed to parse as JSON, retrying");
                    }
                },
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "agent generation call failed, retrying");
                }
            }
            temperature += TEMPERATURE_BUMP;
        }

        (APOLOGY_TEXT.to_string(), Some(crate::models::PsychUpdate::default()), true)
    }

    /// Runs semantic extraction over messages not yet processed, then
    /// condensation, then (always, regardless of condensation outcome)
    /// profile synthesis if `force` or the refresh criteria hold.
    pub async fn analyze(&self, user_id: &str, force: bool) -> AppResult<AnalyzeOutput> {
        let _guard = self.locks.acquire(&LockRegistry::user_key(user_id)).await;

        let processed = self.process_unprocessed_messages(user_id).await?;

        let new_summary = self.retrieval.condensation_pass(user_id).await?;

        let should_refresh = if force {
            true
        } else {
            self.retrieval.profile_refresh_due(user_id).await?
        };

        let profile_refreshed = if should_refresh {
            self.synthesize_profile(user_id).await?;
            true
        } else {
            false
        };

        Ok(AnalyzeOutput {
            messages_processed: processed,
            new_summary,
            profile_refreshed,
        })
    }

    async fn process_unprocessed_messages(&self, user_id: &str) -> AppResult<u32> {
        let messages = self.store.list_unprocessed_messages(user_id).await?;
        let mut count = 0u32;
        for message in &messages {
            match self.extract_assertions(message).await {
                Ok(assertions) => {
                    if let Err(e) = self.retrieval.persist_assertions(user_id, &message.id, &assertions).await {
                        tracing::warn!(error = %e, message_id = %message.id, "failed to persist extracted assertions");
                    }
                }
                Err(e) => tracing::warn!(error = %e, message_id = %message.id, "semantic extraction failed, skipping"),
            }
            self.store.mark_message_processed(&message.id).await?;
            count += 1;
        }
        Ok(count)
    }

    async fn extract_assertions(&self, message: &Message) -> AppResult<Vec<crate::models::SemanticAssertion>> {
        let prompt = format!(
            "Extract durable factual or psychological assertions about the user from this message, \
             each with a confidence between 0 and 1. Respond with a JSON object of the shape \
             {{\"assertions\": [{{\"text\": string, \"confidence\": number}}]}}.\n\nMessage ({}): {}",
            message.role.as_str(),
            message.body
        );
        let params = GenerateParams::new(prompt, "", self.models.light.clone())
            .with_temperature(0.2)
            .with_json_mode(true);
        let out = self.llm.generate(params).await?;

        #[derive(Deserialize)]
        struct Extraction {
            #[serde(default)]
            assertions: Vec<crate::models::SemanticAssertion>,
        }
        let parsed: Extraction = serde_json::from_str(&out.text)?;
        Ok(parsed.assertions)
    }

    /// Synthesizes a new profile snapshot via the consensus protocol over the
    /// user's current summaries and insights, then persists it with the next
    /// monotonic version. A concurrent caller serializes on the per-user lock
    /// held by `analyze`/`respond`, so this never races itself.
    async fn synthesize_profile(&self, user_id: &str) -> AppResult<()> {
        let summaries = self.store.list_summaries(user_id, None).await?;
        let insights = self.store.list_user_insights(user_id).await?;

        let mut source = String::new();
        for s in &summaries {
            source.push_str(&format!("[level {}] {}\n", s.level, s.body));
        }
        for i in &insights {
            source.push_str(&format!("- {} (confidence {:.2})\n", i.assertion, i.confidence));
        }

        let prompt = "Synthesize a concise psychological profile of this user from the summaries and \
                      known facts below, written in the third person, focused on durable traits and \
                      recurring patterns rather than any single conversation.\n\n{source}"
            .replace("{source}", &source);

        let protocol_config = ConsensusConfig::new(
            self.models.main.clone(),
            self.models.reviewer.clone(),
            self.consensus.beta_threshold,
        );

        let body = if self.consensus.enabled {
            let protocol = ConsensusProtocol::new(&self.llm, protocol_config);
            let result = protocol
                .reach_consensus("profile_synthesis", &prompt, HashMap::new(), &[], &source)
                .await?;
            self.store
                .save_profile(user_id, &result.final_output, Some(&result))
                .await?;
            return Ok(());
        } else {
            let params = GenerateParams::new(prompt, "", self.models.main.clone());
            self.llm.generate(params).await?.text
        };

        self.store.save_profile(user_id, &body, None).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_turn_response_accepts_all_three_aliases() {
        let a: AgentTurnResponse = serde_json::from_str(r#"{"response_text": "hi"}"#).unwrap();
        assert_eq!(a.response_text, "hi");
        let b: AgentTurnResponse = serde_json::from_str(r#"{"text": "hi"}"#).unwrap();
        assert_eq!(b.response_text, "hi");
        let c: AgentTurnResponse = serde_json::from_str(r#"{"reply": "hi"}"#).unwrap();
        assert_eq!(c.response_text, "hi");
    }

    #[test]
    fn agent_turn_response_psych_update_is_optional() {
        let a: AgentTurnResponse = serde_json::from_str(r#"{"response_text": "hi"}"#).unwrap();
        assert!(a.psych_update.is_none());
    }
}
