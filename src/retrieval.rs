//! Per-turn retrieval and context assembly: expands the user's message into
//! a richer query, fans out across the four vector collections plus the
//! relational store for recent messages/narrative/profile, and composes the
//! fixed-order prompt sections the orchestrator hands to the LLM. Also owns
//! the post-turn bookkeeping that follows a successful reply. Grounded on
//! `memory_manager.py`'s context-assembly pass; prompt-composition shape
//! follows the teacher's `advisory/context.rs` section-building style.

use std::collections::HashMap;
use std::sync::Arc;

use crate::condensation::{estimate_tokens, CondensationEngine};
use crate::config::{Config, ModelsConfig};
use crate::error::AppResult;
use crate::llm::{GenerateParams, LlmClient};
use crate::models::{Message, MessageRole, VectorCollection, VectorRecord};
use crate::store::RelationalStore;
use crate::vector_store::VectorStore;

const STOIC_WISDOM_TOP_N: usize = 3;
const PSYCHOANALYSIS_TOP_N: usize = 3;
const SEMANTIC_TOP_N: usize = 5;
const EPISODIC_TOP_N: usize = 3;
const INSIGHT_CONFIDENCE_THRESHOLD: f64 = 0.5;
const MIN_SUMMARIES_FOR_PROFILE_REFRESH: usize = 3;
const MIN_NEW_SUMMARIES_SINCE_PROFILE: usize = 2;

const EXPANSION_PROMPT_TEMPLATE: &str = "Expand the following user message into a short comma-separated list of \
    related search terms and concepts, to improve retrieval recall. Respond with only the \
    comma-separated list, nothing else.\n\nMessage: {message}";

/// One assembled turn's worth of context, ready to be woven into a prompt.
#[derive(Debug, Clone, Default)]
pub struct AssembledContext {
    pub profile: Option<String>,
    pub narrative: Vec<String>,
    pub episodic: Vec<String>,
    pub stoic_wisdom: Vec<String>,
    pub psychoanalysis: Vec<String>,
    pub known_insights: Vec<String>,
    pub recent_messages: Vec<Message>,
}

impl AssembledContext {
    /// Composes the fixed prompt section order: profile, narrative, episodic,
    /// stoic wisdom, psychoanalysis, known insights, recent messages, then the
    /// new user message.
    pub fn render_prompt(&self, new_user_message: &str) -> String {
        let mut sections = Vec::new();

        if let Some(profile) = &self.profile {
            sections.push(format!("## Psychological profile\n{profile}"));
        }
        if !self.narrative.is_empty() {
            sections.push(format!("## Narrative history\n{}", self.narrative.join("\n\n")));
        }
        if !self.episodic.is_empty() {
            sections.push(format!("## Related past moments\n{}", self.episodic.join("\n\n")));
        }
        if !self.stoic_wisdom.is_empty() {
            sections.push(format!("## Relevant stoic wisdom\n{}", self.stoic_wisdom.join("\n\n")));
        }
        if !self.psychoanalysis.is_empty() {
            sections.push(format!(
                "## Relevant psychoanalytic framing\n{}",
                self.psychoanalysis.join("\n\n")
            ));
        }
        if !self.known_insights.is_empty() {
            sections.push(format!("## Known facts about this user\n{}", self.known_insights.join("\n")));
        }
        if !self.recent_messages.is_empty() {
            let rendered = self
                .recent_messages
                .iter()
                .map(|m| format!("{}: {}", m.role.as_str(), m.body))
                .collect::<Vec<_>>()
                .join("\n");
            sections.push(format!("## Recent conversation\n{rendered}"));
        }
        sections.push(format!("## New message\nuser: {new_user_message}"));

        sections.join("\n\n")
    }
}

pub struct RetrievalEngine {
    store: Arc<dyn RelationalStore>,
    vectors: Arc<dyn VectorStore>,
    llm: Arc<LlmClient>,
    condensation: Arc<CondensationEngine>,
    models: ModelsConfig,
    max_context_tokens: u32,
    narrative_budget_tokens: u32,
}

impl RetrievalEngine {
    pub fn new(
        store: Arc<dyn RelationalStore>,
        vectors: Arc<dyn VectorStore>,
        llm: Arc<LlmClient>,
        condensation: Arc<CondensationEngine>,
        config: &Config,
    ) -> Self {
        Self {
            store,
            vectors,
            llm,
            condensation,
            models: config.models.clone(),
            max_context_tokens: config.memory.max_context_tokens,
            narrative_budget_tokens: config.memory.narrative_budget_tokens,
        }
    }

    /// Expands `message` via a fixed prompt, parsed as a comma-separated list
    /// and rejoined with spaces; falls back to the raw message on any LLM or
    /// parse failure so retrieval never blocks on this step.
    async fn expand_query(&self, message: &str) -> String {
        let prompt = EXPANSION_PROMPT_TEMPLATE.replace("{message}", message);
        let params = GenerateParams::new(prompt, "", self.models.light.clone()).with_temperature(0.3);
        match self.llm.generate(params).await {
            Ok(out) => {
                let terms: Vec<&str> = out.text.split(',').map(|t| t.trim()).filter(|t| !t.is_empty()).collect();
                if terms.is_empty() {
                    message.to_string()
                } else {
                    terms.join(" ")
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "query expansion failed, falling back to raw message");
                message.to_string()
            }
        }
    }

    async fn embed_query(&self, text: &str) -> AppResult<Vec<f32>> {
        self.llm.embed(text, &self.models.embedding).await
    }

    /// Runs one vector collection query, swallowing any failure into an empty
    /// result so one backend's hiccup never sinks the whole turn.
    async fn fanout_query(
        &self,
        collection: VectorCollection,
        embedding: &[f32],
        n: usize,
        where_: &HashMap<String, String>,
    ) -> Vec<String> {
        match self.vectors.query(collection, embedding, n, where_).await {
            Ok(result) => result.documents,
            Err(e) => {
                tracing::warn!(error = %e, ?collection, "vector fan-out query failed, returning empty");
                Vec::new()
            }
        }
    }

    pub async fn assemble(&self, user_id: &str, session_id: &str, new_user_message: &str) -> AppResult<AssembledContext> {
        let expanded = self.expand_query(new_user_message).await;

        let embedding = match self.embed_query(&expanded).await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "query embedding failed, skipping vector fan-out entirely");
                Vec::new()
            }
        };

        let mut user_filter = HashMap::new();
        user_filter.insert("user_id".to_string(), user_id.to_string());
        let no_filter = HashMap::new();

        let (stoic_wisdom, psychoanalysis, semantic, episodic) = if embedding.is_empty() {
            (Vec::new(), Vec::new(), Vec::new(), Vec::new())
        } else {
            tokio::join!(
                self.fanout_query(VectorCollection::StoicWisdom, &embedding, STOIC_WISDOM_TOP_N, &no_filter),
                self.fanout_query(VectorCollection::Psychoanalysis, &embedding, PSYCHOANALYSIS_TOP_N, &no_filter),
                self.fanout_query(VectorCollection::Semantic, &embedding, SEMANTIC_TOP_N, &user_filter),
                self.fanout_query(VectorCollection::Episodic, &embedding, EPISODIC_TOP_N, &user_filter),
            )
        };

        let recent_messages = self.recent_window(session_id).await?;
        let narrative = self
            .condensation
            .budgeted_summaries(user_id, self.narrative_budget_tokens)
            .await?
            .into_iter()
            .map(|s| s.body)
            .collect();

        let profile = self.store.latest_profile(user_id).await?.map(|p| p.body);

        let known_insights = self
            .store
            .list_user_insights(user_id)
            .await?
            .into_iter()
            .map(|i| i.assertion)
            .collect();

        Ok(AssembledContext {
            profile,
            narrative,
            episodic,
            stoic_wisdom,
            psychoanalysis,
            known_insights,
            recent_messages,
        })
    }

    /// Newest-to-oldest window from the current session, bounded by
    /// cumulative estimated tokens, returned in chronological order.
    async fn recent_window(&self, session_id: &str) -> AppResult<Vec<Message>> {
        let mut messages = self.store.list_messages_by_session(session_id).await?;
        messages.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let mut window = Vec::new();
        let mut total = 0u32;
        for message in messages {
            let tokens = estimate_tokens(&message.body);
            if total + tokens > self.max_context_tokens {
                break;
            }
            total += tokens;
            window.push(message);
        }
        window.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(window)
    }

    /// Persists the turn's two messages, upserts any high-confidence semantic
    /// assertions, appends the raw turn to episodic memory, triggers
    /// condensation, and triggers profile synthesis if warranted. Returns the
    /// newly produced summary (if condensation fired) so callers can log it;
    /// none of these steps should fail the turn itself, so errors here are
    /// logged and absorbed rather than propagated.
    pub async fn record_turn(
        &self,
        user_id: &str,
        session_id: &str,
        user_message: &Message,
        agent_message: &Message,
    ) -> bool {
        if let Err(e) = self.persist_insights(user_id, agent_message).await {
            tracing::warn!(error = %e, "failed to persist semantic insights, continuing");
        }

        if let Err(e) = self.append_episodic(user_id, session_id, user_message, agent_message).await {
            tracing::warn!(error = %e, "failed to append episodic memory, continuing");
        }

        let mut new_summary = false;
        match self.condensation.maybe_condense(user_id).await {
            Ok(Some(_)) => new_summary = true,
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "condensation pass failed, continuing"),
        }

        new_summary
    }

    async fn persist_insights(&self, user_id: &str, agent_message: &Message) -> AppResult<()> {
        let Some(psych) = &agent_message.psych_update else {
            return Ok(());
        };
        self.persist_assertions(user_id, &agent_message.id, &psych.assertions).await
    }

    /// Shared by the per-turn bookkeeping above and the background
    /// `process_unprocessed_messages` pass: persists each assertion at or
    /// above the confidence threshold as both an insight row and a semantic
    /// vector record.
    pub async fn persist_assertions(
        &self,
        user_id: &str,
        source_message_id: &str,
        assertions: &[crate::models::SemanticAssertion],
    ) -> AppResult<()> {
        for assertion in assertions {
            if assertion.confidence < INSIGHT_CONFIDENCE_THRESHOLD {
                continue;
            }
            let insight = crate::models::SemanticInsight::new(
                user_id,
                source_message_id,
                assertion.text.clone(),
                assertion.confidence,
            );
            self.store.save_insight(&insight).await?;

            let embedding = self.llm.embed(&assertion.text, &self.models.embedding).await.unwrap_or_default();
            if !embedding.is_empty() {
                let mut metadata = HashMap::new();
                metadata.insert("user_id".to_string(), user_id.to_string());
                metadata.insert("source_message_id".to_string(), source_message_id.to_string());
                metadata.insert("confidence".to_string(), assertion.confidence.to_string());
                let record = VectorRecord {
                    id: insight.id.clone(),
                    document: assertion.text.clone(),
                    embedding,
                    metadata,
                };
                self.vectors.add(VectorCollection::Semantic, vec![record]).await?;
            }
        }
        Ok(())
    }

    async fn append_episodic(
        &self,
        user_id: &str,
        session_id: &str,
        user_message: &Message,
        agent_message: &Message,
    ) -> AppResult<()> {
        let document = format!("User: {}\nAgent: {}", user_message.body, agent_message.body);
        let embedding = self.llm.embed(&document, &self.models.embedding).await.unwrap_or_default();
        if embedding.is_empty() {
            return Ok(());
        }
        let mut metadata = HashMap::new();
        metadata.insert("user_id".to_string(), user_id.to_string());
        metadata.insert("session_id".to_string(), session_id.to_string());
        metadata.insert("type".to_string(), "turn".to_string());
        let record = VectorRecord {
            id: uuid::Uuid::new_v4().to_string(),
            document,
            embedding,
            metadata,
        };
        self.vectors.add(VectorCollection::Episodic, vec![record]).await
    }

    /// Runs a condensation check outside the per-turn bookkeeping path (used
    /// by the background `analyze` entry point). Returns whether a new
    /// level-1 summary was produced.
    pub async fn condensation_pass(&self, user_id: &str) -> AppResult<bool> {
        Ok(self.condensation.maybe_condense(user_id).await?.is_some())
    }

    /// True once a user has at least `MIN_SUMMARIES_FOR_PROFILE_REFRESH` total
    /// summaries and at least `MIN_NEW_SUMMARIES_SINCE_PROFILE` created since
    /// their latest profile snapshot (or no profile yet, counting all of them).
    pub async fn profile_refresh_due(&self, user_id: &str) -> AppResult<bool> {
        let summaries = self.store.list_summaries(user_id, None).await?;
        if summaries.len() < MIN_SUMMARIES_FOR_PROFILE_REFRESH {
            return Ok(false);
        }
        let latest_profile = self.store.latest_profile(user_id).await?;
        let new_since = match &latest_profile {
            Some(p) => summaries.iter().filter(|s| s.created_at > p.created_at).count(),
            None => summaries.len(),
        };
        Ok(new_since >= MIN_NEW_SUMMARIES_SINCE_PROFILE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_prompt_orders_sections_fixed() {
        let ctx = AssembledContext {
            profile: Some("profile text".to_string()),
            narrative: vec!["narrative text".to_string()],
            episodic: vec!["episodic text".to_string()],
            stoic_wisdom: vec!["stoic text".to_string()],
            psychoanalysis: vec!["psych text".to_string()],
            known_insights: vec!["insight one".to_string()],
            recent_messages: vec![Message::new_user("s1", "hello there")],
        };
        let rendered = ctx.render_prompt("new message body");

        let profile_pos = rendered.find("profile text").unwrap();
        let narrative_pos = rendered.find("narrative text").unwrap();
        let episodic_pos = rendered.find("episodic text").unwrap();
        let stoic_pos = rendered.find("stoic text").unwrap();
        let psych_pos = rendered.find("psych text").unwrap();
        let insights_pos = rendered.find("insight one").unwrap();
        let recent_pos = rendered.find("hello there").unwrap();
        let new_pos = rendered.find("new message body").unwrap();

        assert!(profile_pos < narrative_pos);
        assert!(narrative_pos < episodic_pos);
        assert!(episodic_pos < stoic_pos);
        assert!(stoic_pos < psych_pos);
        assert!(psych_pos < insights_pos);
        assert!(insights_pos < recent_pos);
        assert!(recent_pos < new_pos);
    }

    #[test]
    fn render_prompt_omits_empty_sections() {
        let ctx = AssembledContext::default();
        let rendered = ctx.render_prompt("hi");
        assert!(!rendered.contains("## Psychological profile"));
        assert!(!rendered.contains("## Narrative history"));
        assert!(rendered.contains("## New message"));
    }

    #[test]
    fn message_role_as_str_matches_expected_labels() {
        assert_eq!(MessageRole::User.as_str(), "user");
        assert_eq!(MessageRole::Agent.as_str(), "agent");
    }
}
