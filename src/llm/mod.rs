//! The LLM capability layer: a provider-agnostic `generate`/`embed` surface
//! over two concrete provider families, selected by a model-name heuristic so
//! that nothing above this layer ever branches on which vendor is serving a
//! given model name.

mod chat_completion;
mod message_completion;

pub use chat_completion::ChatCompletionProvider;
pub use message_completion::MessageCompletionProvider;

use async_trait::async_trait;
use std::time::Duration;

use crate::error::{AppError, AppResult};

#[derive(Debug, Clone)]
pub struct GenerateParams {
    pub prompt: String,
    pub system: String,
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub json_mode: bool,
}

impl GenerateParams {
    pub fn new(prompt: impl Into<String>, system: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            system: system.into(),
            model: model.into(),
            temperature: 0.7,
            max_tokens: 1024,
            json_mode: false,
        }
    }

    pub fn with_temperature(mut self, t: f64) -> Self {
        self.temperature = t;
        self
    }

    pub fn with_max_tokens(mut self, n: u32) -> Self {
        self.max_tokens = n;
        self
    }

    pub fn with_json_mode(mut self, json_mode: bool) -> Self {
        self.json_mode = json_mode;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct GenerateOutput {
    pub text: String,
    pub input_tokens: Option<u32>,
    pub output_tokens: Option<u32>,
}

/// A single provider family's HTTP surface. Implementations never retry
/// themselves; retry/backoff is applied uniformly by [`LlmClient`].
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn generate_once(&self, params: &GenerateParams) -> AppResult<GenerateOutput>;

    /// Only the chat-completion track (provider A) implements embeddings.
    async fn embed_once(&self, _text: &str, _model: &str) -> AppResult<Vec<f32>> {
        Err(AppError::Config(
            "embeddings are only available on the chat-completion provider".to_string(),
        ))
    }
}

/// Picks provider B (message-completion / Anthropic-style) when the model
/// name looks like a Claude family model, else provider A (chat-completion /
/// OpenAI-style). Mirrors the heuristic in spec.md 4.1 exactly.
pub fn is_message_completion_model(model: &str) -> bool {
    let lower = model.to_lowercase();
    ["claude", "sonnet", "opus", "haiku"]
        .iter()
        .any(|needle| lower.contains(needle))
}

/// Retry policy: base 4s, cap 10s, factor x1 (i.e. doubling each attempt,
/// capped), up to 3 attempts total. Only `Transient` errors are retried;
/// anything else (parse/config/4xx semantic errors) surfaces immediately.
const MAX_ATTEMPTS: u32 = 3;
const BASE_BACKOFF_SECS: u64 = 4;
const MAX_BACKOFF_SECS: u64 = 10;

fn backoff_for_attempt(attempt: u32) -> Duration {
    let secs = BASE_BACKOFF_SECS.saturating_mul(1u64 << (attempt.saturating_sub(1)));
    Duration::from_secs(secs.min(MAX_BACKOFF_SECS))
}

/// The two-provider capability layer exposed to the rest of the crate.
/// Holds one instance of each provider family behind a trait object so that
/// tests can substitute scripted doubles; `generate`/`embed` dispatch to
/// whichever family the requested model belongs to.
pub struct LlmClient {
    chat: Box<dyn LlmProvider>,
    message: Option<Box<dyn LlmProvider>>,
}

impl LlmClient {
    pub fn new(chat: ChatCompletionProvider, message: Option<MessageCompletionProvider>) -> Self {
        Self {
            chat: Box::new(chat),
            message: message.map(|m| Box::new(m) as Box<dyn LlmProvider>),
        }
    }

    /// Test-only constructor accepting arbitrary provider doubles for both
    /// families, bypassing the model-name heuristic's concrete types.
    #[cfg(test)]
    pub fn for_test(chat: impl LlmProvider + 'static, message: impl LlmProvider + 'static) -> Self {
        Self {
            chat: Box::new(chat),
            message: Some(Box::new(message)),
        }
    }

    fn provider_for(&self, model: &str) -> AppResult<&dyn LlmProvider> {
        if is_message_completion_model(model) {
            self.message
                .as_deref()
                .ok_or_else(|| AppError::Config(format!("no message-completion provider configured for model {model}")))
        } else {
            Ok(self.chat.as_ref())
        }
    }

    /// Generates text, retrying transient failures with exponential backoff
    /// (4s, 8s, 10s-capped) up to 3 attempts. Non-transient errors (parse,
    /// config, 4xx semantic errors) are not retried.
    pub async fn generate(&self, params: GenerateParams) -> AppResult<GenerateOutput> {
        let provider = self.provider_for(&params.model)?;
        let mut last_err = None;
        for attempt in 1..=MAX_ATTEMPTS {
            match provider.generate_once(&params).await {
                Ok(output) => {
                    match (output.input_tokens, output.output_tokens) {
                        (Some(i), Some(o)) => {
                            tracing::info!(tokens.input = i, tokens.output = o, model = %params.model, "llm generation token usage");
                        }
                        _ => tracing::debug!(model = %params.model, "llm generation reported no token usage"),
                    }
                    return Ok(output);
                }
                Err(AppError::Transient(msg)) => {
                    tracing::warn!(attempt, %msg, model = %params.model, "transient llm failure, retrying");
                    last_err = Some(AppError::Transient(msg));
                    if attempt < MAX_ATTEMPTS {
                        tokio::time::sleep(backoff_for_attempt(attempt)).await;
                    }
                }
                Err(other) => return Err(other),
            }
        }
        Err(last_err.unwrap_or_else(|| AppError::Transient("llm generation retries exhausted".to_string())))
    }

    /// Embeddings are provider-A-only; fails with `ConfigError` if only a
    /// message-completion provider is configured for the requested model.
    pub async fn embed(&self, text: &str, model: &str) -> AppResult<Vec<f32>> {
        let mut last_err = None;
        for attempt in 1..=MAX_ATTEMPTS {
            match self.chat.embed_once(text, model).await {
                Ok(v) => return Ok(v),
                Err(AppError::Transient(msg)) => {
                    tracing::warn!(attempt, %msg, "transient embedding failure, retrying");
                    last_err = Some(AppError::Transient(msg));
                    if attempt < MAX_ATTEMPTS {
                        tokio::time::sleep(backoff_for_attempt(attempt)).await;
                    }
                }
                Err(other) => return Err(other),
            }
        }
        Err(last_err.unwrap_or_else(|| AppError::Transient("embedding retries exhausted".to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heuristic_routes_claude_family_to_message_completion() {
        assert!(is_message_completion_model("claude-3-5-sonnet"));
        assert!(is_message_completion_model("Claude-Opus-4.5"));
        assert!(is_message_completion_model("anthropic-haiku"));
        assert!(!is_message_completion_model("gpt-4o"));
        assert!(!is_message_completion_model("gpt-4o-mini"));
    }

    #[test]
    fn backoff_sequence_matches_base4_cap10() {
        assert_eq!(backoff_for_attempt(1), Duration::from_secs(4));
        assert_eq!(backoff_for_attempt(2), Duration::from_secs(8));
        assert_eq!(backoff_for_attempt(3), Duration::from_secs(10));
    }
}
