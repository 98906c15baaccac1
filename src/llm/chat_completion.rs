//! Provider A: the chat-completion track (`POST /chat/completions`,
//! OpenAI-style). Native JSON mode via `response_format`. The only provider
//! family that implements `embed`.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{GenerateOutput, GenerateParams, LlmProvider};
use crate::error::{AppError, AppResult};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const REQUEST_TIMEOUT_SECS: u64 = 120;

pub struct ChatCompletionProvider {
    client: Client,
    api_key: String,
    base_url: String,
}

impl ChatCompletionProvider {
    pub fn new(api_key: impl Into<String>, base_url: Option<String>) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
                .build()
                .expect("reqwest client builds with static config"),
            api_key: api_key.into(),
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        }
    }

    pub fn from_env() -> AppResult<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| AppError::Config("OPENAI_API_KEY not set".to_string()))?;
        let base_url = std::env::var("LLM_BASE_URL").ok();
        Ok(Self::new(api_key, base_url))
    }
}

#[derive(Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f64,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatUsage {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatErrorBody {
    error: ChatErrorDetail,
}

#[derive(Deserialize)]
struct ChatErrorDetail {
    message: String,
}

#[derive(Serialize)]
struct EmbeddingRequest {
    model: String,
    input: String,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

#[async_trait]
impl LlmProvider for ChatCompletionProvider {
    async fn generate_once(&self, params: &GenerateParams) -> AppResult<GenerateOutput> {
        let mut messages = vec![ChatMessage {
            role: "system",
            content: params.system.clone(),
        }];
        let mut user_content = params.prompt.clone();
        let response_format = if params.json_mode {
            Some(ResponseFormat { kind: "json_object" })
        } else {
            None
        };
        // response_format is native here, so unlike the message-completion
        // track we never need to append a terminal JSON instruction.
        if params.json_mode && user_content.is_empty() {
            user_content = "Respond with valid JSON only.".to_string();
        }
        messages.push(ChatMessage {
            role: "user",
            content: user_content,
        });

        let request = ChatRequest {
            model: params.model.clone(),
            messages,
            temperature: params.temperature,
            max_tokens: params.max_tokens,
            response_format,
        };

        let resp = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            if status.is_server_error() || status.as_u16() == 429 {
                return Err(AppError::Transient(format!("provider A {status}: {body}")));
            }
            let message = serde_json::from_str::<ChatErrorBody>(&body)
                .map(|b| b.error.message)
                .unwrap_or(body);
            return Err(AppError::Parse(format!("provider A rejected request ({status}): {message}")));
        }

        let parsed: ChatResponse = resp.json().await.map_err(AppError::from)?;
        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default()
            .trim()
            .to_string();

        Ok(GenerateOutput {
            text,
            input_tokens: parsed.usage.as_ref().and_then(|u| u.prompt_tokens),
            output_tokens: parsed.usage.as_ref().and_then(|u| u.completion_tokens),
        })
    }

    async fn embed_once(&self, text: &str, model: &str) -> AppResult<Vec<f32>> {
        let request = EmbeddingRequest {
            model: model.to_string(),
            input: text.replace('\n', " "),
        };
        let resp = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            if status.is_server_error() || status.as_u16() == 429 {
                return Err(AppError::Transient(format!("embedding provider {status}: {body}")));
            }
            return Err(AppError::Parse(format!("embedding request rejected ({status}): {body}")));
        }

        let parsed: EmbeddingResponse = resp.json().await.map_err(AppError::from)?;
        parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| AppError::Parse("embedding response had no data".to_string()))
    }
}
