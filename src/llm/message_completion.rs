//! Provider B: the message-completion track (`POST /messages`,
//! Anthropic-style). No native JSON mode; json_mode appends a terminal
//! instruction to the prompt instead. Grounded on the request/response shape
//! used by the teacher's Opus provider.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{GenerateOutput, GenerateParams, LlmProvider};
use crate::error::{AppError, AppResult};

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const REQUEST_TIMEOUT_SECS: u64 = 120;
const JSON_MODE_SUFFIX: &str = "\n\nRespond with valid JSON only.";

pub struct MessageCompletionProvider {
    client: Client,
    api_key: String,
}

impl MessageCompletionProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
                .build()
                .expect("reqwest client builds with static config"),
            api_key: api_key.into(),
        }
    }

    pub fn from_env() -> AppResult<Self> {
        let api_key = std::env::var("ANTHROPIC_API_KEY")
            .map_err(|_| AppError::Config("ANTHROPIC_API_KEY not set".to_string()))?;
        Ok(Self::new(api_key))
    }
}

#[derive(Serialize)]
struct AnthropicMessage {
    role: &'static str,
    content: String,
}

#[derive(Serialize)]
struct AnthropicRequest {
    model: String,
    system: String,
    messages: Vec<AnthropicMessage>,
    max_tokens: u32,
    temperature: f64,
}

#[derive(Deserialize)]
struct AnthropicContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    text: Option<String>,
}

#[derive(Deserialize)]
struct AnthropicUsage {
    input_tokens: Option<u32>,
    output_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContentBlock>,
    usage: Option<AnthropicUsage>,
}

#[derive(Deserialize)]
struct AnthropicErrorBody {
    error: AnthropicErrorDetail,
}

#[derive(Deserialize)]
struct AnthropicErrorDetail {
    message: String,
}

#[async_trait]
impl LlmProvider for MessageCompletionProvider {
    async fn generate_once(&self, params: &GenerateParams) -> AppResult<GenerateOutput> {
        let prompt = if params.json_mode {
            format!("{}{}", params.prompt, JSON_MODE_SUFFIX)
        } else {
            params.prompt.clone()
        };

        let request = AnthropicRequest {
            model: params.model.clone(),
            system: params.system.clone(),
            messages: vec![AnthropicMessage {
                role: "user",
                content: prompt,
            }],
            max_tokens: params.max_tokens,
            temperature: params.temperature,
        };

        let resp = self
            .client
            .post(ANTHROPIC_API_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&request)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            if status.is_server_error() || status.as_u16() == 429 {
                return Err(AppError::Transient(format!("provider B {status}: {body}")));
            }
            let message = serde_json::from_str::<AnthropicErrorBody>(&body)
                .map(|b| b.error.message)
                .unwrap_or(body);
            return Err(AppError::Parse(format!("provider B rejected request ({status}): {message}")));
        }

        let parsed: AnthropicResponse = resp.json().await.map_err(AppError::from)?;
        let text = parsed
            .content
            .into_iter()
            .filter(|b| b.block_type == "text")
            .filter_map(|b| b.text)
            .collect::<Vec<_>>()
            .join("")
            .trim()
            .to_string();

        Ok(GenerateOutput {
            text,
            input_tokens: parsed.usage.as_ref().and_then(|u| u.input_tokens),
            output_tokens: parsed.usage.as_ref().and_then(|u| u.output_tokens),
        })
    }
}
