use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::info;

use crate::protocol::ToolDescriptor;

/// LLM client for calling language models via Anthropic-compatible API,
/// with tool definitions attached to every request.
pub struct LlmClient {
    client: Client,
    base_url: String,
    api_key: String,
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("llm http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("llm api error {status}: {message}")]
    Api { status: u16, message: String },
    #[error("llm decode error: {0}")]
    Decode(#[from] serde_json::Error),
}

/// One conversation message. `content` is either a plain string or an
/// array of content blocks, exactly as the API accepts both.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: Value,
}

impl Message {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: Value::String(text.into()),
        }
    }

    pub fn assistant_blocks(blocks: &[ContentBlock]) -> Self {
        Self {
            role: "assistant".to_string(),
            content: serde_json::to_value(blocks).unwrap_or(Value::Null),
        }
    }

    pub fn user_blocks(blocks: Vec<Value>) -> Self {
        Self {
            role: "user".to_string(),
            content: Value::Array(blocks),
        }
    }
}

/// Tool definition in the chat API's format.
#[derive(Debug, Clone, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

impl From<&ToolDescriptor> for ToolSpec {
    fn from(tool: &ToolDescriptor) -> Self {
        Self {
            name: tool.name.clone(),
            description: tool.description.clone(),
            input_schema: tool.input_schema.clone(),
        }
    }
}

/// Response content block. Kept permissive: unknown block kinds carry
/// through without failing the whole response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentBlock {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelRequest {
    pub model: String,
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelResponse {
    pub content: Vec<ContentBlock>,
    #[serde(default)]
    pub stop_reason: Option<String>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

impl ModelResponse {
    /// Concatenated text of all text blocks.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter(|b| b.kind == "text")
            .filter_map(|b| b.text.as_deref())
            .collect()
    }

    pub fn wants_tools(&self) -> bool {
        self.stop_reason.as_deref() == Some("tool_use")
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ErrorResponse {
    #[serde(default)]
    error: Option<ErrorDetail>,
    #[serde(default)]
    msg: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    message: Option<String>,
}

/// Token usage reported for a single API call.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
}

/// Usage accumulated across the calls of one tool loop.
#[derive(Debug, Clone, Default)]
pub struct UsageTotals {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_input_tokens: u64,
    pub cache_read_input_tokens: u64,
}

impl UsageTotals {
    pub fn accumulate(&mut self, usage: &Usage) {
        self.input_tokens += usage.input_tokens;
        self.output_tokens += usage.output_tokens;
        self.cache_creation_input_tokens += usage.cache_creation_input_tokens;
        self.cache_read_input_tokens += usage.cache_read_input_tokens;
    }

    /// Compact usage payload for client display.
    pub fn summary(&self, model: &str) -> UsageSummary {
        UsageSummary {
            model: model.to_string(),
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            cache_creation_input_tokens: self.cache_creation_input_tokens,
            cache_read_input_tokens: self.cache_read_input_tokens,
            total_tokens: self.input_tokens
                + self.output_tokens
                + self.cache_creation_input_tokens
                + self.cache_read_input_tokens,
            estimated_cost_usd: estimate_cost_usd(model, self),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageSummary {
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_input_tokens: u64,
    pub cache_read_input_tokens: u64,
    pub total_tokens: u64,
    pub estimated_cost_usd: Option<f64>,
}

/// Approximate model pricing in USD per 1M tokens (input, output).
const MODEL_PRICING_PER_MTOKEN: &[(&str, f64, f64)] = &[
    ("claude-haiku-4-5-20251001", 1.0, 5.0),
    ("claude-sonnet-4-5-20250929", 3.0, 15.0),
    ("claude-opus-4-6", 15.0, 75.0),
];

/// Estimate request cost from token usage and model pricing. Unknown
/// models get no estimate. Cached-read token pricing is ignored for
/// simplicity; cache-creation tokens count as input.
pub fn estimate_cost_usd(model: &str, totals: &UsageTotals) -> Option<f64> {
    let (_, input_price, output_price) = MODEL_PRICING_PER_MTOKEN
        .iter()
        .find(|(m, _, _)| *m == model)?;
    let input_tokens = totals.input_tokens + totals.cache_creation_input_tokens;
    let cost = (input_tokens as f64 * input_price + totals.output_tokens as f64 * output_price)
        / 1_000_000.0;
    Some((cost * 1_000_000.0).round() / 1_000_000.0)
}

/// Seam for the streaming pipeline: tests substitute scripted responses.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn complete(&self, request: &ModelRequest) -> Result<ModelResponse, LlmError>;
}

impl LlmClient {
    pub fn new(base_url: &str, api_key: &str) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(120))
                .build()
                .expect("failed to create HTTP client"),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }

    /// Create client from environment variables.
    pub fn from_env() -> Option<Self> {
        let base_url = std::env::var("LLM_BASE_URL")
            .unwrap_or_else(|_| "https://api.anthropic.com".to_string());
        let api_key = std::env::var("LLM_API_KEY").ok()?;
        Some(Self::new(&base_url, &api_key))
    }
}

#[async_trait]
impl ModelClient for LlmClient {
    async fn complete(&self, request: &ModelRequest) -> Result<ModelResponse, LlmError> {
        let url = format!("{}/v1/messages", self.base_url);

        info!(
            model = %request.model,
            messages = request.messages.len(),
            tools = request.tools.len(),
            "sending LLM request"
        );

        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(request)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            let message = serde_json::from_str::<ErrorResponse>(&body)
                .ok()
                .and_then(|err| err.msg.or_else(|| err.error.and_then(|e| e.message)))
                .unwrap_or(body);
            return Err(LlmError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: ModelResponse = serde_json::from_str(&body)?;
        if let Some(usage) = &parsed.usage {
            info!(
                model = %request.model,
                input_tokens = usage.input_tokens,
                output_tokens = usage.output_tokens,
                "LLM response received"
            );
        }
        Ok(parsed)
    }
}
