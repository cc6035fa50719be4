use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::config::{LlmConfig, Provider};
use crate::error::{ChainError, ConfigError, LlmError};

/// Result of one JSON-mode model call
#[derive(Debug, Clone, PartialEq)]
pub struct LlmCall {
    /// Parsed JSON object, empty when the model returned anything else
    pub payload: Map<String, Value>,
    pub raw: String,
    pub tokens: u64,
    pub cost_est: f64,
    pub model: String,
}

/// Abstract model call used by LLM-backed steps
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Send a prompt and ask for a JSON object back
    async fn call_json(&self, prompt: &str) -> Result<LlmCall, LlmError>;

    fn model(&self) -> &str;
}

/// Parse model output as a JSON object, degrading to an empty map
pub fn extract_json_payload(raw: &str) -> Map<String, Value> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Map::new();
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

/// Cost estimate for a token count at a per-1000-token rate
pub fn estimate_cost(tokens: u64, rate_per_1k: f64) -> f64 {
    round_to((tokens as f64 / 1000.0) * rate_per_1k, 6)
}

pub(crate) fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

/// Deterministic offline backend
pub struct MockLlm {
    model: String,
}

impl MockLlm {
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
        }
    }

    fn canned_payload() -> Value {
        serde_json::json!({
            "analysis": "Mock chain step analysis generated.",
            "hypotheses": [
                "Recent partner mix shifted away from historically dominant themes.",
                "Opportunity scoring changed due to lower quality inbound demand.",
                "A short-term seasonal effect is suppressing current run scores.",
            ],
            "recommended_next_steps": [
                "Review partner-level score deltas for the last three runs.",
                "Validate any scoring rubric changes introduced recently.",
            ],
            "confidence": 0.62,
        })
    }
}

#[async_trait]
impl LlmBackend for MockLlm {
    async fn call_json(&self, _prompt: &str) -> Result<LlmCall, LlmError> {
        let payload = Self::canned_payload();
        let raw = payload.to_string();
        let payload = match payload {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Ok(LlmCall {
            payload,
            raw,
            tokens: 0,
            cost_est: 0.0,
            model: self.model.clone(),
        })
    }

    fn model(&self) -> &str {
        &self.model
    }
}

/// Where a chat-completions request goes and how it authenticates
#[derive(Debug, Clone)]
enum Endpoint {
    OpenAi { api_key: String },
    Azure { url: String, api_key: String },
}

const OPENAI_CHAT_URL: &str = "https://api.openai.com/v1/chat/completions";

/// Client for OpenAI-compatible chat-completions endpoints
pub struct ChatCompletionsClient {
    client: Client,
    endpoint: Endpoint,
    model: String,
    cost_per_1k_tokens: f64,
}

#[derive(Debug, Clone, Serialize)]
struct ChatRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
    temperature: f64,
    seed: u64,
    response_format: ResponseFormat,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Debug, Clone, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
}

#[derive(Debug, Clone, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Debug, Clone, Deserialize)]
struct Choice {
    message: Option<ResponseMessage>,
}

#[derive(Debug, Clone, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    total_tokens: Option<u64>,
}

impl Usage {
    fn total(&self) -> u64 {
        self.total_tokens
            .filter(|t| *t > 0)
            .unwrap_or(self.prompt_tokens + self.completion_tokens)
    }
}

impl ChatCompletionsClient {
    /// Build a client for the configured hosted provider. Expects a config
    /// already checked by [`LlmConfig::validate`].
    pub fn from_config(config: &LlmConfig) -> Result<Self, ChainError> {
        let endpoint = match config.provider {
            Provider::OpenAi => Endpoint::OpenAi {
                api_key: config.api_key.trim().to_string(),
            },
            Provider::Azure => {
                let base = config.azure_endpoint.trim().trim_end_matches('/');
                Endpoint::Azure {
                    url: format!(
                        "{}/openai/deployments/{}/chat/completions?api-version={}",
                        base,
                        config.azure_deployment.trim(),
                        config.azure_api_version.trim()
                    ),
                    api_key: config.api_key.trim().to_string(),
                }
            }
            Provider::Mock => {
                return Err(ConfigError::InvalidValue {
                    key: "provider".to_string(),
                    value: "mock".to_string(),
                }
                .into())
            }
        };
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds.max(1)))
            .build()
            .map_err(LlmError::from)?;
        let model = match config.provider {
            Provider::Azure => config.azure_deployment.trim().to_string(),
            _ => config.model.trim().to_string(),
        };
        Ok(Self {
            client,
            endpoint,
            model,
            cost_per_1k_tokens: config.cost_per_1k_tokens,
        })
    }

    fn request_body<'a>(&'a self, prompt: &'a str) -> ChatRequest<'a> {
        ChatRequest {
            model: match self.endpoint {
                Endpoint::OpenAi { .. } => Some(self.model.as_str()),
                Endpoint::Azure { .. } => None,
            },
            temperature: 0.0,
            seed: 0,
            response_format: ResponseFormat {
                format_type: "json_object",
            },
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
        }
    }
}

#[async_trait]
impl LlmBackend for ChatCompletionsClient {
    async fn call_json(&self, prompt: &str) -> Result<LlmCall, LlmError> {
        let request = match &self.endpoint {
            Endpoint::OpenAi { api_key } => self
                .client
                .post(OPENAI_CHAT_URL)
                .header("Authorization", format!("Bearer {}", api_key)),
            Endpoint::Azure { url, api_key } => {
                self.client.post(url.as_str()).header("api-key", api_key)
            }
        };

        info!(
            model = %self.model,
            prompt_length = prompt.len(),
            "sending LLM request"
        );

        let response = request
            .header("Content-Type", "application/json")
            .json(&self.request_body(prompt))
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(LlmError::Http {
                status: status.as_u16(),
                body: body.chars().take(500).collect(),
            });
        }

        let chat: ChatResponse = serde_json::from_str(&body)
            .map_err(|e| LlmError::UnexpectedResponse(e.to_string()))?;
        let raw = chat
            .choices
            .first()
            .and_then(|c| c.message.as_ref())
            .and_then(|m| m.content.clone())
            .unwrap_or_else(|| "{}".to_string());
        let tokens = chat.usage.unwrap_or_default().total();

        info!(model = %self.model, tokens, "LLM response received");

        Ok(LlmCall {
            payload: extract_json_payload(&raw),
            raw,
            tokens,
            cost_est: estimate_cost(tokens, self.cost_per_1k_tokens),
            model: self.model.clone(),
        })
    }

    fn model(&self) -> &str {
        &self.model
    }
}

/// Validate the LLM config and build the matching backend
pub fn backend_from_config(config: &LlmConfig) -> Result<Arc<dyn LlmBackend>, ChainError> {
    config.validate()?;
    match config.provider {
        Provider::Mock => Ok(Arc::new(MockLlm::new(&config.model))),
        Provider::OpenAi | Provider::Azure => {
            Ok(Arc::new(ChatCompletionsClient::from_config(config)?))
        }
    }
}
