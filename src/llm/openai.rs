//! Family-A ("openai"-like) chat-completions client.

use std::time::Duration;

use async_stream::try_stream;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::{EngineError, EngineResult};
use crate::types::TokenUsage;

use super::{
    ChatMessage, Completion, CompletionOptions, CompletionStream, LlmClient, MessageRole,
    StreamChunk, DEFAULT_TEMPERATURE,
};

pub const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";

/// Per-million-token pricing (input, output) used for cost estimates.
const PRICING: &[(&str, f64, f64)] = &[
    ("gpt-4o-mini", 0.15, 0.60),
    ("gpt-4o", 2.50, 10.00),
    ("gpt-4-turbo", 10.00, 30.00),
    ("gpt-3.5-turbo", 0.50, 1.50),
];

#[derive(Clone, Debug)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub model: String,
    pub api_base: String,
    pub timeout: Duration,
}

pub struct OpenAiClient {
    client: Client,
    config: OpenAiConfig,
}

/// Strict JSON output mode is only honored by a subset of models; for the
/// rest the request falls back to an explicit JSON-only instruction.
pub fn supports_json_mode(model: &str) -> bool {
    model.contains("turbo") || model.ends_with('o') || model.contains("3.5")
}

impl OpenAiClient {
    pub fn new(config: OpenAiConfig) -> EngineResult<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|err| EngineError::internal(format!("failed to build HTTP client: {err}")))?;
        Ok(Self { client, config })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/chat/completions",
            self.config.api_base.trim_end_matches('/')
        )
    }

    fn build_body(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
        stream: bool,
    ) -> ChatCompletionRequest {
        let json_native = options.json_mode && supports_json_mode(&self.config.model);
        let mut wire_messages: Vec<WireMessage> = messages
            .iter()
            .map(|message| WireMessage {
                role: role_name(message.role),
                content: message.content.clone(),
            })
            .collect();
        if options.json_mode && !json_native {
            wire_messages.push(WireMessage {
                role: "system",
                content: "Respond with a single JSON object and nothing else.".to_string(),
            });
        }
        ChatCompletionRequest {
            model: self.config.model.clone(),
            temperature: options.temperature.unwrap_or(DEFAULT_TEMPERATURE),
            max_tokens: options.max_tokens,
            response_format: json_native.then(|| ResponseFormat {
                r#type: "json_object",
            }),
            stream: stream.then_some(true),
            messages: wire_messages,
        }
    }

    async fn send(
        &self,
        body: &ChatCompletionRequest,
        timeout_ms: Option<u64>,
    ) -> EngineResult<reqwest::Response> {
        let mut request = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.config.api_key)
            .json(body);
        if let Some(ms) = timeout_ms {
            request = request.timeout(Duration::from_millis(ms));
        }
        let response = request.send().await.map_err(map_transport_error)?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok());
        let text = response
            .text()
            .await
            .unwrap_or_else(|_| "<response unavailable>".to_string());
        if status.as_u16() == 429 {
            warn!(target: "llm", provider = "openai", raw = %text, "rate limited");
            return Err(EngineError::RateLimited {
                retry_after_seconds: retry_after,
            });
        }
        Err(EngineError::Api {
            status: Some(status.as_u16()),
            code: parse_error_code(&text),
            message: format!("openai returned {status}: {text}"),
        })
    }
}

fn map_transport_error(err: reqwest::Error) -> EngineError {
    if err.is_timeout() || err.is_connect() {
        EngineError::TransportTimeout {
            message: err.to_string(),
        }
    } else {
        EngineError::Api {
            status: None,
            code: None,
            message: format!("openai request failed: {err}"),
        }
    }
}

fn parse_error_code(raw: &str) -> Option<String> {
    serde_json::from_str::<ErrorEnvelope>(raw)
        .ok()
        .and_then(|envelope| envelope.error.code)
}

fn role_name(role: MessageRole) -> &'static str {
    match role {
        MessageRole::System => "system",
        MessageRole::User => "user",
        MessageRole::Assistant => "assistant",
    }
}

#[async_trait::async_trait]
impl LlmClient for OpenAiClient {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> EngineResult<Completion> {
        let body = self.build_body(messages, options, false);
        let response = self.send(&body, options.timeout_ms).await?;
        let parsed: ChatCompletionResponse = response.json().await.map_err(|err| {
            EngineError::internal(format!("openai response invalid: {err}"))
        })?;

        let content = parsed
            .choices
            .first()
            .and_then(|choice| choice.message.content.as_text())
            .ok_or_else(|| EngineError::internal("openai response missing content"))?;
        let finish_reason = parsed
            .choices
            .first()
            .and_then(|choice| choice.finish_reason.clone());
        let usage = parsed.usage.map(token_usage).unwrap_or_default();

        Ok(Completion {
            content,
            usage,
            model: parsed.model.unwrap_or_else(|| self.config.model.clone()),
            finish_reason,
        })
    }

    async fn complete_stream(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> EngineResult<CompletionStream> {
        let body = self.build_body(messages, options, true);
        let response = self.send(&body, options.timeout_ms).await?;
        let mut bytes = response.bytes_stream();

        let stream = try_stream! {
            let mut cumulative = String::new();
            let mut buffer = String::new();
            let mut usage: Option<TokenUsage> = None;
            while let Some(chunk) = bytes.next().await {
                let chunk = chunk.map_err(|err| EngineError::TransportTimeout {
                    message: format!("stream interrupted: {err}"),
                })?;
                buffer.push_str(&String::from_utf8_lossy(&chunk));
                while let Some(line_end) = buffer.find('\n') {
                    let line = buffer[..line_end].trim().to_string();
                    buffer.drain(..=line_end);
                    let Some(payload) = line.strip_prefix("data:") else {
                        continue;
                    };
                    let payload = payload.trim();
                    if payload == "[DONE]" {
                        yield StreamChunk {
                            chunk_content: String::new(),
                            cumulative_content: cumulative.clone(),
                            usage,
                            is_complete: true,
                        };
                        return;
                    }
                    let Ok(event) = serde_json::from_str::<StreamEvent>(payload) else {
                        continue;
                    };
                    if let Some(reported) = event.usage {
                        usage = Some(token_usage(reported));
                    }
                    let delta = event
                        .choices
                        .first()
                        .and_then(|choice| choice.delta.content.clone())
                        .unwrap_or_default();
                    if delta.is_empty() {
                        continue;
                    }
                    cumulative.push_str(&delta);
                    yield StreamChunk {
                        chunk_content: delta,
                        cumulative_content: cumulative.clone(),
                        usage: None,
                        is_complete: false,
                    };
                }
            }
            yield StreamChunk {
                chunk_content: String::new(),
                cumulative_content: cumulative.clone(),
                usage,
                is_complete: true,
            };
        };
        Ok(Box::pin(stream))
    }

    fn estimate_cost(&self, prompt_tokens: u64, completion_tokens: u64) -> f64 {
        let (input_rate, output_rate) = PRICING
            .iter()
            .find(|(prefix, _, _)| self.config.model.starts_with(prefix))
            .map(|(_, input, output)| (*input, *output))
            .unwrap_or((2.50, 10.00));
        prompt_tokens as f64 / 1e6 * input_rate + completion_tokens as f64 / 1e6 * output_rate
    }

    async fn test_connection(&self) -> bool {
        let probe = [ChatMessage::user("ping")];
        let options = CompletionOptions {
            max_tokens: Some(1),
            ..CompletionOptions::default()
        };
        self.complete(&probe, &options).await.is_ok()
    }

    fn model_id(&self) -> &str {
        &self.config.model
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
    messages: Vec<WireMessage>,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    r#type: &'static str,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<WireUsage>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: MessageContent,
}

/// Providers occasionally return content as parts rather than a bare string.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    fn as_text(&self) -> Option<String> {
        match self {
            MessageContent::Text(value) => Some(value.clone()),
            MessageContent::Parts(parts) => {
                let text = parts
                    .iter()
                    .filter_map(|part| part.text.as_ref())
                    .cloned()
                    .collect::<Vec<_>>()
                    .join("\n");
                (!text.is_empty()).then_some(text)
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct ContentPart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
}

fn token_usage(wire: WireUsage) -> TokenUsage {
    let total = if wire.total_tokens > 0 {
        wire.total_tokens
    } else {
        wire.prompt_tokens + wire.completion_tokens
    };
    TokenUsage {
        prompt_tokens: wire.prompt_tokens,
        completion_tokens: wire.completion_tokens,
        total_tokens: total,
    }
}

#[derive(Debug, Deserialize)]
struct StreamEvent {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_mode_gating_matches_model_families() {
        assert!(supports_json_mode("gpt-4-turbo"));
        assert!(supports_json_mode("gpt-4o"));
        assert!(supports_json_mode("gpt-3.5-turbo-16k"));
        assert!(!supports_json_mode("gpt-4"));
        assert!(!supports_json_mode("davinci-002"));
    }

    #[test]
    fn cost_estimate_uses_model_pricing() {
        let client = OpenAiClient::new(OpenAiConfig {
            api_key: "sk-test".into(),
            model: "gpt-4o-mini".into(),
            api_base: DEFAULT_API_BASE.into(),
            timeout: Duration::from_secs(5),
        })
        .unwrap();
        let cost = client.estimate_cost(1_000_000, 1_000_000);
        assert!((cost - 0.75).abs() < 1e-9);
    }

    #[test]
    fn content_parts_are_flattened() {
        let content = MessageContent::Parts(vec![
            ContentPart {
                text: Some("a".into()),
            },
            ContentPart { text: None },
            ContentPart {
                text: Some("b".into()),
            },
        ]);
        assert_eq!(content.as_text().as_deref(), Some("a\nb"));
    }

    #[test]
    fn unsupported_models_get_json_instruction_message() {
        let client = OpenAiClient::new(OpenAiConfig {
            api_key: "sk-test".into(),
            model: "gpt-4".into(),
            api_base: DEFAULT_API_BASE.into(),
            timeout: Duration::from_secs(5),
        })
        .unwrap();
        let body = client.build_body(
            &[ChatMessage::user("plan this")],
            &CompletionOptions {
                json_mode: true,
                ..CompletionOptions::default()
            },
            false,
        );
        assert!(body.response_format.is_none());
        assert!(body
            .messages
            .last()
            .unwrap()
            .content
            .contains("JSON object"));
    }
}
