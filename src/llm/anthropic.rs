//! Family-B ("anthropic"-like) messages client.
//!
//! No native JSON output mode exists; JSON is enforced with an explicit
//! instruction and parsed defensively downstream. System messages are
//! concatenated and promoted into the dedicated `system` field.

use std::time::Duration;

use async_stream::try_stream;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::{EngineError, EngineResult};
use crate::types::TokenUsage;

use super::{
    split_system, ChatMessage, Completion, CompletionOptions, CompletionStream, LlmClient,
    MessageRole, StreamChunk, DEFAULT_TEMPERATURE,
};

pub const DEFAULT_API_BASE: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4_096;
const JSON_ONLY_INSTRUCTION: &str =
    "Respond with a single valid JSON object only. No prose, no markdown fences.";

/// Per-million-token pricing (input, output) used for cost estimates.
const PRICING: &[(&str, f64, f64)] = &[
    ("claude-3-5-sonnet", 3.00, 15.00),
    ("claude-3-5-haiku", 0.80, 4.00),
    ("claude-3-opus", 15.00, 75.00),
    ("claude-3-haiku", 0.25, 1.25),
];

#[derive(Clone, Debug)]
pub struct AnthropicConfig {
    pub api_key: String,
    pub model: String,
    pub api_base: String,
    pub timeout: Duration,
}

pub struct AnthropicClient {
    client: Client,
    config: AnthropicConfig,
}

impl AnthropicClient {
    pub fn new(config: AnthropicConfig) -> EngineResult<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|err| EngineError::internal(format!("failed to build HTTP client: {err}")))?;
        Ok(Self { client, config })
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/messages", self.config.api_base.trim_end_matches('/'))
    }

    fn build_body(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
        stream: bool,
    ) -> MessagesRequest {
        let (mut system, conversation) = split_system(messages);
        if options.json_mode {
            if !system.is_empty() {
                system.push('\n');
            }
            system.push_str(JSON_ONLY_INSTRUCTION);
        }
        let wire_messages = conversation
            .iter()
            .map(|message| WireMessage {
                role: match message.role {
                    MessageRole::Assistant => "assistant",
                    _ => "user",
                },
                content: message.content.clone(),
            })
            .collect();
        MessagesRequest {
            model: self.config.model.clone(),
            max_tokens: options.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            temperature: options.temperature.unwrap_or(DEFAULT_TEMPERATURE),
            system: (!system.is_empty()).then_some(system),
            stream: stream.then_some(true),
            messages: wire_messages,
        }
    }

    async fn send(
        &self,
        body: &MessagesRequest,
        timeout_ms: Option<u64>,
    ) -> EngineResult<reqwest::Response> {
        let mut request = self
            .client
            .post(self.endpoint())
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", API_VERSION)
            .json(body);
        if let Some(ms) = timeout_ms {
            request = request.timeout(Duration::from_millis(ms));
        }
        let response = request.send().await.map_err(|err| {
            if err.is_timeout() || err.is_connect() {
                EngineError::TransportTimeout {
                    message: err.to_string(),
                }
            } else {
                EngineError::Api {
                    status: None,
                    code: None,
                    message: format!("anthropic request failed: {err}"),
                }
            }
        })?;

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
            warn!(target: "llm", provider = "anthropic", raw = %text, "rate limited");
            return Err(EngineError::RateLimited {
                retry_after_seconds: retry_after,
            });
        }
        Err(EngineError::Api {
            status: Some(status.as_u16()),
            code: None,
            message: format!("anthropic returned {status}: {text}"),
        })
    }
}

#[async_trait::async_trait]
impl LlmClient for AnthropicClient {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> EngineResult<Completion> {
        let body = self.build_body(messages, options, false);
        let response = self.send(&body, options.timeout_ms).await?;
        let parsed: MessagesResponse = response.json().await.map_err(|err| {
            EngineError::internal(format!("anthropic response invalid: {err}"))
        })?;

        let content = parsed
            .content
            .iter()
            .filter_map(|block| block.text.as_ref())
            .cloned()
            .collect::<Vec<_>>()
            .join("\n");
        if content.is_empty() {
            return Err(EngineError::internal("anthropic response missing content"));
        }

        Ok(Completion {
            content,
            usage: parsed.usage.map(token_usage).unwrap_or_default(),
            model: parsed.model.unwrap_or_else(|| self.config.model.clone()),
            finish_reason: parsed.stop_reason,
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
                    let Ok(event) = serde_json::from_str::<StreamEvent>(payload.trim()) else {
                        continue;
                    };
                    match event.kind.as_str() {
                        "content_block_delta" => {
                            let delta = event
                                .delta
                                .and_then(|delta| delta.text)
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
                        "message_delta" => {
                            if let Some(reported) = event.usage {
                                usage = Some(token_usage(reported));
                            }
                        }
                        "message_stop" => {
                            yield StreamChunk {
                                chunk_content: String::new(),
                                cumulative_content: cumulative.clone(),
                                usage,
                                is_complete: true,
                            };
                            return;
                        }
                        _ => {}
                    }
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
            .unwrap_or((3.00, 15.00));
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
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
    messages: Vec<WireMessage>,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Option<WireUsage>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

fn token_usage(wire: WireUsage) -> TokenUsage {
    TokenUsage {
        prompt_tokens: wire.input_tokens,
        completion_tokens: wire.output_tokens,
        total_tokens: wire.input_tokens + wire.output_tokens,
    }
}

#[derive(Debug, Deserialize)]
struct StreamEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    delta: Option<StreamDelta>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    text: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_client() -> AnthropicClient {
        AnthropicClient::new(AnthropicConfig {
            api_key: "ak-test".into(),
            model: "claude-3-5-sonnet-20241022".into(),
            api_base: DEFAULT_API_BASE.into(),
            timeout: Duration::from_secs(5),
        })
        .unwrap()
    }

    #[test]
    fn json_mode_appends_instruction_to_system() {
        let client = test_client();
        let body = client.build_body(
            &[
                ChatMessage::system("You plan browser steps."),
                ChatMessage::user("plan this"),
            ],
            &CompletionOptions {
                json_mode: true,
                ..CompletionOptions::default()
            },
            false,
        );
        let system = body.system.expect("system");
        assert!(system.starts_with("You plan browser steps."));
        assert!(system.contains("JSON object only"));
        assert_eq!(body.messages.len(), 1);
    }

    #[test]
    fn cost_estimate_uses_model_pricing() {
        let client = test_client();
        let cost = client.estimate_cost(1_000_000, 1_000_000);
        assert!((cost - 18.0).abs() < 1e-9);
    }
}
