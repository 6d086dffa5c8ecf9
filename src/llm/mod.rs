//! Chat-completion client abstraction.
//!
//! Two backend families are supported: `openai`-like chat completions and
//! `anthropic`-like messages. Both expose the same capability set so the
//! planner and the interactive agent never branch on the provider.

pub mod anthropic;
pub mod openai;
pub mod util;

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::config::{EngineConfig, LlmProviderKind};
use crate::errors::{EngineError, EngineResult};
use crate::types::TokenUsage;

pub use anthropic::AnthropicClient;
pub use openai::OpenAiClient;

/// Temperature used for plan synthesis.
pub const PLANNING_TEMPERATURE: f32 = 0.1;
/// Temperature used everywhere else unless overridden.
pub const DEFAULT_TEMPERATURE: f32 = 0.7;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct CompletionOptions {
    /// Ask the provider for a strict JSON object response where supported;
    /// otherwise the request is augmented with a JSON-only instruction.
    pub json_mode: bool,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub timeout_ms: Option<u64>,
}

impl CompletionOptions {
    pub fn planning() -> Self {
        Self {
            json_mode: true,
            temperature: Some(PLANNING_TEMPERATURE),
            ..Self::default()
        }
    }
}

#[derive(Clone, Debug)]
pub struct Completion {
    pub content: String,
    pub usage: TokenUsage,
    pub model: String,
    pub finish_reason: Option<String>,
}

/// One chunk of a streamed completion.
#[derive(Clone, Debug)]
pub struct StreamChunk {
    pub chunk_content: String,
    pub cumulative_content: String,
    pub usage: Option<TokenUsage>,
    pub is_complete: bool,
}

pub type CompletionStream = Pin<Box<dyn Stream<Item = EngineResult<StreamChunk>> + Send>>;

/// Capability set shared by both provider families.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> EngineResult<Completion>;

    /// Lazy chunk sequence; restartable only by reissuing the request.
    async fn complete_stream(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> EngineResult<CompletionStream>;

    fn estimate_cost(&self, prompt_tokens: u64, completion_tokens: u64) -> f64;

    async fn test_connection(&self) -> bool;

    fn model_id(&self) -> &str;
}

/// Build the configured primary client.
pub fn client_from_config(config: &EngineConfig) -> EngineResult<Arc<dyn LlmClient>> {
    match config.provider {
        LlmProviderKind::OpenAi => {
            let key = config.openai_api_key.clone().ok_or_else(|| {
                EngineError::validation("OPENAI_API_KEY is required for the openai provider")
            })?;
            Ok(Arc::new(OpenAiClient::new(openai::OpenAiConfig {
                api_key: key,
                model: config.openai_model.clone(),
                api_base: config
                    .llm_base_url
                    .clone()
                    .unwrap_or_else(|| openai::DEFAULT_API_BASE.to_string()),
                timeout: config.llm_timeout,
            })?))
        }
        LlmProviderKind::Anthropic => {
            let key = config.anthropic_api_key.clone().ok_or_else(|| {
                EngineError::validation("ANTHROPIC_API_KEY is required for the anthropic provider")
            })?;
            Ok(Arc::new(AnthropicClient::new(anthropic::AnthropicConfig {
                api_key: key,
                model: config.anthropic_model.clone(),
                api_base: config
                    .llm_base_url
                    .clone()
                    .unwrap_or_else(|| anthropic::DEFAULT_API_BASE.to_string()),
                timeout: config.llm_timeout,
            })?))
        }
    }
}

/// Primary plus optional fallback. The fallback is the other family, built
/// only when its credentials are present; plan generation consults it when
/// the primary fails or reports low confidence.
pub fn fallback_pair(
    config: &EngineConfig,
) -> EngineResult<(Arc<dyn LlmClient>, Option<Arc<dyn LlmClient>>)> {
    let primary = client_from_config(config)?;
    let mut secondary_config = config.clone();
    secondary_config.provider = match config.provider {
        LlmProviderKind::OpenAi => LlmProviderKind::Anthropic,
        LlmProviderKind::Anthropic => LlmProviderKind::OpenAi,
    };
    let fallback = match secondary_config.provider {
        LlmProviderKind::OpenAi if secondary_config.openai_api_key.is_some() => {
            Some(client_from_config(&secondary_config)?)
        }
        LlmProviderKind::Anthropic if secondary_config.anthropic_api_key.is_some() => {
            Some(client_from_config(&secondary_config)?)
        }
        _ => None,
    };
    Ok((primary, fallback))
}

/// Split system messages from conversation messages; family-B promotes the
/// concatenated system text into its dedicated `system` field.
pub(crate) fn split_system(messages: &[ChatMessage]) -> (String, Vec<&ChatMessage>) {
    let mut system = String::new();
    let mut conversation = Vec::new();
    for message in messages {
        match message.role {
            MessageRole::System => {
                if !system.is_empty() {
                    system.push('\n');
                }
                system.push_str(&message.content);
            }
            _ => conversation.push(message),
        }
    }
    (system, conversation)
}
