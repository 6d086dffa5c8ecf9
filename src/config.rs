//! Environment-driven engine configuration.
//!
//! Every key is read once at startup; absence falls back to a documented
//! default. `DATABASE_URL` is the switch between the durable store and the
//! in-memory fallback.

use std::path::PathBuf;
use std::time::Duration;

/// Which chat-completion family serves as the primary provider.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LlmProviderKind {
    OpenAi,
    Anthropic,
}

impl LlmProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LlmProviderKind::OpenAi => "openai",
            LlmProviderKind::Anthropic => "anthropic",
        }
    }
}

#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Durable store location; `None` activates the in-memory backends.
    pub database_url: Option<String>,
    pub provider: LlmProviderKind,
    pub openai_api_key: Option<String>,
    pub anthropic_api_key: Option<String>,
    pub openai_model: String,
    pub anthropic_model: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub llm_timeout: Duration,
    pub llm_base_url: Option<String>,
    /// Default step/navigation timeout.
    pub browser_timeout: Duration,
    pub cache_ttl_days: i64,
    /// Informational only.
    pub environment: String,
    pub headless: bool,
    pub chrome_executable: Option<PathBuf>,
    pub prompt_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            provider: LlmProviderKind::OpenAi,
            openai_api_key: None,
            anthropic_api_key: None,
            openai_model: "gpt-4o".to_string(),
            anthropic_model: "claude-3-5-sonnet-20241022".to_string(),
            temperature: None,
            max_tokens: None,
            llm_timeout: Duration::from_millis(30_000),
            llm_base_url: None,
            browser_timeout: Duration::from_millis(30_000),
            cache_ttl_days: 7,
            environment: "development".to_string(),
            headless: true,
            chrome_executable: None,
            prompt_dir: None,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: env_trimmed("DATABASE_URL"),
            provider: match env_trimmed("LLM_PROVIDER").as_deref() {
                Some("anthropic") => LlmProviderKind::Anthropic,
                _ => LlmProviderKind::OpenAi,
            },
            openai_api_key: env_trimmed("OPENAI_API_KEY"),
            anthropic_api_key: env_trimmed("ANTHROPIC_API_KEY"),
            openai_model: env_trimmed("OPENAI_MODEL").unwrap_or(defaults.openai_model),
            anthropic_model: env_trimmed("ANTHROPIC_MODEL").unwrap_or(defaults.anthropic_model),
            temperature: env_parse("LLM_TEMPERATURE"),
            max_tokens: env_parse("LLM_MAX_TOKENS"),
            llm_timeout: env_parse::<u64>("LLM_TIMEOUT")
                .map(Duration::from_millis)
                .unwrap_or(defaults.llm_timeout),
            llm_base_url: env_trimmed("LLM_BASE_URL"),
            browser_timeout: env_parse::<u64>("BROWSER_TIMEOUT")
                .map(Duration::from_millis)
                .unwrap_or(defaults.browser_timeout),
            cache_ttl_days: env_parse("CACHE_TTL_DAYS").unwrap_or(defaults.cache_ttl_days),
            environment: env_trimmed("PAGEWATCH_ENV").unwrap_or(defaults.environment),
            headless: env_flag("PAGEWATCH_HEADLESS", defaults.headless),
            chrome_executable: env_trimmed("PAGEWATCH_CHROME").map(PathBuf::from),
            prompt_dir: env_trimmed("PAGEWATCH_PROMPT_DIR").map(PathBuf::from),
        }
    }

    /// Model identifier for the configured primary provider.
    pub fn primary_model(&self) -> &str {
        match self.provider {
            LlmProviderKind::OpenAi => &self.openai_model,
            LlmProviderKind::Anthropic => &self.anthropic_model,
        }
    }
}

fn env_trimmed(key: &str) -> Option<String> {
    match std::env::var(key) {
        Ok(value) => {
            let trimmed = value.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Err(_) => None,
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_trimmed(key).and_then(|raw| raw.parse().ok())
}

const FALSY_FLAG_VALUES: &[&str] = &["0", "false", "no", "off"];

fn env_flag(key: &str, default: bool) -> bool {
    env_trimmed(key)
        .map(|raw| !FALSY_FLAG_VALUES.contains(&raw.to_ascii_lowercase().as_str()))
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = EngineConfig::default();
        assert_eq!(config.cache_ttl_days, 7);
        assert_eq!(config.browser_timeout, Duration::from_millis(30_000));
        assert!(config.database_url.is_none());
        assert_eq!(config.provider, LlmProviderKind::OpenAi);
    }

    #[test]
    fn env_flags_treat_only_falsy_values_as_off() {
        std::env::set_var("PAGEWATCH_TEST_FLAG", "Off");
        assert!(!env_flag("PAGEWATCH_TEST_FLAG", true));
        std::env::set_var("PAGEWATCH_TEST_FLAG", "anything");
        assert!(env_flag("PAGEWATCH_TEST_FLAG", false));
        std::env::remove_var("PAGEWATCH_TEST_FLAG");
        assert!(env_flag("PAGEWATCH_TEST_FLAG", true));
        assert!(!env_flag("PAGEWATCH_TEST_FLAG", false));
    }

    #[test]
    fn primary_model_follows_provider() {
        let mut config = EngineConfig::default();
        assert_eq!(config.primary_model(), "gpt-4o");
        config.provider = LlmProviderKind::Anthropic;
        assert!(config.primary_model().starts_with("claude"));
    }
}
