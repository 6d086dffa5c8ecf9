//! Unified error taxonomy for the execution engine.
//!
//! Every error carries a stable machine code and maps to an HTTP status for
//! the gateway surface. Transient transport conditions are flagged retriable
//! so callers can decide whether another attempt is worthwhile.

use serde_json::Value;
use thiserror::Error;

/// Engine-wide error kinds.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Bad caller input (empty instruction, malformed URL, conflicting flags).
    #[error("{message}")]
    Validation { message: String },

    /// The model failed to produce a usable plan, or the plan failed validation.
    #[error("plan generation failed: {message}")]
    PlanGeneration { message: String },

    /// A browser step failed after exhausting its retries.
    #[error("step '{step_id}' failed: {message}")]
    BrowserExecution { step_id: String, message: String },

    /// Page navigation did not settle within the deadline.
    #[error("navigation timed out: {message}")]
    NavigationTimeout { message: String },

    /// The cache/persistence backend misbehaved.
    #[error("cache backend error: {message}")]
    CacheBackend { message: String },

    /// The LLM transport timed out before a response arrived.
    #[error("llm request timed out: {message}")]
    TransportTimeout { message: String },

    /// The LLM provider rejected the request with a rate-limit response.
    #[error("llm provider rate limited")]
    RateLimited { retry_after_seconds: Option<u64> },

    /// Any other non-success response from an LLM provider.
    #[error("llm api error: {message}")]
    Api {
        status: Option<u16>,
        code: Option<String>,
        message: String,
    },

    /// No cached plan exists for the requested signature or id.
    #[error("no cached plan available")]
    PlanNotFound { reference: String },

    #[error("{message}")]
    Internal { message: String },
}

impl EngineError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn plan_generation(message: impl Into<String>) -> Self {
        Self::PlanGeneration {
            message: message.into(),
        }
    }

    pub fn step(step_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::BrowserExecution {
            step_id: step_id.into(),
            message: message.into(),
        }
    }

    pub fn nav_timeout(message: impl Into<String>) -> Self {
        Self::NavigationTimeout {
            message: message.into(),
        }
    }

    pub fn cache(message: impl Into<String>) -> Self {
        Self::CacheBackend {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Stable machine code for logs and API bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "VALIDATION",
            Self::PlanGeneration { .. } => "PLAN_GENERATION",
            Self::BrowserExecution { .. } => "BROWSER_EXECUTION",
            Self::NavigationTimeout { .. } => "NAV_TIMEOUT",
            Self::CacheBackend { .. } => "CACHE_BACKEND",
            Self::TransportTimeout { .. } => "LLM_TIMEOUT",
            Self::RateLimited { .. } => "LLM_RATE_LIMITED",
            Self::Api { .. } => "LLM_API",
            Self::PlanNotFound { .. } => "NO_CACHED_PLAN",
            Self::Internal { .. } => "INTERNAL",
        }
    }

    /// HTTP status used by the gateway layer.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Validation { .. } => 400,
            Self::PlanNotFound { .. } => 404,
            Self::NavigationTimeout { .. } => 408,
            Self::PlanGeneration { .. } => 422,
            Self::RateLimited { .. } => 429,
            _ => 500,
        }
    }

    /// Optional structured detail bag for API bodies.
    pub fn details(&self) -> Option<Value> {
        match self {
            Self::BrowserExecution { step_id, .. } => {
                Some(serde_json::json!({ "step": step_id }))
            }
            Self::RateLimited {
                retry_after_seconds,
            } => Some(serde_json::json!({ "retryAfterSeconds": retry_after_seconds })),
            Self::Api { status, code, .. } => {
                Some(serde_json::json!({ "status": status, "code": code }))
            }
            Self::PlanNotFound { reference } => {
                Some(serde_json::json!({ "reference": reference }))
            }
            _ => None,
        }
    }

    /// Whether retrying the same request may succeed without changes.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NavigationTimeout { .. }
                | Self::TransportTimeout { .. }
                | Self::RateLimited { .. }
        )
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        Self::internal(format!("io error: {err}"))
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::internal(format!("json error: {err}"))
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(EngineError::validation("x").code(), "VALIDATION");
        assert_eq!(
            EngineError::PlanNotFound {
                reference: "sig".into()
            }
            .code(),
            "NO_CACHED_PLAN"
        );
        assert_eq!(EngineError::nav_timeout("x").code(), "NAV_TIMEOUT");
    }

    #[test]
    fn http_status_mapping() {
        assert_eq!(EngineError::validation("x").http_status(), 400);
        assert_eq!(
            EngineError::PlanNotFound {
                reference: "p".into()
            }
            .http_status(),
            404
        );
        assert_eq!(EngineError::nav_timeout("x").http_status(), 408);
        assert_eq!(EngineError::plan_generation("x").http_status(), 422);
        assert_eq!(EngineError::internal("x").http_status(), 500);
    }

    #[test]
    fn step_errors_expose_step_detail() {
        let err = EngineError::step("step-3", "selector not found");
        let details = err.details().expect("details");
        assert_eq!(details["step"], "step-3");
    }

    #[test]
    fn transient_kinds_are_retryable() {
        assert!(EngineError::nav_timeout("slow").is_retryable());
        assert!(!EngineError::validation("bad").is_retryable());
    }
}
