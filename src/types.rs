//! Core data model: task inputs, plans, steps, execution results, and the
//! monitoring records that change detection builds on.
//!
//! Wire-facing types serialize with camelCase field names so that plans and
//! results round-trip unchanged through the JSON store and the gateway.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use url::Url;
use uuid::Uuid;

use crate::errors::{EngineError, EngineResult};

/// Upper bound on instruction length accepted from callers.
pub const INSTRUCTION_BUDGET: usize = 4_000;

/// Execution mode requested by the caller.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    Plan,
    #[default]
    Interactive,
    Auto,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
        }
    }
}

/// Option bag attached to a task invocation. Fully enumerated; unknown keys
/// are rejected at the gateway.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskOptions {
    pub execution_mode: ExecutionMode,
    pub plan_only: bool,
    pub execution_only: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<String>,
    pub force_new_plan: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshot_enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub viewport: Option<Viewport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
}

/// One task invocation: what to extract, and from where.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskInput {
    pub instruction: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default)]
    pub options: TaskOptions,
}

impl TaskInput {
    pub fn new(instruction: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            instruction: instruction.into(),
            url: url.into(),
            task_id: None,
            options: TaskOptions::default(),
        }
    }

    /// Up-front validation; rejected inputs never reach routing.
    pub fn validate(&self) -> EngineResult<()> {
        if self.instruction.trim().is_empty() {
            return Err(EngineError::validation("instruction must not be empty"));
        }
        if self.instruction.len() > INSTRUCTION_BUDGET {
            return Err(EngineError::validation(format!(
                "instruction exceeds the {INSTRUCTION_BUDGET} character budget"
            )));
        }
        let parsed = Url::parse(self.url.trim())
            .map_err(|err| EngineError::validation(format!("invalid url: {err}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(EngineError::validation(
                "url must use the http or https scheme",
            ));
        }
        if self.options.plan_only && self.options.execution_only {
            return Err(EngineError::validation(
                "planOnly and executionOnly are mutually exclusive",
            ));
        }
        Ok(())
    }

    pub fn signature(&self) -> String {
        task_signature(&self.instruction, &self.url)
    }
}

/// Canonical fingerprint of `(instruction, url)` used as the cache key seed.
///
/// Stable under whitespace/case normalization of the instruction and under
/// scheme/host case and trailing-slash changes of the URL.
pub fn task_signature(instruction: &str, url: &str) -> String {
    let normalized = instruction
        .trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    let location = match Url::parse(url.trim()) {
        Ok(parsed) => {
            let host = parsed.host_str().unwrap_or_default().to_lowercase();
            let path = parsed.path().trim_end_matches('/');
            format!("{}://{}{}", parsed.scheme().to_lowercase(), host, path)
        }
        Err(_) => url.trim().to_lowercase(),
    };
    format!("{normalized}|{location}")
}

/// Content-addressed cache key derived from a task signature.
pub fn cache_key(task_signature: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("cache_{task_signature}").as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitState {
    Attached,
    #[default]
    Visible,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractKind {
    #[default]
    Text,
    Html,
    Value,
    Attribute,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScrollDirection {
    Up,
    Down,
    Left,
    Right,
}

/// One unit of browser action; the `type` tag matches the wire format the
/// model is prompted to emit.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum StepAction {
    Navigate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
    },
    Click {
        selector: String,
    },
    Type {
        selector: String,
        value: String,
    },
    Select {
        selector: String,
        value: String,
    },
    Hover {
        selector: String,
    },
    KeyPress {
        key: String,
    },
    Scroll {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        x: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        y: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        direction: Option<ScrollDirection>,
    },
    Wait {
        #[serde(rename = "waitTime", default = "default_wait_ms")]
        wait_time: u64,
    },
    WaitForSelector {
        selector: String,
        #[serde(rename = "waitTime", default = "default_wait_for_selector_ms")]
        wait_time: u64,
        #[serde(default)]
        state: WaitState,
    },
    Extract {
        selector: String,
        #[serde(default)]
        multiple: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        attribute: Option<String>,
        #[serde(default)]
        kind: ExtractKind,
    },
    Evaluate {
        script: String,
    },
    Screenshot {
        #[serde(rename = "fullPage", default)]
        full_page: bool,
    },
    Reload,
    GoBack,
    GoForward,
}

pub fn default_wait_ms() -> u64 {
    1_000
}

pub fn default_wait_for_selector_ms() -> u64 {
    10_000
}

impl StepAction {
    /// Wire tag for summaries and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            StepAction::Navigate { .. } => "navigate",
            StepAction::Click { .. } => "click",
            StepAction::Type { .. } => "type",
            StepAction::Select { .. } => "select",
            StepAction::Hover { .. } => "hover",
            StepAction::KeyPress { .. } => "keyPress",
            StepAction::Scroll { .. } => "scroll",
            StepAction::Wait { .. } => "wait",
            StepAction::WaitForSelector { .. } => "waitForSelector",
            StepAction::Extract { .. } => "extract",
            StepAction::Evaluate { .. } => "evaluate",
            StepAction::Screenshot { .. } => "screenshot",
            StepAction::Reload => "reload",
            StepAction::GoBack => "goBack",
            StepAction::GoForward => "goForward",
        }
    }

    pub fn selector(&self) -> Option<&str> {
        match self {
            StepAction::Click { selector }
            | StepAction::Type { selector, .. }
            | StepAction::Select { selector, .. }
            | StepAction::Hover { selector }
            | StepAction::WaitForSelector { selector, .. }
            | StepAction::Extract { selector, .. } => Some(selector),
            _ => None,
        }
    }

    pub fn value(&self) -> Option<&str> {
        match self {
            StepAction::Type { value, .. } | StepAction::Select { value, .. } => Some(value),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub optional: bool,
    /// Per-step retry override; the plan-level retry count applies otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    /// Boolean page-context expression; falsy skips the step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_after_ms: Option<u64>,
    #[serde(flatten)]
    pub action: StepAction,
}

impl Step {
    pub fn new(id: impl Into<String>, description: impl Into<String>, action: StepAction) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            optional: false,
            retries: None,
            condition: None,
            wait_after_ms: None,
            action,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorHandling {
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(default = "default_step_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fallback_steps: Vec<Step>,
}

pub fn default_retry_count() -> u32 {
    3
}

fn default_step_timeout_ms() -> u64 {
    30_000
}

impl Default for ErrorHandling {
    fn default() -> Self {
        Self {
            retry_count: default_retry_count(),
            timeout_ms: default_step_timeout_ms(),
            fallback_steps: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlanValidation {
    #[serde(default)]
    pub success_criteria: Vec<String>,
    #[serde(default)]
    pub failure_criteria: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlanMetadata {
    pub created_at: DateTime<Utc>,
    pub model_id: String,
    pub confidence: f64,
    pub estimated_duration_ms: u64,
}

/// Ordered browser steps plus the validation expressions that decide whether
/// a replay counts as successful.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    pub id: String,
    pub task_signature: String,
    pub instruction: String,
    pub url: String,
    pub steps: Vec<Step>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub expected_results: Vec<String>,
    #[serde(default)]
    pub error_handling: ErrorHandling,
    #[serde(default)]
    pub validation: PlanValidation,
    pub metadata: PlanMetadata,
}

impl Plan {
    pub fn new_id() -> String {
        format!("plan-{}", Uuid::new_v4())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Success,
    Failed,
    Timeout,
    Error,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Success => "success",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Timeout => "timeout",
            ExecutionStatus::Error => "error",
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionErrorInfo {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionMetrics {
    pub execution_time_ms: u64,
    pub steps_completed: u32,
    pub steps_total: u32,
    pub retry_count: u32,
}

/// Outcome of one plan replay.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub plan_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub status: ExecutionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extracted_data: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub screenshots: Vec<String>,
    #[serde(default)]
    pub logs: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionErrorInfo>,
    pub metrics: ExecutionMetrics,
    pub created_at: DateTime<Utc>,
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        matches!(self.status, ExecutionStatus::Success)
    }

    pub fn has_extracted_data(&self) -> bool {
        self.extracted_data
            .as_ref()
            .map(|data| !data.is_empty())
            .unwrap_or(false)
    }
}

/// Captured browser state fed into the interactive-step prompt.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowserState {
    pub url: String,
    pub dom: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<String>,
    pub viewport: Viewport,
    pub captured_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Default for BrowserState {
    fn default() -> Self {
        Self {
            url: String::new(),
            dom: String::new(),
            screenshot: None,
            viewport: Viewport::default(),
            captured_at: Utc::now(),
            error: None,
        }
    }
}

/// Result of running a single step, interactive or replayed.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// One iteration of the interactive loop.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InteractiveStep {
    pub step_number: u32,
    pub browser_state: BrowserState,
    pub action: Step,
    pub execution_result: StepOutcome,
    pub progress_score: f64,
    pub is_complete: bool,
    pub reasoning: String,
}

/// One successful extraction observation; append-only.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringSample {
    pub task_id: String,
    pub url: String,
    pub extracted_data: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    pub captured_at: DateTime<Utc>,
}

/// One detected change between successive samples; append-only.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecord {
    pub task_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    pub changed_fields: Vec<String>,
    pub is_restock: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub change_details: Option<Value>,
    pub detected_at: DateTime<Utc>,
}

/// Token usage reported by an LLM call; accumulated across a run.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn add(&mut self, other: &TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_stable_under_whitespace_and_case() {
        let a = task_signature("Check  the\tprice", "https://Example.com/shop/");
        let b = task_signature("  check the price ", "https://example.com/shop");
        assert_eq!(a, b);
        assert_eq!(cache_key(&a), cache_key(&b));
    }

    #[test]
    fn signature_keeps_distinct_paths_apart() {
        let a = task_signature("check price", "https://example.com/a");
        let b = task_signature("check price", "https://example.com/b");
        assert_ne!(a, b);
    }

    #[test]
    fn signature_ignores_query_noise_in_path_component_only() {
        // Query strings are intentionally excluded from the signature.
        let a = task_signature("x", "https://example.com/p?session=1");
        let b = task_signature("x", "https://example.com/p?session=2");
        assert_eq!(a, b);
    }

    #[test]
    fn validate_rejects_conflicting_flags() {
        let mut input = TaskInput::new("get the title", "https://example.com");
        input.options.plan_only = true;
        input.options.execution_only = true;
        let err = input.validate().unwrap_err();
        assert_eq!(err.code(), "VALIDATION");
    }

    #[test]
    fn validate_rejects_non_http_urls() {
        let input = TaskInput::new("get the title", "ftp://example.com");
        assert!(input.validate().is_err());
    }

    #[test]
    fn step_actions_round_trip_with_wire_tags() {
        let step = Step::new(
            "step-1",
            "wait for price",
            StepAction::WaitForSelector {
                selector: ".price".into(),
                wait_time: 5_000,
                state: WaitState::Visible,
            },
        );
        let json = serde_json::to_value(&step).unwrap();
        assert_eq!(json["type"], "waitForSelector");
        assert_eq!(json["waitTime"], 5_000);
        let back: Step = serde_json::from_value(json).unwrap();
        assert_eq!(back, step);
    }

    #[test]
    fn wait_for_selector_defaults_apply() {
        let step: Step = serde_json::from_value(serde_json::json!({
            "id": "step-1",
            "type": "waitForSelector",
            "selector": "#main"
        }))
        .unwrap();
        match step.action {
            StepAction::WaitForSelector {
                wait_time, state, ..
            } => {
                assert_eq!(wait_time, 10_000);
                assert_eq!(state, WaitState::Visible);
            }
            other => panic!("unexpected action: {other:?}"),
        }
    }

    #[test]
    fn plan_json_round_trips() {
        let plan = Plan {
            id: Plan::new_id(),
            task_signature: task_signature("get title", "https://example.com"),
            instruction: "get title".into(),
            url: "https://example.com".into(),
            steps: vec![Step::new(
                "step-1",
                "open page",
                StepAction::Navigate { url: None },
            )],
            expected_results: vec!["title".into()],
            error_handling: ErrorHandling::default(),
            validation: PlanValidation::default(),
            metadata: PlanMetadata {
                created_at: Utc::now(),
                model_id: "gpt-4o".into(),
                confidence: 0.8,
                estimated_duration_ms: 3_000,
            },
        };
        let json = serde_json::to_string(&plan).unwrap();
        let back: Plan = serde_json::from_str(&json).unwrap();
        assert_eq!(back, plan);
    }
}
