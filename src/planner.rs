//! One-shot plan generation.
//!
//! Renders the plan prompt, calls the model in JSON mode at low temperature,
//! parses the scaffold, and validates it into a typed [`Plan`]. A second
//! client can back the first: the higher-confidence result wins when the
//! primary fails or scores low.

use std::sync::Arc;

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::llm::{util::extract_json_object, ChatMessage, CompletionOptions, LlmClient};
use crate::prompts::PromptStore;
use crate::types::{
    task_signature, ErrorHandling, Plan, PlanMetadata, PlanValidation, Step, StepAction,
    TokenUsage,
};

/// Confidence below this triggers the fallback client.
pub const FALLBACK_CONFIDENCE_THRESHOLD: f64 = 0.5;

#[derive(Clone, Debug)]
pub struct PlanRequest {
    pub instruction: String,
    pub url: String,
    pub page_text: Option<String>,
    pub failure_context: Option<String>,
}

#[derive(Debug)]
pub struct PlanGeneration {
    pub plan: Option<Plan>,
    pub confidence: f64,
    pub reasoning: String,
    pub error: Option<String>,
    pub usage: Option<TokenUsage>,
}

impl PlanGeneration {
    pub fn is_success(&self) -> bool {
        self.plan.is_some()
    }

    fn failure(error: impl Into<String>, usage: Option<TokenUsage>) -> Self {
        Self {
            plan: None,
            confidence: 0.0,
            reasoning: String::new(),
            error: Some(error.into()),
            usage,
        }
    }
}

pub struct PlanGenerator {
    llm: Arc<dyn LlmClient>,
    prompts: Arc<PromptStore>,
    max_tokens: Option<u32>,
}

impl PlanGenerator {
    pub fn new(llm: Arc<dyn LlmClient>, prompts: Arc<PromptStore>) -> Self {
        Self {
            llm,
            prompts,
            max_tokens: None,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: Option<u32>) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub async fn generate_plan(&self, request: &PlanRequest) -> PlanGeneration {
        let vars = json!({
            "instruction": request.instruction,
            "url": request.url,
            "pageText": request.page_text,
            "failureContext": request.failure_context,
        });
        let messages = [
            ChatMessage::system(self.prompts.system_prompt()),
            ChatMessage::user(self.prompts.render_plan_prompt(&vars)),
        ];

        let options = CompletionOptions {
            max_tokens: self.max_tokens,
            ..CompletionOptions::planning()
        };
        let completion = match self.llm.complete(&messages, &options).await {
            Ok(completion) => completion,
            Err(err) => return PlanGeneration::failure(err.to_string(), None),
        };
        let usage = Some(completion.usage);

        let Some(raw_json) = extract_json_object(&completion.content) else {
            return PlanGeneration::failure("model response contained no JSON object", usage);
        };
        let scaffold: PlanScaffold = match serde_json::from_str(&raw_json) {
            Ok(scaffold) => scaffold,
            Err(err) => {
                return PlanGeneration::failure(format!("plan JSON malformed: {err}"), usage)
            }
        };

        match build_plan(request, scaffold, &completion.model) {
            Ok((plan, confidence, reasoning)) => PlanGeneration {
                plan: Some(plan),
                confidence,
                reasoning,
                error: None,
                usage,
            },
            Err(message) => {
                warn!(%message, "generated plan failed validation");
                PlanGeneration::failure("validation", usage)
            }
        }
    }

    /// Try `self`, then `fallback` when the first attempt fails outright or
    /// reports confidence below the threshold. The better result wins.
    pub async fn generate_plan_with_fallback(
        &self,
        request: &PlanRequest,
        fallback: Option<&PlanGenerator>,
    ) -> PlanGeneration {
        let primary = self.generate_plan(request).await;
        let needs_fallback =
            !primary.is_success() || primary.confidence < FALLBACK_CONFIDENCE_THRESHOLD;
        let Some(fallback) = fallback else {
            return primary;
        };
        if !needs_fallback {
            return primary;
        }

        debug!(
            primary_ok = primary.is_success(),
            primary_confidence = primary.confidence,
            "consulting fallback plan generator"
        );
        let secondary = fallback.generate_plan(request).await;
        match (primary.is_success(), secondary.is_success()) {
            (true, true) if secondary.confidence > primary.confidence => secondary,
            (true, _) => primary,
            (false, true) => secondary,
            (false, false) => primary,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlanScaffold {
    steps: Vec<Value>,
    #[serde(default)]
    expected_results: Vec<String>,
    #[serde(default)]
    validation: Option<PlanValidation>,
    #[serde(default)]
    error_handling: Option<ErrorHandling>,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    reasoning: Option<String>,
}

fn build_plan(
    request: &PlanRequest,
    scaffold: PlanScaffold,
    model_id: &str,
) -> Result<(Plan, f64, String), String> {
    if scaffold.steps.is_empty() {
        return Err("plan has no steps".to_string());
    }

    let mut steps = Vec::with_capacity(scaffold.steps.len());
    for (index, mut raw) in scaffold.steps.into_iter().enumerate() {
        let Some(object) = raw.as_object_mut() else {
            return Err(format!("step {} is not an object", index + 1));
        };
        if !object.contains_key("id") {
            object.insert("id".to_string(), Value::String(format!("step-{}", index + 1)));
        }
        if !object.contains_key("description") {
            return Err(format!("step {} is missing a description", index + 1));
        }
        let step: Step = serde_json::from_value(Value::Object(object.clone()))
            .map_err(|err| format!("step {} invalid: {err}", index + 1))?;
        check_selector_plausibility(&step);
        steps.push(step);
    }

    // A navigate step with no embedded URL inherits the task URL at replay
    // time; nothing to fill in here.
    let confidence = scaffold.confidence.unwrap_or(0.5).clamp(0.0, 1.0);
    let reasoning = scaffold.reasoning.unwrap_or_default();
    let estimated_duration_ms = estimate_duration_ms(&steps);

    let plan = Plan {
        id: Plan::new_id(),
        task_signature: task_signature(&request.instruction, &request.url),
        instruction: request.instruction.clone(),
        url: request.url.clone(),
        steps,
        expected_results: scaffold.expected_results,
        error_handling: scaffold.error_handling.unwrap_or_default(),
        validation: scaffold.validation.unwrap_or_default(),
        metadata: PlanMetadata {
            created_at: Utc::now(),
            model_id: model_id.to_string(),
            confidence,
            estimated_duration_ms,
        },
    };
    Ok((plan, confidence, reasoning))
}

/// Per-type duration constants summed over the plan.
pub fn estimate_duration_ms(steps: &[Step]) -> u64 {
    steps
        .iter()
        .map(|step| match &step.action {
            StepAction::Navigate { .. } => 3_000,
            StepAction::Wait { wait_time } => *wait_time,
            StepAction::WaitForSelector { wait_time, .. } => (*wait_time).min(10_000),
            StepAction::Click { .. }
            | StepAction::Type { .. }
            | StepAction::Select { .. }
            | StepAction::Hover { .. }
            | StepAction::KeyPress { .. } => 500,
            StepAction::Extract { .. } | StepAction::Evaluate { .. } => 200,
            StepAction::Scroll { .. }
            | StepAction::Reload
            | StepAction::GoBack
            | StepAction::GoForward => 1_000,
            StepAction::Screenshot { .. } => 1_000,
        })
        .sum()
}

static SUSPICIOUS_SELECTOR: Lazy<Regex> = Lazy::new(|| {
    // Whitespace-only selectors or unbalanced brackets; anything else passes.
    Regex::new(r"^\s*$|\[[^\]]*$").unwrap()
});

// Implausible selectors are a warning, never a rejection.
fn check_selector_plausibility(step: &Step) {
    if let Some(selector) = step.action.selector() {
        if SUSPICIOUS_SELECTOR.is_match(selector) {
            warn!(step = %step.id, selector, "selector looks implausible");
        }
    }
}
