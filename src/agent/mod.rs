//! Interactive agent: the closed-loop planner.
//!
//! Each iteration captures live browser state, asks the model for the next
//! action plus a progress evaluation, executes the action, and records the
//! step. The loop ends on completion, stagnation, or step budget exhaustion;
//! successful runs are promoted into replayable plans.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::browser::BrowserSession;
use crate::llm::{util::extract_json_object, ChatMessage, CompletionOptions, LlmClient};
use crate::parsers;
use crate::prompts::PromptStore;
use crate::types::{
    task_signature, ErrorHandling, InteractiveStep, Plan, PlanMetadata, PlanValidation, Step,
    StepAction, TaskInput, TokenUsage,
};

#[derive(Clone, Debug)]
pub struct InteractiveConfig {
    pub max_steps: u32,
    /// Spread below this across the stagnation window means no progress.
    pub progress_threshold: f64,
    /// How many trailing scores the stagnation check inspects.
    pub stagnation_limit: usize,
    pub screenshots: bool,
    pub dom_capture: bool,
    /// Sampling overrides; `None` leaves the provider defaults in place.
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl Default for InteractiveConfig {
    fn default() -> Self {
        Self {
            max_steps: 10,
            progress_threshold: 0.10,
            stagnation_limit: 3,
            screenshots: true,
            dom_capture: true,
            temperature: None,
            max_tokens: None,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct InteractiveMetadata {
    pub max_steps_reached: bool,
    pub stagnation_detected: bool,
    pub average_progress_score: f64,
}

#[derive(Debug)]
pub struct InteractiveOutcome {
    pub success: bool,
    pub steps: Vec<InteractiveStep>,
    pub generated_plan: Option<Plan>,
    pub escalated_to_human: bool,
    pub escalation_reason: Option<String>,
    pub progress_improvement: Option<f64>,
    pub total_duration_ms: u64,
    pub extracted_data: Map<String, Value>,
    pub usage: TokenUsage,
    pub metadata: InteractiveMetadata,
}

pub struct InteractiveAgent {
    llm: Arc<dyn LlmClient>,
    prompts: Arc<PromptStore>,
    config: InteractiveConfig,
}

impl InteractiveAgent {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        prompts: Arc<PromptStore>,
        config: InteractiveConfig,
    ) -> Self {
        Self {
            llm,
            prompts,
            config,
        }
    }

    /// Drive the session step by step until the model reports completion,
    /// progress stagnates, or the step budget runs out.
    pub async fn execute_interactively(
        &self,
        input: &TaskInput,
        session: &BrowserSession,
    ) -> InteractiveOutcome {
        let started = tokio::time::Instant::now();
        let mut steps: Vec<InteractiveStep> = Vec::new();
        let mut extracted = Map::new();
        let mut usage = TokenUsage::default();
        let mut success = false;
        let mut escalation_reason: Option<String> = None;
        let mut stagnation_detected = false;
        let mut max_steps_reached = false;

        info!(instruction = %input.instruction, url = %input.url, "starting interactive run");

        for step_number in 1..=self.config.max_steps {
            let state = session.capture_state(self.config.screenshots).await;
            if let Some(error) = &state.error {
                debug!(%error, "state capture degraded; continuing with partial state");
            }

            let dom = if self.config.dom_capture {
                state.dom.as_str()
            } else {
                ""
            };
            let decision = self
                .decide(input, &state.url, dom, &steps, &mut usage)
                .await;

            let retry_limit = decision.action.retries.unwrap_or(1);
            let outcome = session.execute_step(&decision.action, retry_limit).await;

            if outcome.success {
                if let (StepAction::Extract { .. }, Some(value)) =
                    (&decision.action.action, &outcome.result)
                {
                    // Keyed by position so a promoted replay reproduces the
                    // same extracted-data keys.
                    extracted.insert(format!("step-{step_number}"), value.clone());
                    merge_parsed(&input.instruction, value, &mut extracted);
                }
            } else if let Some(error) = &outcome.error {
                warn!(step = step_number, %error, "interactive action failed");
            }

            steps.push(InteractiveStep {
                step_number,
                browser_state: state,
                action: decision.action.clone(),
                execution_result: outcome,
                progress_score: decision.score,
                is_complete: decision.is_complete,
                reasoning: decision.reasoning.clone(),
            });

            if decision.is_complete {
                success = true;
                break;
            }

            if let Some(scores) = trailing_scores(&steps, self.config.stagnation_limit) {
                if stagnated(&scores, self.config.progress_threshold) {
                    stagnation_detected = true;
                    escalation_reason = Some(format!(
                        "stagnation detected: last {} progress scores {:?} moved less than {}",
                        self.config.stagnation_limit, scores, self.config.progress_threshold
                    ));
                    break;
                }
            }

            if step_number == self.config.max_steps {
                max_steps_reached = true;
                escalation_reason = Some(format!(
                    "max steps reached ({}) without completion",
                    self.config.max_steps
                ));
            }
        }

        if !success && escalation_reason.is_none() {
            max_steps_reached = true;
            escalation_reason = Some(format!(
                "max steps reached ({}) without completion",
                self.config.max_steps
            ));
        }

        let escalated = escalation_reason.is_some();
        let generated_plan = if success && !escalated {
            Some(promote_trace(input, &steps))
        } else {
            None
        };

        let average_progress_score = if steps.is_empty() {
            0.0
        } else {
            steps.iter().map(|step| step.progress_score).sum::<f64>() / steps.len() as f64
        };
        let progress_improvement = match (steps.first(), steps.last()) {
            (Some(first), Some(last)) if steps.len() > 1 => {
                Some(last.progress_score - first.progress_score)
            }
            _ => None,
        };

        info!(
            success,
            escalated,
            steps = steps.len(),
            "interactive run finished"
        );

        InteractiveOutcome {
            success,
            steps,
            generated_plan,
            escalated_to_human: escalated,
            escalation_reason,
            progress_improvement,
            total_duration_ms: started.elapsed().as_millis() as u64,
            extracted_data: extracted,
            usage,
            metadata: InteractiveMetadata {
                max_steps_reached,
                stagnation_detected,
                average_progress_score,
            },
        }
    }

    async fn decide(
        &self,
        input: &TaskInput,
        current_url: &str,
        dom: &str,
        steps: &[InteractiveStep],
        usage: &mut TokenUsage,
    ) -> StepDecision {
        let vars = json!({
            "instruction": input.instruction,
            "url": input.url,
            "currentUrl": current_url,
            "dom": dom,
            "history": summarize_history(steps),
        });
        let messages = [
            ChatMessage::system(self.prompts.system_prompt()),
            ChatMessage::user(self.prompts.render_interactive_prompt(&vars)),
        ];
        let options = CompletionOptions {
            json_mode: true,
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
            timeout_ms: None,
        };

        let completion = match self.llm.complete(&messages, &options).await {
            Ok(completion) => completion,
            Err(err) => {
                // Transport trouble degrades to a wait; persistent failure
                // surfaces as stagnation a few iterations later.
                warn!(%err, "llm call failed; falling back to wait");
                return StepDecision::fallback(steps.len() + 1);
            }
        };
        usage.add(&completion.usage);

        parse_decision(&completion.content, steps.len() + 1).unwrap_or_else(|reason| {
            warn!(%reason, "malformed step decision; falling back to wait");
            StepDecision::fallback(steps.len() + 1)
        })
    }
}

struct StepDecision {
    action: Step,
    score: f64,
    is_complete: bool,
    reasoning: String,
}

impl StepDecision {
    /// Degenerate wait used when the model response is unusable.
    fn fallback(step_number: usize) -> Self {
        Self {
            action: Step::new(
                format!("interactive-{step_number}"),
                "wait for the page to settle",
                StepAction::Wait { wait_time: 1_000 },
            ),
            score: 0.0,
            is_complete: false,
            reasoning: "fallback: model response unusable".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DecisionWire {
    action: Option<Value>,
    progress_evaluation: Option<ProgressWire>,
    #[serde(default)]
    reasoning: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProgressWire {
    #[serde(default)]
    score: f64,
    #[serde(default)]
    is_complete: bool,
}

fn parse_decision(raw: &str, step_number: usize) -> Result<StepDecision, String> {
    let json_text =
        extract_json_object(raw).ok_or_else(|| "response contained no JSON".to_string())?;
    let wire: DecisionWire =
        serde_json::from_str(&json_text).map_err(|err| format!("decision JSON invalid: {err}"))?;

    let (Some(mut action_value), Some(progress)) = (wire.action, wire.progress_evaluation) else {
        return Err("response missing action or progressEvaluation".to_string());
    };

    // Unknown action types are rejected here, which routes them into the
    // explicit wait fallback rather than silently dropping the step.
    if let Some(object) = action_value.as_object_mut() {
        object
            .entry("id".to_string())
            .or_insert_with(|| Value::String(format!("interactive-{step_number}")));
        object
            .entry("description".to_string())
            .or_insert_with(|| Value::String("model-chosen action".to_string()));
    }
    let action: Step = serde_json::from_value(action_value)
        .map_err(|err| format!("action invalid: {err}"))?;

    Ok(StepDecision {
        action,
        score: progress.score.clamp(0.0, 1.0),
        is_complete: progress.is_complete,
        reasoning: wire.reasoning.unwrap_or_default(),
    })
}

fn summarize_history(steps: &[InteractiveStep]) -> String {
    steps
        .iter()
        .map(|step| {
            format!(
                "Step {}: {} {} - Progress: {:.2} - {}",
                step.step_number,
                step.action.action.kind(),
                step.action.action.selector().unwrap_or(""),
                step.progress_score,
                step.reasoning
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn trailing_scores(steps: &[InteractiveStep], window: usize) -> Option<Vec<f64>> {
    if steps.len() < window {
        return None;
    }
    Some(
        steps[steps.len() - window..]
            .iter()
            .map(|step| step.progress_score)
            .collect(),
    )
}

/// True when the window's spread is below the threshold.
fn stagnated(scores: &[f64], threshold: f64) -> bool {
    let max = scores.iter().cloned().fold(f64::MIN, f64::max);
    let min = scores.iter().cloned().fold(f64::MAX, f64::min);
    (max - min) < threshold
}

/// Convert a successful trace into a replayable plan.
fn promote_trace(input: &TaskInput, steps: &[InteractiveStep]) -> Plan {
    let plan_steps: Vec<Step> = steps
        .iter()
        .enumerate()
        .map(|(index, step)| {
            let mut promoted = step.action.clone();
            promoted.id = format!("step-{}", index + 1);
            promoted
        })
        .collect();

    let confidence = steps
        .last()
        .map(|step| step.progress_score)
        .unwrap_or(0.0);
    let estimated_duration_ms = steps
        .iter()
        .map(|step| step.execution_result.duration_ms)
        .sum();

    Plan {
        id: Plan::new_id(),
        task_signature: task_signature(&input.instruction, &input.url),
        instruction: input.instruction.clone(),
        url: input.url.clone(),
        steps: plan_steps,
        expected_results: Vec::new(),
        error_handling: ErrorHandling::default(),
        validation: PlanValidation {
            success_criteria: vec![crate::browser::exec::CRITERION_ALL_STEPS_OK.to_string()],
            failure_criteria: vec![crate::browser::exec::CRITERION_ANY_STEP_FAILED.to_string()],
        },
        metadata: PlanMetadata {
            created_at: chrono::Utc::now(),
            model_id: "trace-promotion".to_string(),
            confidence,
            estimated_duration_ms,
        },
    }
}

fn merge_parsed(instruction: &str, value: &Value, extracted: &mut Map<String, Value>) {
    let text = match value {
        Value::String(text) => text.clone(),
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join("\n"),
        other => other.to_string(),
    };
    for (key, parsed) in parsers::parse_extracted(instruction, &text) {
        extracted.insert(key, parsed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BrowserState, StepOutcome};

    fn interactive_step(number: u32, score: f64, complete: bool) -> InteractiveStep {
        InteractiveStep {
            step_number: number,
            browser_state: BrowserState::default(),
            action: Step::new(
                format!("interactive-{number}"),
                "do something",
                StepAction::Click {
                    selector: ".next".into(),
                },
            ),
            execution_result: StepOutcome {
                success: true,
                result: None,
                error: None,
                duration_ms: 40,
            },
            progress_score: score,
            is_complete: complete,
            reasoning: "progressing".into(),
        }
    }

    #[test]
    fn stagnation_fires_only_below_threshold() {
        assert!(stagnated(&[0.30, 0.32, 0.35], 0.10));
        assert!(!stagnated(&[0.30, 0.32, 0.45], 0.10));
        // Spread exactly at the threshold is not stagnation.
        assert!(!stagnated(&[0.30, 0.35, 0.40], 0.10));
    }

    #[test]
    fn trailing_scores_need_a_full_window() {
        let steps = vec![interactive_step(1, 0.2, false)];
        assert!(trailing_scores(&steps, 3).is_none());
        let steps: Vec<_> = (1..=4)
            .map(|n| interactive_step(n, 0.1 * n as f64, false))
            .collect();
        let scores = trailing_scores(&steps, 3).unwrap();
        assert_eq!(scores.len(), 3);
        assert!((scores[0] - 0.2).abs() < 1e-9);
    }

    #[test]
    fn decision_parsing_requires_action_and_progress() {
        assert!(parse_decision(r#"{ "action": { "type": "wait" } }"#, 1).is_err());
        assert!(parse_decision("not json", 1).is_err());
        let decision = parse_decision(
            r##"{
                "action": { "type": "click", "selector": "#buy" },
                "progressEvaluation": { "score": 0.6, "isComplete": false },
                "reasoning": "clicking the buy button"
            }"##,
            2,
        )
        .unwrap();
        assert_eq!(decision.action.id, "interactive-2");
        assert!((decision.score - 0.6).abs() < f64::EPSILON);
        assert!(!decision.is_complete);
    }

    #[test]
    fn unknown_action_types_are_rejected() {
        let result = parse_decision(
            r##"{
                "action": { "type": "teleport", "selector": "#x" },
                "progressEvaluation": { "score": 0.1, "isComplete": false }
            }"##,
            1,
        );
        assert!(result.is_err());
    }

    #[test]
    fn scores_are_clamped_into_unit_range() {
        let decision = parse_decision(
            r#"{
                "action": { "type": "wait" },
                "progressEvaluation": { "score": 7.5, "isComplete": false }
            }"#,
            1,
        )
        .unwrap();
        assert!((decision.score - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn promoted_plans_renumber_steps_and_carry_sentinel_criteria() {
        let input = TaskInput::new("get the title", "https://example.com");
        let steps = vec![
            interactive_step(1, 0.4, false),
            interactive_step(2, 0.9, true),
        ];
        let plan = promote_trace(&input, &steps);
        assert_eq!(plan.steps.len(), 2);
        assert_eq!(plan.steps[0].id, "step-1");
        assert_eq!(plan.steps[1].id, "step-2");
        assert!((plan.metadata.confidence - 0.9).abs() < f64::EPSILON);
        assert_eq!(plan.metadata.estimated_duration_ms, 80);
        assert_eq!(
            plan.validation.success_criteria,
            vec![crate::browser::exec::CRITERION_ALL_STEPS_OK.to_string()]
        );
    }

    #[test]
    fn history_summaries_follow_the_step_format() {
        let steps = vec![interactive_step(1, 0.25, false)];
        let summary = summarize_history(&steps);
        assert!(summary.starts_with("Step 1: click .next - Progress: 0.25"));
    }
}
