//! Plan replay: step dispatch, retries, conditions, and validation criteria.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use serde_json::{Map, Value};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::errors::EngineError;
use crate::parsers;
use crate::types::{
    ExecutionErrorInfo, ExecutionMetrics, ExecutionResult, ExecutionStatus, Plan, Step,
    StepAction, StepOutcome, WaitState,
};

use super::driver::{ExtractSpec, PageDriver};
use super::SessionOptions;

/// Promoted plans carry these structural criteria instead of page-context
/// expressions; they are checked against the step report, not the page.
pub const CRITERION_ALL_STEPS_OK: &str = "All steps executed successfully";
pub const CRITERION_ANY_STEP_FAILED: &str = "Any step failed with error";

/// Replay every step of a plan and validate the outcome.
pub async fn execute_plan(
    driver: &dyn PageDriver,
    plan: &Plan,
    options: &SessionOptions,
) -> ExecutionResult {
    let started = tokio::time::Instant::now();
    let mut logs: Vec<String> = Vec::new();
    let mut extracted = Map::new();
    let mut screenshots: Vec<String> = Vec::new();
    let mut steps_completed = 0u32;
    let mut retry_count = 0u32;
    let mut failure: Option<(String, String, ExecutionStatus)> = None;
    let mut any_step_failed = false;

    for step in &plan.steps {
        let retry_limit = step.retries.unwrap_or(plan.error_handling.retry_count);
        let outcome = execute_step(driver, step, Some(plan), retry_limit, options).await;
        retry_count += outcome.retries_used;
        logs.push(format!(
            "step {}: {} {}",
            step.id,
            step.action.kind(),
            if outcome.outcome.success { "ok" } else { "failed" }
        ));

        if outcome.outcome.success {
            steps_completed += 1;
            if outcome.skipped {
                logs.push(format!("step {}: condition not met, skipped", step.id));
            }
            if let Some(value) = &outcome.outcome.result {
                match &step.action {
                    StepAction::Extract { .. } => {
                        extracted.insert(step.id.clone(), value.clone());
                        merge_parsed(&plan.instruction, value, &mut extracted);
                    }
                    StepAction::Screenshot { .. } => {
                        if let Some(encoded) = value.as_str() {
                            screenshots.push(encoded.to_string());
                        }
                    }
                    _ => {}
                }
            }
            continue;
        }

        let message = outcome
            .outcome
            .error
            .clone()
            .unwrap_or_else(|| "step failed".to_string());
        if step.optional {
            any_step_failed = true;
            warn!(step = %step.id, %message, "optional step failed; continuing");
            logs.push(format!("step {}: optional failure ignored: {message}", step.id));
            continue;
        }

        let status = classify_failure(&message);
        failure = Some((step.id.clone(), message, status));
        break;
    }

    if failure.is_none() {
        if let Err(violated) =
            validate_criteria(driver, plan, steps_completed, any_step_failed).await
        {
            failure = Some((
                String::new(),
                format!("validation failed: {violated}"),
                ExecutionStatus::Failed,
            ));
        }
    }

    let execution_time_ms = started.elapsed().as_millis() as u64;
    let (status, error) = match failure {
        None => {
            info!(plan = %plan.id, steps = plan.steps.len(), "plan replay succeeded");
            (ExecutionStatus::Success, None)
        }
        Some((step_id, message, status)) => {
            warn!(plan = %plan.id, step = %step_id, %message, "plan replay failed");
            (
                status,
                Some(ExecutionErrorInfo {
                    message,
                    step: (!step_id.is_empty()).then_some(step_id),
                    stack: None,
                }),
            )
        }
    };

    ExecutionResult {
        plan_id: plan.id.clone(),
        task_id: None,
        status,
        extracted_data: (!extracted.is_empty()).then_some(extracted),
        screenshots,
        logs,
        error,
        metrics: ExecutionMetrics {
            execution_time_ms,
            steps_completed,
            steps_total: plan.steps.len() as u32,
            retry_count,
        },
        created_at: Utc::now(),
    }
}

pub struct StepRun {
    pub outcome: StepOutcome,
    pub skipped: bool,
    pub retries_used: u32,
}

/// Run one step with retries and backoff. Public entry used by the
/// interactive agent; plan context supplies the default navigation URL.
pub async fn execute_step(
    driver: &dyn PageDriver,
    step: &Step,
    plan: Option<&Plan>,
    retry_limit: u32,
    options: &SessionOptions,
) -> StepRun {
    let started = tokio::time::Instant::now();

    if let Some(condition) = &step.condition {
        match driver.evaluate(condition).await {
            Ok(value) if truthy(&value) => {}
            Ok(_) => {
                return StepRun {
                    outcome: StepOutcome {
                        success: true,
                        result: None,
                        error: None,
                        duration_ms: started.elapsed().as_millis() as u64,
                    },
                    skipped: true,
                    retries_used: 0,
                };
            }
            Err(err) => {
                debug!(step = %step.id, %err, "condition evaluation failed; skipping step");
                return StepRun {
                    outcome: StepOutcome {
                        success: true,
                        result: None,
                        error: None,
                        duration_ms: started.elapsed().as_millis() as u64,
                    },
                    skipped: true,
                    retries_used: 0,
                };
            }
        }
    }

    let attempts = retry_limit.max(1);
    let mut last_error: Option<EngineError> = None;
    let mut retries_used = 0u32;

    for attempt in 1..=attempts {
        if attempt > 1 {
            retries_used += 1;
            sleep(Duration::from_millis(1_000 * u64::from(attempt - 1))).await;
        }
        match run_action(driver, step, plan, options).await {
            Ok(result) => {
                if let Some(wait_after) = step.wait_after_ms {
                    sleep(Duration::from_millis(wait_after)).await;
                }
                return StepRun {
                    outcome: StepOutcome {
                        success: true,
                        result,
                        error: None,
                        duration_ms: started.elapsed().as_millis() as u64,
                    },
                    skipped: false,
                    retries_used,
                };
            }
            Err(err) => {
                debug!(step = %step.id, attempt, %err, "step attempt failed");
                last_error = Some(err);
            }
        }
    }

    StepRun {
        outcome: StepOutcome {
            success: false,
            result: None,
            error: last_error.map(|err| err.to_string()),
            duration_ms: started.elapsed().as_millis() as u64,
        },
        skipped: false,
        retries_used,
    }
}

async fn run_action(
    driver: &dyn PageDriver,
    step: &Step,
    plan: Option<&Plan>,
    options: &SessionOptions,
) -> Result<Option<Value>, EngineError> {
    match &step.action {
        StepAction::Navigate { url } => {
            let target = url
                .as_deref()
                .or(plan.map(|plan| plan.url.as_str()))
                .ok_or_else(|| EngineError::step(&step.id, "navigate step has no url"))?;
            driver.navigate(target, options.default_timeout).await?;
            Ok(None)
        }
        StepAction::Click { selector } => {
            driver.click(selector).await?;
            Ok(None)
        }
        StepAction::Type { selector, value } => {
            driver.type_text(selector, value).await?;
            Ok(None)
        }
        StepAction::Select { selector, value } => {
            driver.select_value(selector, value).await?;
            Ok(None)
        }
        StepAction::Hover { selector } => {
            driver.hover(selector).await?;
            Ok(None)
        }
        StepAction::KeyPress { key } => {
            driver.press_key(key).await?;
            Ok(None)
        }
        StepAction::Scroll { x, y, direction } => {
            let (dx, dy) = match (x, y, direction) {
                (Some(x), Some(y), _) => (*x, *y),
                (Some(x), None, _) => (*x, 0),
                (None, Some(y), _) => (0, *y),
                (None, None, Some(direction)) => match direction {
                    crate::types::ScrollDirection::Up => (0, -600),
                    crate::types::ScrollDirection::Down => (0, 600),
                    crate::types::ScrollDirection::Left => (-600, 0),
                    crate::types::ScrollDirection::Right => (600, 0),
                },
                (None, None, None) => (0, 600),
            };
            driver.scroll_by(dx, dy).await?;
            Ok(None)
        }
        StepAction::Wait { wait_time } => {
            sleep(Duration::from_millis(*wait_time)).await;
            Ok(None)
        }
        StepAction::WaitForSelector {
            selector,
            wait_time,
            state,
        } => {
            driver
                .wait_for_selector(selector, Duration::from_millis(*wait_time), *state)
                .await?;
            Ok(None)
        }
        StepAction::Extract {
            selector,
            multiple,
            attribute,
            kind,
        } => {
            // Title extraction reads the document title and only requires the
            // node to be attached, never visible.
            if selector.contains("title") {
                driver
                    .wait_for_selector(
                        selector,
                        options.default_timeout,
                        WaitState::Attached,
                    )
                    .await
                    .ok();
                let title = driver.document_title().await?;
                return Ok(Some(Value::String(title)));
            }
            let value = driver
                .extract(
                    selector,
                    &ExtractSpec {
                        multiple: *multiple,
                        attribute: attribute.clone(),
                        kind: *kind,
                    },
                )
                .await?;
            Ok(Some(value))
        }
        StepAction::Evaluate { script } => Ok(Some(driver.evaluate(script).await?)),
        StepAction::Screenshot { full_page } => {
            if !options.screenshots_enabled {
                return Ok(None);
            }
            let bytes = driver.screenshot(*full_page).await?;
            Ok(Some(Value::String(BASE64.encode(bytes))))
        }
        StepAction::Reload => {
            driver.reload().await?;
            Ok(None)
        }
        StepAction::GoBack => {
            driver.go_back().await?;
            Ok(None)
        }
        StepAction::GoForward => {
            driver.go_forward().await?;
            Ok(None)
        }
    }
}

/// Check success criteria (all must be truthy) and failure criteria (all
/// must be falsy). Returns the first violated criterion.
async fn validate_criteria(
    driver: &dyn PageDriver,
    plan: &Plan,
    steps_completed: u32,
    any_step_failed: bool,
) -> Result<(), String> {
    for criterion in &plan.validation.success_criteria {
        let satisfied = match criterion.as_str() {
            CRITERION_ALL_STEPS_OK => steps_completed == plan.steps.len() as u32,
            expression => match driver.evaluate(expression).await {
                Ok(value) => truthy(&value),
                Err(err) => {
                    // Non-evaluable success criteria are tolerated; promoted
                    // plans carry prose criteria that no page can evaluate.
                    warn!(criterion = %expression, %err, "success criterion not evaluable");
                    true
                }
            },
        };
        if !satisfied {
            return Err(criterion.clone());
        }
    }

    for criterion in &plan.validation.failure_criteria {
        let triggered = match criterion.as_str() {
            CRITERION_ANY_STEP_FAILED => any_step_failed,
            // Evaluation errors on failure criteria are ignored (falsy).
            expression => driver
                .evaluate(expression)
                .await
                .map(|value| truthy(&value))
                .unwrap_or(false),
        };
        if triggered {
            return Err(criterion.clone());
        }
    }

    Ok(())
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

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(text) => !text.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn classify_failure(message: &str) -> ExecutionStatus {
    let lowered = message.to_lowercase();
    if lowered.contains("navigation") && lowered.contains("timed out") {
        ExecutionStatus::Timeout
    } else if lowered.contains("cdp connection") || lowered.contains("failed to launch") {
        ExecutionStatus::Error
    } else {
        ExecutionStatus::Failed
    }
}
