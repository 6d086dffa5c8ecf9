//! Request envelope parsing and response shaping.
//!
//! The core consumes a `TaskInput`, either bare or wrapped in an
//! API-gateway-style envelope whose `body` is a JSON string. Replies are
//! `{statusCode, headers, body}` shaped, with per-mode body fields.

use std::collections::HashMap;

use serde::Serialize;
use serde_json::{json, Value};

use crate::errors::{EngineError, EngineResult};
use crate::orchestrator::{
    ExecutionReport, InteractiveReport, PlanOnlyReport, TaskOutcome,
};
use crate::types::TaskInput;

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayResponse {
    pub status_code: u16,
    pub headers: HashMap<String, String>,
    pub body: String,
}

impl GatewayResponse {
    fn json(status_code: u16, body: Value) -> Self {
        let mut headers = HashMap::new();
        headers.insert("Content-Type".to_string(), "application/json".to_string());
        Self {
            status_code,
            headers,
            body: body.to_string(),
        }
    }
}

/// Accepts a bare `TaskInput` object or a gateway envelope carrying one in
/// its `body` string.
pub fn parse_task_input(payload: &Value) -> EngineResult<TaskInput> {
    let effective = if looks_like_envelope(payload) {
        let body = payload
            .get("body")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::validation("envelope body must be a JSON string"))?;
        serde_json::from_str::<Value>(body)
            .map_err(|err| EngineError::validation(format!("envelope body invalid: {err}")))?
    } else {
        payload.clone()
    };
    serde_json::from_value(effective)
        .map_err(|err| EngineError::validation(format!("invalid task input: {err}")))
}

fn looks_like_envelope(payload: &Value) -> bool {
    payload.get("body").map(Value::is_string).unwrap_or(false)
        && (payload.get("httpMethod").is_some() || payload.get("requestContext").is_some())
}

/// Map a finished task (or its error) onto the wire response.
pub fn respond(outcome: EngineResult<TaskOutcome>) -> GatewayResponse {
    match outcome {
        Ok(TaskOutcome::Interactive(report)) => interactive_response(report),
        Ok(TaskOutcome::PlanOnly(report)) => plan_only_response(report),
        Ok(TaskOutcome::Execution(report)) => execution_response(report),
        Err(err) => error_response(&err),
    }
}

pub fn error_response(err: &EngineError) -> GatewayResponse {
    let mut error_body = json!({
        "code": err.code(),
        "message": err.to_string(),
    });
    if let Some(details) = err.details() {
        error_body["details"] = details;
    }
    GatewayResponse::json(
        err.http_status(),
        json!({ "success": false, "error": error_body }),
    )
}

fn interactive_response(report: InteractiveReport) -> GatewayResponse {
    let outcome = &report.outcome;
    let steps: Vec<Value> = outcome
        .steps
        .iter()
        .map(|step| {
            json!({
                "stepNumber": step.step_number,
                "action": step.action,
                "progressScore": step.progress_score,
                "isComplete": step.is_complete,
                "reasoning": step.reasoning,
            })
        })
        .collect();
    let steps_completed = outcome
        .steps
        .iter()
        .filter(|step| step.execution_result.success)
        .count();

    // Escalation is recoverable from the caller's point of view: 200 with
    // success=false and the reason.
    let body = json!({
        "success": outcome.success,
        "mode": "interactive",
        "planId": report.plan_id,
        "status": if outcome.success { "success" } else { "failed" },
        "extractedData": outcome.extracted_data,
        "interactiveSteps": steps,
        "metrics": {
            "executionTimeMs": outcome.total_duration_ms,
            "stepsCompleted": steps_completed,
            "stepsTotal": outcome.steps.len(),
            "averageProgressScore": outcome.metadata.average_progress_score,
            "maxStepsReached": outcome.metadata.max_steps_reached,
            "stagnationDetected": outcome.metadata.stagnation_detected,
        },
        "escalation": {
            "escalated": outcome.escalated_to_human,
            "reason": outcome.escalation_reason,
        },
    });
    GatewayResponse::json(200, body)
}

fn plan_only_response(report: PlanOnlyReport) -> GatewayResponse {
    let steps: Vec<Value> = report
        .plan
        .steps
        .iter()
        .map(|step| {
            json!({
                "id": step.id,
                "type": step.action.kind(),
                "description": step.description,
                "selector": step.action.selector(),
            })
        })
        .collect();
    let body = json!({
        "success": true,
        "mode": "plan_only",
        "planId": report.plan.id,
        "taskSignature": report.plan.task_signature,
        "planDetails": {
            "steps": steps,
            "estimatedDuration": report.plan.metadata.estimated_duration_ms,
            "confidence": report.confidence,
            "reasoning": report.reasoning,
        },
        "executionTime": report.execution_time_ms,
        "message": "plan generated and cached; execution skipped",
    });
    GatewayResponse::json(200, body)
}

fn execution_response(report: ExecutionReport) -> GatewayResponse {
    let result = &report.result;
    let status_code = match result.status {
        crate::types::ExecutionStatus::Timeout => 408,
        _ => 200,
    };
    let body = json!({
        "success": result.is_success(),
        "planId": result.plan_id,
        "executionId": report.execution_id,
        "status": result.status,
        "extractedData": result.extracted_data,
        "screenshots": result.screenshots.len(),
        "metrics": {
            "executionTimeMs": result.metrics.execution_time_ms,
            "stepsCompleted": result.metrics.steps_completed,
            "stepsTotal": result.metrics.steps_total,
            "retryCount": result.metrics.retry_count,
            "totalTime": report.total_time_ms,
            "planGenerated": report.plan_generated,
            "cacheHit": report.cache_hit,
        },
        "logs": result.logs,
        "error": result.error,
    });
    GatewayResponse::json(status_code, body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_task_input() {
        let payload = json!({
            "instruction": "get the title",
            "url": "https://example.com",
        });
        let input = parse_task_input(&payload).unwrap();
        assert_eq!(input.instruction, "get the title");
    }

    #[test]
    fn parses_gateway_envelope() {
        let inner = json!({
            "instruction": "get the title",
            "url": "https://example.com",
            "options": { "planOnly": true },
        });
        let payload = json!({
            "body": inner.to_string(),
            "httpMethod": "POST",
            "headers": {},
            "requestContext": {},
        });
        let input = parse_task_input(&payload).unwrap();
        assert!(input.options.plan_only);
    }

    #[test]
    fn envelope_with_non_string_body_is_rejected() {
        let payload = json!({
            "body": { "instruction": "x" },
            "httpMethod": "POST",
        });
        // Not recognized as an envelope; fails TaskInput deserialization.
        assert!(parse_task_input(&payload).is_err());
    }

    #[test]
    fn error_responses_carry_code_and_status() {
        let response = error_response(&EngineError::PlanNotFound {
            reference: "sig".into(),
        });
        assert_eq!(response.status_code, 404);
        let body: Value = serde_json::from_str(&response.body).unwrap();
        assert_eq!(body["error"]["code"], "NO_CACHED_PLAN");
        assert_eq!(body["success"], false);
    }

    #[test]
    fn validation_errors_map_to_400() {
        let response = error_response(&EngineError::validation("bad input"));
        assert_eq!(response.status_code, 400);
    }
}
