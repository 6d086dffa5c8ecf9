//! Replay executor semantics: retries, optional steps, conditions, and
//! validation criteria, driven through a scripted page driver.

mod support;

use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use pagewatch::browser::{BrowserSession, SessionOptions};
use pagewatch::types::{
    ErrorHandling, ExecutionStatus, Plan, PlanMetadata, PlanValidation, Step, StepAction,
    WaitState,
};
use support::FakeDriver;

fn plan_with(steps: Vec<Step>, validation: PlanValidation) -> Plan {
    Plan {
        id: Plan::new_id(),
        task_signature: "sig".into(),
        instruction: "check the price".into(),
        url: "https://example.com/shop".into(),
        steps,
        expected_results: Vec::new(),
        error_handling: ErrorHandling {
            retry_count: 1,
            timeout_ms: 5_000,
            fallback_steps: Vec::new(),
        },
        validation,
        metadata: PlanMetadata {
            created_at: Utc::now(),
            model_id: "test".into(),
            confidence: 0.9,
            estimated_duration_ms: 3_000,
        },
    }
}

fn session(driver: std::sync::Arc<FakeDriver>) -> BrowserSession {
    BrowserSession::with_driver(
        driver,
        SessionOptions {
            default_timeout: Duration::from_millis(200),
            ..SessionOptions::default()
        },
    )
}

#[tokio::test]
async fn successful_replay_extracts_and_parses() {
    let driver = FakeDriver::new();
    driver.set_extract(".price", json!("165 kr"));
    let session = session(driver.clone());

    let plan = plan_with(
        vec![
            Step::new("step-1", "open", StepAction::Navigate { url: None }),
            Step::new(
                "step-2",
                "read price",
                StepAction::Extract {
                    selector: ".price".into(),
                    multiple: false,
                    attribute: None,
                    kind: Default::default(),
                },
            ),
        ],
        PlanValidation::default(),
    );

    let result = session.execute(&plan).await;
    assert_eq!(result.status, ExecutionStatus::Success);
    assert_eq!(result.metrics.steps_completed, 2);
    assert_eq!(result.metrics.steps_total, 2);

    let data = result.extracted_data.expect("extracted data");
    assert_eq!(data["step-2"], "165 kr");
    assert_eq!(data["price"], 165);
    assert_eq!(data["currency"], "SEK");
    assert!(driver
        .calls()
        .iter()
        .any(|call| call == "navigate https://example.com/shop"));
}

#[tokio::test]
async fn mandatory_step_failure_stops_the_run() {
    let driver = FakeDriver::new();
    driver.set_missing(".buy");
    let session = session(driver);

    let plan = plan_with(
        vec![
            Step::new("step-1", "open", StepAction::Navigate { url: None }),
            Step::new(
                "step-2",
                "press buy",
                StepAction::Click {
                    selector: ".buy".into(),
                },
            ),
            Step::new("step-3", "never runs", StepAction::Reload),
        ],
        PlanValidation::default(),
    );

    let result = session.execute(&plan).await;
    assert_eq!(result.status, ExecutionStatus::Failed);
    assert!(result.metrics.steps_completed < result.metrics.steps_total);
    let error = result.error.expect("error");
    assert_eq!(error.step.as_deref(), Some("step-2"));
    assert!(error.message.contains("selector"));
}

#[tokio::test]
async fn optional_step_failures_are_skipped() {
    let driver = FakeDriver::new();
    driver.set_missing(".banner-dismiss");
    driver.set_extract(".price", json!("165 kr"));
    let session = session(driver);

    let mut dismiss = Step::new(
        "step-2",
        "dismiss the banner",
        StepAction::Click {
            selector: ".banner-dismiss".into(),
        },
    );
    dismiss.optional = true;

    let plan = plan_with(
        vec![
            Step::new("step-1", "open", StepAction::Navigate { url: None }),
            dismiss,
            Step::new(
                "step-3",
                "read price",
                StepAction::Extract {
                    selector: ".price".into(),
                    multiple: false,
                    attribute: None,
                    kind: Default::default(),
                },
            ),
        ],
        PlanValidation::default(),
    );

    let result = session.execute(&plan).await;
    assert_eq!(result.status, ExecutionStatus::Success);
    assert!(result.extracted_data.is_some());
}

#[tokio::test]
async fn falsy_condition_skips_without_failing() {
    let driver = FakeDriver::new();
    driver.set_evaluation("window.__cookieBanner", json!(false));
    let session = session(driver.clone());

    let mut conditional = Step::new(
        "step-2",
        "close cookie banner",
        StepAction::Click {
            selector: ".cookie-close".into(),
        },
    );
    conditional.condition = Some("window.__cookieBanner".into());

    let plan = plan_with(
        vec![
            Step::new("step-1", "open", StepAction::Navigate { url: None }),
            conditional,
        ],
        PlanValidation::default(),
    );

    let result = session.execute(&plan).await;
    assert_eq!(result.status, ExecutionStatus::Success);
    assert_eq!(result.metrics.steps_completed, 2);
    assert!(!driver.calls().iter().any(|call| call.starts_with("click")));
}

#[tokio::test]
async fn violated_success_criterion_fails_validation() {
    let driver = FakeDriver::new();
    driver.set_evaluation("document.querySelector('.price') !== null", json!(false));
    let session = session(driver);

    let plan = plan_with(
        vec![Step::new("step-1", "open", StepAction::Navigate { url: None })],
        PlanValidation {
            success_criteria: vec!["document.querySelector('.price') !== null".into()],
            failure_criteria: Vec::new(),
        },
    );

    let result = session.execute(&plan).await;
    assert_eq!(result.status, ExecutionStatus::Failed);
    let error = result.error.expect("error");
    assert!(error.message.contains("validation failed"));
    assert!(error.message.contains(".price"));
}

#[tokio::test]
async fn failure_criterion_evaluation_errors_are_ignored() {
    let driver = FakeDriver::new();
    let session = session(driver);

    // The fake returns Null for unknown expressions, which is falsy; the
    // criterion therefore never triggers.
    let plan = plan_with(
        vec![Step::new("step-1", "open", StepAction::Navigate { url: None })],
        PlanValidation {
            success_criteria: Vec::new(),
            failure_criteria: vec!["document.querySelector('.error-page') !== null".into()],
        },
    );

    let result = session.execute(&plan).await;
    assert_eq!(result.status, ExecutionStatus::Success);
}

#[tokio::test]
async fn navigation_timeout_classifies_as_timeout() {
    let driver = FakeDriver::new();
    driver.set_navigate_delay(Duration::from_millis(500));
    let session = session(driver);

    let plan = plan_with(
        vec![Step::new("step-1", "open", StepAction::Navigate { url: None })],
        PlanValidation::default(),
    );

    let result = session.execute(&plan).await;
    assert_eq!(result.status, ExecutionStatus::Timeout);
}

#[tokio::test]
async fn title_selector_reads_the_document_title() {
    let driver = FakeDriver::new();
    driver.set_title("Example Domain");
    let session = session(driver);

    let plan = plan_with(
        vec![
            Step::new("step-1", "open", StepAction::Navigate { url: None }),
            Step::new(
                "step-2",
                "read title",
                StepAction::Extract {
                    selector: "head title".into(),
                    multiple: false,
                    attribute: None,
                    kind: Default::default(),
                },
            ),
        ],
        PlanValidation::default(),
    );

    let result = session.execute(&plan).await;
    assert_eq!(result.status, ExecutionStatus::Success);
    let data = result.extracted_data.expect("data");
    assert_eq!(data["step-2"], "Example Domain");
}

#[tokio::test]
async fn wait_for_selector_failure_mentions_the_selector() {
    let driver = FakeDriver::new();
    driver.set_missing(".late");
    let session = session(driver);

    let plan = plan_with(
        vec![Step::new(
            "step-1",
            "wait for content",
            StepAction::WaitForSelector {
                selector: ".late".into(),
                wait_time: 50,
                state: WaitState::Visible,
            },
        )],
        PlanValidation::default(),
    );

    let result = session.execute(&plan).await;
    assert_eq!(result.status, ExecutionStatus::Failed);
    let message = result.error.expect("error").message;
    assert!(message.contains("waitForSelector"));
    assert!(message.contains(".late"));
}
