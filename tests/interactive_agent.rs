//! Interactive agent loop: completion, extraction parsing, stagnation, and
//! the step budget, driven by a scripted model.

mod support;

use std::sync::Arc;

use serde_json::json;

use pagewatch::agent::{InteractiveAgent, InteractiveConfig};
use pagewatch::browser::{BrowserSession, SessionOptions};
use pagewatch::prompts::PromptStore;
use pagewatch::types::TaskInput;
use support::{FakeDriver, ScriptedLlm};

fn decision(action: serde_json::Value, score: f64, complete: bool) -> String {
    json!({
        "action": action,
        "progressEvaluation": { "score": score, "isComplete": complete },
        "reasoning": "scripted decision",
    })
    .to_string()
}

fn agent(llm: Arc<ScriptedLlm>, config: InteractiveConfig) -> InteractiveAgent {
    InteractiveAgent::new(llm, Arc::new(PromptStore::default()), config)
}

fn session(driver: Arc<FakeDriver>) -> BrowserSession {
    BrowserSession::with_driver(driver, SessionOptions::default())
}

#[tokio::test]
async fn completes_and_promotes_a_title_extraction() {
    let driver = FakeDriver::new();
    driver.set_title("Example Domain");
    let session = session(driver);

    let llm = ScriptedLlm::new(vec![
        decision(
            json!({ "type": "navigate", "url": "https://example.com" }),
            0.4,
            false,
        ),
        decision(
            json!({ "type": "extract", "selector": "title" }),
            0.95,
            true,
        ),
    ]);
    let agent = agent(llm, InteractiveConfig::default());

    let input = TaskInput::new(
        "Navigate to example.com and get the page title",
        "https://example.com",
    );
    let outcome = agent.execute_interactively(&input, &session).await;

    assert!(outcome.success);
    assert!(!outcome.escalated_to_human);
    assert!(outcome.steps.len() >= 1);
    assert_eq!(outcome.extracted_data["title"], "Example Domain");
    assert!(outcome.steps.last().unwrap().is_complete);

    let plan = outcome.generated_plan.expect("promoted plan");
    assert_eq!(plan.steps.len(), 2);
    assert_eq!(plan.steps[0].id, "step-1");
    assert!((plan.metadata.confidence - 0.95).abs() < f64::EPSILON);
}

#[tokio::test]
async fn flat_scores_escalate_with_stagnation_reason() {
    let driver = FakeDriver::new();
    driver.set_missing(".never-there");
    let session = session(driver);

    // The queue runs dry after the first decision; the scripted client then
    // repeats it, so every step clicks the same missing selector at 0.2.
    let llm = ScriptedLlm::new(vec![decision(
        json!({ "type": "click", "selector": ".never-there" }),
        0.2,
        false,
    )]);
    let config = InteractiveConfig::default();
    let stagnation_limit = config.stagnation_limit;
    let agent = agent(llm, config);

    let input = TaskInput::new("click the mystery button", "https://example.com");
    let outcome = agent.execute_interactively(&input, &session).await;

    assert!(!outcome.success);
    assert!(outcome.escalated_to_human);
    assert!(outcome.metadata.stagnation_detected);
    assert_eq!(outcome.steps.len(), stagnation_limit);
    let reason = outcome.escalation_reason.expect("reason");
    assert!(reason.contains("stagnation"));
    assert!(outcome.generated_plan.is_none());
}

#[tokio::test]
async fn rising_scores_run_to_the_step_budget() {
    let driver = FakeDriver::new();
    let session = session(driver);

    let decisions: Vec<String> = (1..=5)
        .map(|n| {
            decision(
                json!({ "type": "scroll", "y": 400 }),
                0.15 * n as f64,
                false,
            )
        })
        .collect();
    let llm = ScriptedLlm::new(decisions);
    let agent = agent(
        llm,
        InteractiveConfig {
            max_steps: 5,
            ..InteractiveConfig::default()
        },
    );

    let input = TaskInput::new("scroll to the bottom", "https://example.com");
    let outcome = agent.execute_interactively(&input, &session).await;

    assert!(!outcome.success);
    assert!(outcome.metadata.max_steps_reached);
    assert_eq!(outcome.steps.len(), 5);
    let reason = outcome.escalation_reason.expect("reason");
    assert!(reason.contains("max steps"));
}

#[tokio::test]
async fn malformed_decisions_degrade_to_wait() {
    let driver = FakeDriver::new();
    let session = session(driver);

    let llm = ScriptedLlm::new(vec!["no json at all".to_string()]);
    let agent = agent(
        llm,
        InteractiveConfig {
            max_steps: 3,
            ..InteractiveConfig::default()
        },
    );

    let input = TaskInput::new("get the title", "https://example.com");
    let outcome = agent.execute_interactively(&input, &session).await;

    assert!(!outcome.success);
    assert!(outcome.escalated_to_human);
    // Fallback waits score 0.0 every round, so the run ends in stagnation.
    assert!(outcome.metadata.stagnation_detected);
    assert!(outcome
        .steps
        .iter()
        .all(|step| step.action.action.kind() == "wait"));
}

#[tokio::test]
async fn progress_scores_stay_in_unit_range() {
    let driver = FakeDriver::new();
    driver.set_title("T");
    let session = session(driver);

    let llm = ScriptedLlm::new(vec![
        decision(json!({ "type": "extract", "selector": "title" }), 9.0, true),
    ]);
    let agent = agent(llm, InteractiveConfig::default());

    let input = TaskInput::new("get the title", "https://example.com");
    let outcome = agent.execute_interactively(&input, &session).await;

    assert!(outcome.success);
    for step in &outcome.steps {
        assert!((0.0..=1.0).contains(&step.progress_score));
    }
}
