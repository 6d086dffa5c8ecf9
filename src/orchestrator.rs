//! Per-task entry point: mode routing, cached replay, failure-driven
//! regeneration, and persistence of results and monitoring records.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::agent::{InteractiveAgent, InteractiveConfig, InteractiveOutcome};
use crate::browser::{BrowserSession, SessionOptions};
use crate::cache::PlanCache;
use crate::config::EngineConfig;
use crate::errors::{EngineError, EngineResult};
use crate::llm::LlmClient;
use crate::monitor;
use crate::planner::{PlanGenerator, PlanRequest};
use crate::prompts::PromptStore;
use crate::storage::StorageManager;
use crate::types::{
    ChangeRecord, ExecutionMode, ExecutionResult, ExecutionStatus, MonitoringSample, Plan,
    TaskInput,
};

/// Invocation deadline when the caller does not supply `timeoutMs`.
pub const DEFAULT_TASK_TIMEOUT_MS: u64 = 60_000;

/// Error-text fragments that mark a replay failure as selector/timeout
/// shaped, and therefore worth one regeneration pass.
const REGENERATION_MARKERS: &[&str] = &[
    "timeout",
    "selector",
    "element not found",
    "not visible",
    "waitforselector",
    "waitforelement",
    "locator",
    "exceeded",
];

/// Creates browser sessions; injectable so tests can substitute a scripted
/// driver for the real Chrome launcher.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn create(&self, options: SessionOptions) -> EngineResult<BrowserSession>;
}

pub struct ChromiumSessionFactory;

#[async_trait]
impl SessionFactory for ChromiumSessionFactory {
    async fn create(&self, options: SessionOptions) -> EngineResult<BrowserSession> {
        BrowserSession::launch(options).await
    }
}

/// Typed outcome per response shape; the gateway serializes these.
#[derive(Debug)]
pub enum TaskOutcome {
    Interactive(InteractiveReport),
    PlanOnly(PlanOnlyReport),
    Execution(ExecutionReport),
}

#[derive(Debug)]
pub struct InteractiveReport {
    pub plan_id: Option<String>,
    pub outcome: InteractiveOutcome,
    pub execution_id: Option<String>,
}

#[derive(Debug)]
pub struct PlanOnlyReport {
    pub plan: Plan,
    pub confidence: f64,
    pub reasoning: String,
    pub execution_time_ms: u64,
}

#[derive(Debug)]
pub struct ExecutionReport {
    pub result: ExecutionResult,
    pub execution_id: Option<String>,
    pub cache_hit: bool,
    pub plan_generated: bool,
    pub total_time_ms: u64,
}

pub struct Orchestrator {
    config: EngineConfig,
    prompts: Arc<PromptStore>,
    cache: PlanCache,
    storage: StorageManager,
    planner: PlanGenerator,
    fallback_planner: Option<PlanGenerator>,
    agent: InteractiveAgent,
    sessions: Arc<dyn SessionFactory>,
}

impl Orchestrator {
    pub fn new(
        config: EngineConfig,
        llm: Arc<dyn LlmClient>,
        llm_fallback: Option<Arc<dyn LlmClient>>,
        storage: StorageManager,
        sessions: Arc<dyn SessionFactory>,
    ) -> Self {
        let prompts = Arc::new(PromptStore::load(config.prompt_dir.as_deref()));
        let cache = PlanCache::new(storage.plans(), config.cache_ttl_days);
        let planner = PlanGenerator::new(llm.clone(), prompts.clone())
            .with_max_tokens(config.max_tokens);
        let fallback_planner = llm_fallback.map(|fallback| {
            PlanGenerator::new(fallback, prompts.clone()).with_max_tokens(config.max_tokens)
        });
        let agent = InteractiveAgent::new(
            llm,
            prompts.clone(),
            InteractiveConfig {
                temperature: config.temperature,
                max_tokens: config.max_tokens,
                ..InteractiveConfig::default()
            },
        );
        Self {
            config,
            prompts,
            cache,
            storage,
            planner,
            fallback_planner,
            agent,
            sessions,
        }
    }

    pub fn cache(&self) -> &PlanCache {
        &self.cache
    }

    pub fn storage(&self) -> &StorageManager {
        &self.storage
    }

    /// Run one task invocation under its deadline.
    pub async fn run(&self, input: TaskInput) -> EngineResult<TaskOutcome> {
        input.validate()?;
        let deadline = Duration::from_millis(
            input.options.timeout_ms.unwrap_or(DEFAULT_TASK_TIMEOUT_MS),
        );
        match tokio::time::timeout(deadline, self.route(&input)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(instruction = %input.instruction, "task deadline exceeded");
                Err(EngineError::nav_timeout(format!(
                    "task exceeded its {} ms deadline",
                    deadline.as_millis()
                )))
            }
        }
    }

    async fn route(&self, input: &TaskInput) -> EngineResult<TaskOutcome> {
        let signature = input.signature();
        let mode = input.options.execution_mode;

        if input.options.plan_only {
            return self.run_plan_only(input).await.map(TaskOutcome::PlanOnly);
        }
        if input.options.execution_only {
            return self
                .run_execution_only(input, &signature)
                .await
                .map(TaskOutcome::Execution);
        }

        // A cached plan short-circuits the interactive loop in both
        // interactive and auto modes.
        if matches!(mode, ExecutionMode::Interactive | ExecutionMode::Auto) {
            if !input.options.force_new_plan {
                if let Some(plan) = self.cache.get(&signature).await {
                    debug!(%signature, "cached plan found; replaying");
                    let report = self.replay_with_regeneration(input, plan, true).await?;
                    return Ok(TaskOutcome::Execution(report));
                }
            }
            let report = self.run_interactive(input).await?;
            let escalated = report.outcome.escalated_to_human;
            if !escalated || matches!(mode, ExecutionMode::Interactive) {
                return Ok(TaskOutcome::Interactive(report));
            }
            info!("interactive run escalated; auto mode falls back to plan generation");
        }

        let report = self.run_plan_mode(input, &signature).await?;
        Ok(TaskOutcome::Execution(report))
    }

    async fn run_interactive(&self, input: &TaskInput) -> EngineResult<InteractiveReport> {
        let session = self.sessions.create(self.session_options(input)).await?;
        let outcome = self.agent.execute_interactively(input, &session).await;
        session.stop().await;

        let mut plan_id = None;
        if let Some(plan) = &outcome.generated_plan {
            self.cache.put(plan, None).await;
            plan_id = Some(plan.id.clone());
        }

        let result = interactive_execution_result(input, &outcome, plan_id.clone());
        let execution_id = self.persist(input, &result).await;

        Ok(InteractiveReport {
            plan_id,
            outcome,
            execution_id,
        })
    }

    async fn run_plan_only(&self, input: &TaskInput) -> EngineResult<PlanOnlyReport> {
        let started = tokio::time::Instant::now();
        let generation = self
            .planner
            .generate_plan_with_fallback(
                &PlanRequest {
                    instruction: input.instruction.clone(),
                    url: input.url.clone(),
                    page_text: None,
                    failure_context: None,
                },
                self.fallback_planner.as_ref(),
            )
            .await;
        let Some(plan) = generation.plan else {
            return Err(EngineError::plan_generation(
                generation
                    .error
                    .unwrap_or_else(|| "plan generation failed".to_string()),
            ));
        };
        self.cache.put(&plan, None).await;
        Ok(PlanOnlyReport {
            plan,
            confidence: generation.confidence,
            reasoning: generation.reasoning,
            execution_time_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn run_execution_only(
        &self,
        input: &TaskInput,
        signature: &str,
    ) -> EngineResult<ExecutionReport> {
        let plan = match &input.options.plan_id {
            Some(plan_id) => self.cache.get_by_id(plan_id).await.ok_or_else(|| {
                EngineError::PlanNotFound {
                    reference: plan_id.clone(),
                }
            })?,
            None => {
                self.cache
                    .get(signature)
                    .await
                    .ok_or_else(|| EngineError::PlanNotFound {
                        reference: signature.to_string(),
                    })?
            }
        };
        self.replay_with_regeneration(input, plan, true).await
    }

    async fn run_plan_mode(
        &self,
        input: &TaskInput,
        signature: &str,
    ) -> EngineResult<ExecutionReport> {
        if !input.options.force_new_plan {
            if let Some(plan) = self.cache.get(signature).await {
                return self.replay_with_regeneration(input, plan, true).await;
            }
        }

        let generation = self
            .planner
            .generate_plan_with_fallback(
                &PlanRequest {
                    instruction: input.instruction.clone(),
                    url: input.url.clone(),
                    page_text: None,
                    failure_context: None,
                },
                self.fallback_planner.as_ref(),
            )
            .await;
        let Some(plan) = generation.plan else {
            return Err(EngineError::plan_generation(
                generation
                    .error
                    .unwrap_or_else(|| "plan generation failed".to_string()),
            ));
        };
        self.cache.put(&plan, None).await;
        let mut report = self.replay_with_regeneration(input, plan, false).await?;
        report.plan_generated = true;
        Ok(report)
    }

    /// Replay a plan; on a selector/timeout shaped failure, regenerate once
    /// with live page context and adopt the new result when it succeeds.
    async fn replay_with_regeneration(
        &self,
        input: &TaskInput,
        plan: Plan,
        cache_hit: bool,
    ) -> EngineResult<ExecutionReport> {
        let started = tokio::time::Instant::now();
        let session = self.sessions.create(self.session_options(input)).await?;
        let mut result = session.execute(&plan).await;
        result.task_id = input.task_id.clone();
        let mut plan_generated = false;

        if matches!(
            result.status,
            ExecutionStatus::Failed | ExecutionStatus::Error
        ) && should_regenerate(&result)
        {
            info!(plan = %plan.id, "replay failed with stale-plan markers; regenerating");
            let page_text = session.page_text().await.ok();
            let failure_context = result
                .error
                .as_ref()
                .map(|error| error.message.clone())
                .unwrap_or_else(|| "replay failed".to_string());

            let generation = self
                .planner
                .generate_plan_with_fallback(
                    &PlanRequest {
                        instruction: input.instruction.clone(),
                        url: input.url.clone(),
                        page_text,
                        failure_context: Some(failure_context),
                    },
                    self.fallback_planner.as_ref(),
                )
                .await;

            if let Some(new_plan) = generation.plan {
                let mut retry = session.execute(&new_plan).await;
                retry.task_id = input.task_id.clone();
                if retry.is_success() {
                    // A successful regeneration must overwrite the cache.
                    self.cache.refresh(&new_plan).await?;
                    result = retry;
                    plan_generated = true;
                } else {
                    debug!(plan = %new_plan.id, "regenerated plan also failed; keeping original result");
                }
            } else {
                warn!("regeneration produced no usable plan");
            }
        }

        session.stop().await;
        let execution_id = self.persist(input, &result).await;

        Ok(ExecutionReport {
            result,
            execution_id,
            cache_hit: cache_hit && !plan_generated,
            plan_generated,
            total_time_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Persist the execution result, then the monitoring sample, then the
    /// change record, strictly in that order.
    async fn persist(&self, input: &TaskInput, result: &ExecutionResult) -> Option<String> {
        let execution_id = match self.storage.results().append_result(result).await {
            Ok(id) => Some(id),
            Err(err) => {
                warn!(%err, "failed to persist execution result");
                None
            }
        };

        let Some(task_id) = &input.task_id else {
            return execution_id;
        };
        if !result.is_success() || !result.has_extracted_data() {
            return execution_id;
        }
        let Some(extracted) = &result.extracted_data else {
            return execution_id;
        };

        let monitoring = self.storage.monitoring();
        let previous = match monitoring.latest_sample(task_id).await {
            Ok(previous) => previous,
            Err(err) => {
                warn!(%err, "failed to load monitoring baseline");
                None
            }
        };

        let sample = MonitoringSample {
            task_id: task_id.clone(),
            url: input.url.clone(),
            extracted_data: extracted.clone(),
            execution_id: execution_id.clone(),
            captured_at: Utc::now(),
        };
        if let Err(err) = monitoring.append_sample(&sample).await {
            warn!(%err, "failed to persist monitoring sample");
            return execution_id;
        }

        let Some(previous) = previous else {
            debug!(task_id, "first observation; nothing to diff");
            return execution_id;
        };

        let prev_value = Value::Object(previous.extracted_data.clone());
        let curr_value = Value::Object(extracted.clone());
        let summary = monitor::has_changed(&prev_value, &curr_value);
        if summary.changed {
            info!(
                task_id,
                fields = ?summary.changed_fields,
                restock = summary.is_restock,
                "change detected"
            );
            let record = ChangeRecord {
                task_id: task_id.clone(),
                execution_id: execution_id.clone(),
                changed_fields: summary.changed_fields,
                is_restock: summary.is_restock,
                change_details: Some(monitor::change_details_json(&prev_value, &curr_value)),
                detected_at: summary.detected_at,
            };
            if let Err(err) = monitoring.append_change(&record).await {
                warn!(%err, "failed to persist change record");
            }
        }

        execution_id
    }

    fn session_options(&self, input: &TaskInput) -> SessionOptions {
        SessionOptions {
            headless: self.config.headless,
            viewport: input.options.viewport.unwrap_or_default(),
            user_agent: input.options.user_agent.clone(),
            headers: input.options.headers.clone(),
            default_timeout: self.config.browser_timeout,
            screenshots_enabled: input.options.screenshot_enabled.unwrap_or(true),
            chrome_executable: self.config.chrome_executable.clone(),
        }
    }

    pub fn prompts(&self) -> Arc<PromptStore> {
        self.prompts.clone()
    }
}

/// Whether a failed replay carries the selector/timeout markers that make a
/// regeneration pass worthwhile.
fn should_regenerate(result: &ExecutionResult) -> bool {
    let mut haystacks: Vec<String> = Vec::new();
    if let Some(error) = &result.error {
        haystacks.push(error.message.to_lowercase());
        if let Some(stack) = &error.stack {
            let lowered = stack.to_lowercase();
            if lowered.contains("timeout") || lowered.contains("selector") {
                return true;
            }
        }
    }
    haystacks.extend(result.logs.iter().map(|line| line.to_lowercase()));

    haystacks.iter().any(|haystack| {
        REGENERATION_MARKERS
            .iter()
            .any(|marker| haystack.contains(marker))
    })
}

fn interactive_execution_result(
    input: &TaskInput,
    outcome: &InteractiveOutcome,
    plan_id: Option<String>,
) -> ExecutionResult {
    let steps_total = outcome.steps.len() as u32;
    let steps_completed = outcome
        .steps
        .iter()
        .filter(|step| step.execution_result.success)
        .count() as u32;
    ExecutionResult {
        plan_id: plan_id.unwrap_or_else(|| "interactive".to_string()),
        task_id: input.task_id.clone(),
        status: if outcome.success {
            ExecutionStatus::Success
        } else {
            ExecutionStatus::Failed
        },
        extracted_data: (!outcome.extracted_data.is_empty())
            .then(|| outcome.extracted_data.clone()),
        screenshots: Vec::new(),
        logs: outcome
            .steps
            .iter()
            .map(|step| {
                format!(
                    "step {}: {} score={:.2}",
                    step.step_number,
                    step.action.action.kind(),
                    step.progress_score
                )
            })
            .collect(),
        error: outcome.escalation_reason.as_ref().map(|reason| {
            crate::types::ExecutionErrorInfo {
                message: reason.clone(),
                step: None,
                stack: None,
            }
        }),
        metrics: crate::types::ExecutionMetrics {
            execution_time_ms: outcome.total_duration_ms,
            steps_completed,
            steps_total,
            retry_count: 0,
        },
        created_at: Utc::now(),
    }
}
