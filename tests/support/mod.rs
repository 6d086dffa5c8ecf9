//! Shared test doubles: a scripted page driver and a scripted LLM client.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use pagewatch::browser::driver::{ExtractSpec, PageDriver};
use pagewatch::browser::{BrowserSession, SessionOptions};
use pagewatch::errors::{EngineError, EngineResult};
use pagewatch::llm::{
    ChatMessage, Completion, CompletionOptions, CompletionStream, LlmClient, StreamChunk,
};
use pagewatch::orchestrator::SessionFactory;
use pagewatch::types::{TokenUsage, WaitState};

/// Scripted page driver: selector lookups resolve against a fixed table and
/// every call is recorded for assertions.
#[derive(Default)]
pub struct FakeDriver {
    state: Mutex<FakeDriverState>,
}

#[derive(Default)]
struct FakeDriverState {
    extracts: HashMap<String, Value>,
    missing_selectors: HashSet<String>,
    evaluations: HashMap<String, Value>,
    title: String,
    url: String,
    page_text: String,
    navigate_delay: Option<Duration>,
    calls: Vec<String>,
}

impl FakeDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_extract(&self, selector: &str, value: Value) {
        self.state
            .lock()
            .extracts
            .insert(selector.to_string(), value);
    }

    pub fn set_missing(&self, selector: &str) {
        self.state
            .lock()
            .missing_selectors
            .insert(selector.to_string());
    }

    pub fn clear_missing(&self, selector: &str) {
        self.state.lock().missing_selectors.remove(selector);
    }

    pub fn set_evaluation(&self, script: &str, value: Value) {
        self.state
            .lock()
            .evaluations
            .insert(script.to_string(), value);
    }

    pub fn set_title(&self, title: &str) {
        self.state.lock().title = title.to_string();
    }

    pub fn set_page_text(&self, text: &str) {
        self.state.lock().page_text = text.to_string();
    }

    pub fn set_navigate_delay(&self, delay: Duration) {
        self.state.lock().navigate_delay = Some(delay);
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    fn record(&self, call: String) {
        self.state.lock().calls.push(call);
    }

    fn check_selector(&self, selector: &str) -> EngineResult<()> {
        if self.state.lock().missing_selectors.contains(selector) {
            Err(EngineError::internal(format!(
                "element not found for selector '{selector}'"
            )))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PageDriver for FakeDriver {
    async fn navigate(&self, url: &str, timeout: Duration) -> EngineResult<()> {
        self.record(format!("navigate {url}"));
        let delay = self.state.lock().navigate_delay;
        if let Some(delay) = delay {
            if delay > timeout {
                return Err(EngineError::nav_timeout(format!(
                    "navigation to {url} exceeded {} ms",
                    timeout.as_millis()
                )));
            }
            tokio::time::sleep(delay).await;
        }
        self.state.lock().url = url.to_string();
        Ok(())
    }

    async fn reload(&self) -> EngineResult<()> {
        self.record("reload".into());
        Ok(())
    }

    async fn go_back(&self) -> EngineResult<()> {
        self.record("go_back".into());
        Ok(())
    }

    async fn go_forward(&self) -> EngineResult<()> {
        self.record("go_forward".into());
        Ok(())
    }

    async fn click(&self, selector: &str) -> EngineResult<()> {
        self.record(format!("click {selector}"));
        self.check_selector(selector)
    }

    async fn type_text(&self, selector: &str, value: &str) -> EngineResult<()> {
        self.record(format!("type {selector}={value}"));
        self.check_selector(selector)
    }

    async fn select_value(&self, selector: &str, value: &str) -> EngineResult<()> {
        self.record(format!("select {selector}={value}"));
        self.check_selector(selector)
    }

    async fn hover(&self, selector: &str) -> EngineResult<()> {
        self.record(format!("hover {selector}"));
        self.check_selector(selector)
    }

    async fn press_key(&self, key: &str) -> EngineResult<()> {
        self.record(format!("press {key}"));
        Ok(())
    }

    async fn scroll_by(&self, x: i64, y: i64) -> EngineResult<()> {
        self.record(format!("scroll {x},{y}"));
        Ok(())
    }

    async fn wait_for_selector(
        &self,
        selector: &str,
        timeout: Duration,
        _state: WaitState,
    ) -> EngineResult<()> {
        self.record(format!("wait_for {selector}"));
        self.check_selector(selector).map_err(|_| {
            EngineError::internal(format!(
                "waitForSelector timed out after {} ms for selector '{selector}'",
                timeout.as_millis()
            ))
        })
    }

    async fn extract(&self, selector: &str, _spec: &ExtractSpec) -> EngineResult<Value> {
        self.record(format!("extract {selector}"));
        self.check_selector(selector)?;
        self.state
            .lock()
            .extracts
            .get(selector)
            .cloned()
            .ok_or_else(|| {
                EngineError::internal(format!("element not found for selector '{selector}'"))
            })
    }

    async fn evaluate(&self, script: &str) -> EngineResult<Value> {
        self.record(format!("evaluate {script}"));
        Ok(self
            .state
            .lock()
            .evaluations
            .get(script)
            .cloned()
            .unwrap_or(Value::Null))
    }

    async fn screenshot(&self, _full_page: bool) -> EngineResult<Vec<u8>> {
        self.record("screenshot".into());
        Ok(vec![0xff, 0xd8, 0xff])
    }

    async fn current_url(&self) -> EngineResult<String> {
        Ok(self.state.lock().url.clone())
    }

    async fn document_title(&self) -> EngineResult<String> {
        Ok(self.state.lock().title.clone())
    }

    async fn dom_html(&self) -> EngineResult<String> {
        let state = self.state.lock();
        Ok(format!(
            "<html><head><title>{}</title></head><body>{}</body></html>",
            state.title, state.page_text
        ))
    }

    async fn page_text(&self) -> EngineResult<String> {
        Ok(self.state.lock().page_text.clone())
    }

    async fn close(&self) -> EngineResult<()> {
        self.record("close".into());
        Ok(())
    }
}

/// Scripted LLM: returns queued response bodies in order; repeats the last
/// one when the queue runs dry.
pub struct ScriptedLlm {
    responses: Mutex<VecDeque<String>>,
    last: Mutex<Option<String>>,
}

impl ScriptedLlm {
    pub fn new(responses: Vec<String>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            last: Mutex::new(None),
        })
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn complete(
        &self,
        _messages: &[ChatMessage],
        _options: &CompletionOptions,
    ) -> EngineResult<Completion> {
        let next = self.responses.lock().pop_front();
        let content = match next {
            Some(content) => {
                *self.last.lock() = Some(content.clone());
                content
            }
            None => self
                .last
                .lock()
                .clone()
                .ok_or_else(|| EngineError::internal("scripted llm exhausted"))?,
        };
        Ok(Completion {
            content,
            usage: TokenUsage {
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 15,
            },
            model: "scripted".into(),
            finish_reason: Some("stop".into()),
        })
    }

    async fn complete_stream(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> EngineResult<CompletionStream> {
        let completion = self.complete(messages, options).await?;
        let chunk = StreamChunk {
            chunk_content: completion.content.clone(),
            cumulative_content: completion.content,
            usage: Some(completion.usage),
            is_complete: true,
        };
        Ok(Box::pin(futures::stream::once(async move { Ok(chunk) })))
    }

    fn estimate_cost(&self, _prompt_tokens: u64, _completion_tokens: u64) -> f64 {
        0.0
    }

    async fn test_connection(&self) -> bool {
        true
    }

    fn model_id(&self) -> &str {
        "scripted"
    }
}

/// Session factory handing out sessions backed by one shared fake driver.
pub struct FakeSessionFactory {
    driver: Arc<FakeDriver>,
}

impl FakeSessionFactory {
    pub fn new(driver: Arc<FakeDriver>) -> Arc<Self> {
        Arc::new(Self { driver })
    }
}

#[async_trait]
impl SessionFactory for FakeSessionFactory {
    async fn create(&self, options: SessionOptions) -> EngineResult<BrowserSession> {
        Ok(BrowserSession::with_driver(self.driver.clone(), options))
    }
}
