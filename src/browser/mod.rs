//! Browser session management.
//!
//! One logical tab per session: launch (idempotent), action primitives via
//! the page driver, bounded state capture, and teardown that runs on every
//! exit path.

pub mod driver;
pub mod exec;

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chrono::Utc;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use which::which;

use crate::errors::{EngineError, EngineResult};
use crate::types::{BrowserState, ExecutionResult, Plan, Step, StepOutcome, Viewport};

use driver::{CdpDriver, PageDriver};

/// Captured DOM is bounded to keep prompts and stored states small.
pub const DOM_CAPTURE_LIMIT: usize = 100_000;
/// Sanitized page text is bounded harder; it feeds regeneration prompts.
pub const PAGE_TEXT_LIMIT: usize = 3_000;

#[derive(Clone, Debug)]
pub struct SessionOptions {
    pub headless: bool,
    pub viewport: Viewport,
    pub user_agent: Option<String>,
    pub headers: HashMap<String, String>,
    pub default_timeout: Duration,
    pub screenshots_enabled: bool,
    /// Explicit browser binary; when unset the `PATH` is scanned.
    pub chrome_executable: Option<PathBuf>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            headless: true,
            viewport: Viewport::default(),
            user_agent: None,
            headers: HashMap::new(),
            default_timeout: Duration::from_millis(30_000),
            screenshots_enabled: true,
            chrome_executable: None,
        }
    }
}

/// One headless tab plus the process behind it.
pub struct BrowserSession {
    driver: Arc<dyn PageDriver>,
    options: SessionOptions,
    browser: Mutex<Option<Browser>>,
    handler_task: Mutex<Option<JoinHandle<()>>>,
}

impl BrowserSession {
    /// Launch Chrome and open the tab. Idempotence lives one level up: the
    /// orchestrator keeps at most one session per invocation and reuses it.
    pub async fn launch(options: SessionOptions) -> EngineResult<Self> {
        let config = browser_config(&options)?;
        let (browser, mut handler) = Browser::launch(config).await.map_err(|err| {
            EngineError::internal(format!("failed to launch browser: {err}"))
        })?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        let page = browser.new_page("about:blank").await.map_err(|err| {
            EngineError::internal(format!("failed to open tab: {err}"))
        })?;
        let driver = CdpDriver::new(page);
        if let Some(user_agent) = &options.user_agent {
            driver.apply_user_agent(user_agent).await?;
        }
        driver.apply_headers(&options.headers).await?;

        info!(headless = options.headless, "browser session started");
        Ok(Self {
            driver: Arc::new(driver),
            options,
            browser: Mutex::new(Some(browser)),
            handler_task: Mutex::new(Some(handler_task)),
        })
    }

    /// Wrap an externally supplied driver (tests, embedded runtimes).
    pub fn with_driver(driver: Arc<dyn PageDriver>, options: SessionOptions) -> Self {
        Self {
            driver,
            options,
            browser: Mutex::new(None),
            handler_task: Mutex::new(None),
        }
    }

    pub fn driver(&self) -> Arc<dyn PageDriver> {
        self.driver.clone()
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn viewport(&self) -> Viewport {
        self.options.viewport
    }

    /// Replay a full plan.
    pub async fn execute(&self, plan: &Plan) -> ExecutionResult {
        exec::execute_plan(self.driver.as_ref(), plan, &self.options).await
    }

    /// Run a single step; used by the interactive agent, which owns the tab
    /// lifecycle and therefore skips per-step cleanup.
    pub async fn execute_step(&self, step: &Step, retry_limit: u32) -> StepOutcome {
        exec::execute_step(self.driver.as_ref(), step, None, retry_limit, &self.options)
            .await
            .outcome
    }

    /// Capture url, bounded DOM, screenshot, and viewport. Failures degrade
    /// to a partial state with `error` set; the caller's loop proceeds.
    pub async fn capture_state(&self, include_screenshot: bool) -> BrowserState {
        let mut state = BrowserState {
            viewport: self.options.viewport,
            captured_at: Utc::now(),
            ..BrowserState::default()
        };
        match self.driver.current_url().await {
            Ok(url) => state.url = url,
            Err(err) => state.error = Some(format!("url capture failed: {err}")),
        }
        match self.driver.dom_html().await {
            Ok(dom) => state.dom = bounded_dom(&dom),
            Err(err) => state.error = Some(format!("dom capture failed: {err}")),
        }
        if include_screenshot && self.options.screenshots_enabled {
            match self.driver.screenshot(false).await {
                Ok(bytes) => state.screenshot = Some(BASE64.encode(bytes)),
                Err(err) => {
                    // Screenshots are advisory; a failed capture is not fatal.
                    debug!(%err, "screenshot capture failed");
                }
            }
        }
        state
    }

    pub async fn current_url(&self) -> EngineResult<String> {
        self.driver.current_url().await
    }

    /// Sanitized visible text, bounded to [`PAGE_TEXT_LIMIT`].
    pub async fn page_text(&self) -> EngineResult<String> {
        let raw = self.driver.page_text().await?;
        let collapsed = crate::parsers::normalize_whitespace(&raw);
        Ok(collapsed.chars().take(PAGE_TEXT_LIMIT).collect())
    }

    /// Tear down the tab, browser, and process. Safe to call repeatedly.
    pub async fn stop(&self) {
        let _ = self.driver.close().await;
        let browser = self.browser.lock().take();
        if let Some(mut browser) = browser {
            if let Err(err) = browser.close().await {
                warn!(%err, "browser close failed");
            }
            let _ = browser.wait().await;
        }
        if let Some(task) = self.handler_task.lock().take() {
            task.abort();
        }
    }
}

/// Prefer the `<body>` when the full document exceeds the capture bound.
pub fn bounded_dom(html: &str) -> String {
    if html.len() <= DOM_CAPTURE_LIMIT {
        return html.to_string();
    }
    let from_body = html
        .find("<body")
        .map(|idx| &html[idx..])
        .unwrap_or(html);
    let mut bounded: String = from_body.chars().take(DOM_CAPTURE_LIMIT).collect();
    if from_body.len() > bounded.len() {
        bounded.push_str("<!-- truncated -->");
    }
    bounded
}

fn browser_config(options: &SessionOptions) -> EngineResult<BrowserConfig> {
    let mut builder = BrowserConfig::builder()
        .request_timeout(options.default_timeout)
        .launch_timeout(Duration::from_secs(20))
        .window_size(options.viewport.width, options.viewport.height)
        .user_data_dir(profile_dir()?);

    if !options.headless {
        builder = builder.with_head();
    }

    let mut args = vec![
        "--disable-background-networking",
        "--disable-background-timer-throttling",
        "--disable-breakpad",
        "--disable-client-side-phishing-detection",
        "--disable-component-update",
        "--disable-default-apps",
        "--disable-dev-shm-usage",
        "--disable-extensions",
        "--disable-hang-monitor",
        "--disable-popup-blocking",
        "--disable-prompt-on-repost",
        "--disable-sync",
        "--metrics-recording-only",
        "--no-first-run",
        "--no-default-browser-check",
        "--password-store=basic",
        "--use-mock-keychain",
    ];
    if options.headless {
        args.push("--headless=new");
        args.push("--hide-scrollbars");
        args.push("--mute-audio");
    }
    builder = builder.args(args);

    if let Some(executable) = locate_chrome(options.chrome_executable.as_deref()) {
        builder = builder.chrome_executable(executable);
    }

    builder
        .build()
        .map_err(|err| EngineError::internal(format!("browser config error: {err}")))
}

fn profile_dir() -> EngineResult<PathBuf> {
    let dir = env::temp_dir().join("pagewatch-profile");
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

// Chrome-family binaries worth trying on PATH, most specific first.
const CHROME_BINARY_NAMES: &[&str] = if cfg!(target_os = "windows") {
    &["chrome.exe", "chromium.exe", "msedge.exe"]
} else {
    &[
        "google-chrome-stable",
        "google-chrome",
        "chromium",
        "chromium-browser",
        "chrome",
    ]
};

/// Pick the browser binary. A configured executable (`PAGEWATCH_CHROME`,
/// carried through [`SessionOptions`]) wins when it exists; otherwise the
/// `PATH` is scanned and chromiumoxide's own discovery is the last resort.
fn locate_chrome(configured: Option<&std::path::Path>) -> Option<PathBuf> {
    match configured {
        Some(path) if path.exists() => Some(path.to_path_buf()),
        Some(path) => {
            warn!(path = %path.display(), "configured chrome executable not found; scanning PATH");
            scan_path_for_chrome()
        }
        None => scan_path_for_chrome(),
    }
}

fn scan_path_for_chrome() -> Option<PathBuf> {
    CHROME_BINARY_NAMES
        .iter()
        .find_map(|name| which(name).ok())
}
