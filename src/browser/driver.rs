//! Page driver seam.
//!
//! `PageDriver` is the minimal capability surface the replay executor and the
//! interactive agent need from a browser tab. The chromiumoxide-backed
//! implementation drives a real Chrome; tests substitute a scripted fake.

use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::input::{
    DispatchKeyEventParams, DispatchKeyEventType,
};
use chromiumoxide::cdp::browser_protocol::network::{Headers, SetExtraHttpHeadersParams};
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::page::ScreenshotParams;
use chromiumoxide::Page;
use serde_json::{json, Value};
use tokio::time::sleep;

use crate::errors::{EngineError, EngineResult};
use crate::types::{ExtractKind, WaitState};

/// Poll interval for selector waits.
const WAIT_POLL_MS: u64 = 100;
pub const SCREENSHOT_JPEG_QUALITY: i64 = 80;

#[derive(Clone, Debug)]
pub struct ExtractSpec {
    pub multiple: bool,
    pub attribute: Option<String>,
    pub kind: ExtractKind,
}

#[async_trait]
pub trait PageDriver: Send + Sync {
    async fn navigate(&self, url: &str, timeout: Duration) -> EngineResult<()>;
    async fn reload(&self) -> EngineResult<()>;
    async fn go_back(&self) -> EngineResult<()>;
    async fn go_forward(&self) -> EngineResult<()>;
    async fn click(&self, selector: &str) -> EngineResult<()>;
    async fn type_text(&self, selector: &str, value: &str) -> EngineResult<()>;
    async fn select_value(&self, selector: &str, value: &str) -> EngineResult<()>;
    async fn hover(&self, selector: &str) -> EngineResult<()>;
    async fn press_key(&self, key: &str) -> EngineResult<()>;
    async fn scroll_by(&self, x: i64, y: i64) -> EngineResult<()>;
    async fn wait_for_selector(
        &self,
        selector: &str,
        timeout: Duration,
        state: WaitState,
    ) -> EngineResult<()>;
    async fn extract(&self, selector: &str, spec: &ExtractSpec) -> EngineResult<Value>;
    async fn evaluate(&self, script: &str) -> EngineResult<Value>;
    async fn screenshot(&self, full_page: bool) -> EngineResult<Vec<u8>>;
    async fn current_url(&self) -> EngineResult<String>;
    async fn document_title(&self) -> EngineResult<String>;
    async fn dom_html(&self) -> EngineResult<String>;
    async fn page_text(&self) -> EngineResult<String>;
    async fn close(&self) -> EngineResult<()>;
}

/// Chromiumoxide-backed driver for one tab.
pub struct CdpDriver {
    page: Page,
}

impl CdpDriver {
    pub fn new(page: Page) -> Self {
        Self { page }
    }

    pub async fn apply_user_agent(&self, user_agent: &str) -> EngineResult<()> {
        self.page
            .set_user_agent(user_agent)
            .await
            .map_err(map_cdp)?;
        Ok(())
    }

    pub async fn apply_headers(
        &self,
        headers: &std::collections::HashMap<String, String>,
    ) -> EngineResult<()> {
        if headers.is_empty() {
            return Ok(());
        }
        let params = SetExtraHttpHeadersParams::new(Headers::new(json!(headers)));
        self.page.execute(params).await.map_err(map_cdp)?;
        Ok(())
    }

    async fn eval_value(&self, script: &str) -> EngineResult<Value> {
        let result = self.page.evaluate(script).await.map_err(map_cdp)?;
        Ok(result.value().cloned().unwrap_or(Value::Null))
    }

    async fn selector_state(&self, selector: &str, state: WaitState) -> EngineResult<bool> {
        let script = match state {
            WaitState::Attached => format!(
                "!!document.querySelector({sel})",
                sel = js_string(selector)
            ),
            WaitState::Visible => format!(
                r#"(() => {{
                    const el = document.querySelector({sel});
                    if (!el) return false;
                    const rect = el.getBoundingClientRect();
                    const style = window.getComputedStyle(el);
                    return rect.width > 0 && rect.height > 0 && style.visibility !== 'hidden';
                }})()"#,
                sel = js_string(selector)
            ),
        };
        Ok(self.eval_value(&script).await?.as_bool().unwrap_or(false))
    }
}

fn js_string(raw: &str) -> String {
    serde_json::to_string(raw).unwrap_or_else(|_| "\"\"".to_string())
}

fn map_cdp(err: chromiumoxide::error::CdpError) -> EngineError {
    use chromiumoxide::error::CdpError;
    match err {
        CdpError::Timeout => EngineError::nav_timeout("cdp command timed out"),
        other => EngineError::internal(format!("cdp error: {other}")),
    }
}

fn selector_not_found(selector: &str) -> EngineError {
    EngineError::internal(format!("element not found for selector '{selector}'"))
}

#[async_trait]
impl PageDriver for CdpDriver {
    async fn navigate(&self, url: &str, timeout: Duration) -> EngineResult<()> {
        let goto = async {
            self.page.goto(url).await.map_err(map_cdp)?;
            self.page.wait_for_navigation().await.map_err(map_cdp)?;
            Ok::<(), EngineError>(())
        };
        match tokio::time::timeout(timeout, goto).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::nav_timeout(format!(
                "navigation to {url} exceeded {} ms",
                timeout.as_millis()
            ))),
        }
    }

    async fn reload(&self) -> EngineResult<()> {
        self.page.reload().await.map_err(map_cdp)?;
        Ok(())
    }

    async fn go_back(&self) -> EngineResult<()> {
        self.eval_value("history.back()").await?;
        self.page.wait_for_navigation().await.map_err(map_cdp)?;
        Ok(())
    }

    async fn go_forward(&self) -> EngineResult<()> {
        self.eval_value("history.forward()").await?;
        self.page.wait_for_navigation().await.map_err(map_cdp)?;
        Ok(())
    }

    async fn click(&self, selector: &str) -> EngineResult<()> {
        let element = self
            .page
            .find_element(selector)
            .await
            .map_err(|_| selector_not_found(selector))?;
        element.scroll_into_view().await.map_err(map_cdp)?;
        element.click().await.map_err(map_cdp)?;
        Ok(())
    }

    async fn type_text(&self, selector: &str, value: &str) -> EngineResult<()> {
        let element = self
            .page
            .find_element(selector)
            .await
            .map_err(|_| selector_not_found(selector))?;
        element.click().await.map_err(map_cdp)?;
        element.type_str(value).await.map_err(map_cdp)?;
        Ok(())
    }

    async fn select_value(&self, selector: &str, value: &str) -> EngineResult<()> {
        let script = format!(
            r#"(() => {{
                const el = document.querySelector({sel});
                if (!el) return false;
                el.value = {val};
                el.dispatchEvent(new Event('input', {{ bubbles: true }}));
                el.dispatchEvent(new Event('change', {{ bubbles: true }}));
                return true;
            }})()"#,
            sel = js_string(selector),
            val = js_string(value),
        );
        match self.eval_value(&script).await?.as_bool() {
            Some(true) => Ok(()),
            _ => Err(selector_not_found(selector)),
        }
    }

    async fn hover(&self, selector: &str) -> EngineResult<()> {
        let element = self
            .page
            .find_element(selector)
            .await
            .map_err(|_| selector_not_found(selector))?;
        element.hover().await.map_err(map_cdp)?;
        Ok(())
    }

    async fn press_key(&self, key: &str) -> EngineResult<()> {
        let (text, key_code) = key_details(key);
        let mut down = DispatchKeyEventParams::builder()
            .r#type(DispatchKeyEventType::KeyDown)
            .key(key.to_string());
        let mut up = DispatchKeyEventParams::builder()
            .r#type(DispatchKeyEventType::KeyUp)
            .key(key.to_string());
        if let Some(code) = key_code {
            down = down.windows_virtual_key_code(code);
            up = up.windows_virtual_key_code(code);
        }
        if let Some(text) = text {
            down = down.text(text);
        }
        let down = down
            .build()
            .map_err(|err| EngineError::internal(format!("key event build failed: {err}")))?;
        let up = up
            .build()
            .map_err(|err| EngineError::internal(format!("key event build failed: {err}")))?;
        self.page.execute(down).await.map_err(map_cdp)?;
        self.page.execute(up).await.map_err(map_cdp)?;
        Ok(())
    }

    async fn scroll_by(&self, x: i64, y: i64) -> EngineResult<()> {
        self.eval_value(&format!("window.scrollBy({x}, {y})")).await?;
        Ok(())
    }

    async fn wait_for_selector(
        &self,
        selector: &str,
        timeout: Duration,
        state: WaitState,
    ) -> EngineResult<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.selector_state(selector, state).await? {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(EngineError::internal(format!(
                    "waitForSelector timed out after {} ms for selector '{selector}'",
                    timeout.as_millis()
                )));
            }
            sleep(Duration::from_millis(WAIT_POLL_MS)).await;
        }
    }

    async fn extract(&self, selector: &str, spec: &ExtractSpec) -> EngineResult<Value> {
        let accessor = match spec.kind {
            ExtractKind::Text => "el.innerText || el.textContent || ''".to_string(),
            ExtractKind::Html => "el.innerHTML".to_string(),
            ExtractKind::Value => "el.value !== undefined ? el.value : ''".to_string(),
            ExtractKind::Attribute => format!(
                "el.getAttribute({attr})",
                attr = js_string(spec.attribute.as_deref().unwrap_or(""))
            ),
        };
        let script = format!(
            r#"(() => {{
                const nodes = Array.from(document.querySelectorAll({sel}));
                if (nodes.length === 0) return null;
                const read = (el) => {accessor};
                return {pick};
            }})()"#,
            sel = js_string(selector),
            accessor = accessor,
            pick = if spec.multiple {
                "nodes.map(read)"
            } else {
                "read(nodes[0])"
            },
        );
        let value = self.eval_value(&script).await?;
        if value.is_null() {
            return Err(selector_not_found(selector));
        }
        Ok(value)
    }

    async fn evaluate(&self, script: &str) -> EngineResult<Value> {
        self.eval_value(script).await
    }

    async fn screenshot(&self, full_page: bool) -> EngineResult<Vec<u8>> {
        let params = ScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Jpeg)
            .quality(SCREENSHOT_JPEG_QUALITY)
            .full_page(full_page)
            .build();
        self.page.screenshot(params).await.map_err(map_cdp)
    }

    async fn current_url(&self) -> EngineResult<String> {
        match self.page.url().await.map_err(map_cdp)? {
            Some(url) => Ok(url),
            None => Ok(self
                .eval_value("window.location.href")
                .await?
                .as_str()
                .unwrap_or("about:blank")
                .to_string()),
        }
    }

    async fn document_title(&self) -> EngineResult<String> {
        Ok(self
            .eval_value("document.title")
            .await?
            .as_str()
            .unwrap_or_default()
            .to_string())
    }

    async fn dom_html(&self) -> EngineResult<String> {
        self.page.content().await.map_err(map_cdp)
    }

    async fn page_text(&self) -> EngineResult<String> {
        let script = r#"(() => {
            if (!document.body) return '';
            const clone = document.body.cloneNode(true);
            clone.querySelectorAll('script, style, noscript, template').forEach(n => n.remove());
            return clone.innerText || clone.textContent || '';
        })()"#;
        Ok(self
            .eval_value(script)
            .await?
            .as_str()
            .unwrap_or_default()
            .to_string())
    }

    async fn close(&self) -> EngineResult<()> {
        // The session owns browser shutdown; closing the page is best-effort.
        let _ = self.page.execute(
            chromiumoxide::cdp::browser_protocol::page::CloseParams::default(),
        )
        .await;
        Ok(())
    }
}

fn key_details(key: &str) -> (Option<String>, Option<i64>) {
    match key {
        "Enter" => (Some("\r".to_string()), Some(13)),
        "Tab" => (None, Some(9)),
        "Escape" => (None, Some(27)),
        "Backspace" => (None, Some(8)),
        "ArrowUp" => (None, Some(38)),
        "ArrowDown" => (None, Some(40)),
        "ArrowLeft" => (None, Some(37)),
        "ArrowRight" => (None, Some(39)),
        other if other.chars().count() == 1 => (Some(other.to_string()), None),
        _ => (None, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn js_string_escapes_quotes() {
        assert_eq!(js_string("a\"b"), "\"a\\\"b\"");
    }

    #[test]
    fn key_details_cover_common_keys() {
        assert_eq!(key_details("Enter"), (Some("\r".to_string()), Some(13)));
        assert_eq!(key_details("a"), (Some("a".to_string()), None));
        assert_eq!(key_details("F13"), (None, None));
    }
}
