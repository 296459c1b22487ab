//! Executes parsed actions against a browser session.

use std::sync::Arc;

use serde_json::{Value, json};
use tracing::{debug, warn};
use url::Url;

use crate::browser::{Browser, BrowserHandle};
use crate::dom::{LOCATION_JS, extract_text_script};
use crate::error::{AgentError, Result};
use crate::types::{
    ActionKind, ActionResult, ActionSpec, EXTRACT_MAX_CHARS, PageSnapshot, ScrollDirection,
    Target,
};

/// The page an action runs against: the session's browser handle and the
/// snapshot captured in the current step.
#[derive(Debug, Clone)]
pub struct PageContext {
    pub handle: BrowserHandle,
    pub snapshot: Option<Arc<PageSnapshot>>,
}

impl PageContext {
    pub fn new(handle: BrowserHandle) -> Self {
        Self {
            handle,
            snapshot: None,
        }
    }

    pub fn with_snapshot(handle: BrowserHandle, snapshot: Arc<PageSnapshot>) -> Self {
        Self {
            handle,
            snapshot: Some(snapshot),
        }
    }

    /// Drop the snapshot after the document changed under it.
    pub fn invalidate(&mut self) {
        self.snapshot = None;
    }
}

pub struct ActionDispatcher {
    browser: Arc<dyn Browser>,
}

impl ActionDispatcher {
    pub fn new(browser: Arc<dyn Browser>) -> Self {
        Self { browser }
    }

    /// Run one action. Every failure is reported in the returned result.
    pub async fn execute(&self, page: &mut PageContext, action: &ActionSpec) -> ActionResult {
        let kind = action.kind();
        match self.try_execute(page, action).await {
            Ok(data) => {
                debug!(action = %kind, "{} ok", action.describe());
                ActionResult::ok(kind, data)
            }
            Err(e) => {
                let message = match e {
                    AgentError::DispatchFailure { message, .. } => message,
                    other => other.to_string(),
                };
                warn!(action = %kind, error = %message, "{} failed", action.describe());
                ActionResult::failed(kind, message)
            }
        }
    }

    async fn try_execute(&self, page: &mut PageContext, action: &ActionSpec) -> Result<Option<Value>> {
        let kind = action.kind();
        let handle = page.handle.clone();
        match action {
            ActionSpec::Click { target } => {
                let selector = resolve(page, target, kind)?;
                self.browser.click(&handle, &selector).await?;
                Ok(None)
            }
            ActionSpec::Input { target, text } => {
                let selector = resolve(page, target, kind)?;
                self.browser.fill(&handle, &selector, text).await?;
                Ok(None)
            }
            ActionSpec::Navigate { url } => {
                let url = url.trim();
                if let Err(e) = Url::parse(url) {
                    return Err(failure(kind, format!("invalid url '{}': {}", url, e)));
                }
                self.browser.navigate(&handle, url).await?;
                page.invalidate();
                let landed = self
                    .browser
                    .evaluate(&handle, LOCATION_JS)
                    .await
                    .ok()
                    .and_then(|v| v.as_str().map(String::from))
                    .unwrap_or_else(|| url.to_string());
                Ok(Some(Value::String(landed)))
            }
            ActionSpec::Scroll { direction, amount } => {
                self.browser
                    .evaluate(&handle, &scroll_script(*direction, *amount))
                    .await?;
                Ok(None)
            }
            ActionSpec::Extract { selector } => {
                if selector.trim().is_empty() {
                    return Err(failure(kind, "selector is empty"));
                }
                let value = self
                    .browser
                    .evaluate(&handle, &extract_text_script(selector))
                    .await?;
                let data = match value {
                    Value::Null => Value::Null,
                    Value::String(text) => {
                        Value::String(text.chars().take(EXTRACT_MAX_CHARS).collect())
                    }
                    other => {
                        return Err(failure(kind, format!("unexpected extract result: {}", other)));
                    }
                };
                Ok(Some(data))
            }
            ActionSpec::Done { text, success } => Ok(Some(json!({
                "success": success,
                "text": text,
            }))),
        }
    }
}

fn failure(action: ActionKind, message: impl Into<String>) -> AgentError {
    AgentError::DispatchFailure {
        action,
        message: message.into(),
    }
}

/// Turn a target into a CSS selector. Indices go through the current snapshot.
fn resolve(page: &PageContext, target: &Target, kind: ActionKind) -> Result<String> {
    match target {
        Target::Selector(s) if s.trim().is_empty() => Err(failure(kind, "selector is empty")),
        Target::Selector(s) => Ok(s.clone()),
        Target::Index(index) => {
            let snapshot = page.snapshot.as_ref().ok_or_else(|| {
                AgentError::StaleContext(format!(
                    "element [{}] belongs to a page that has since been navigated away from",
                    index
                ))
            })?;
            Ok(snapshot.element_ref(*index)?.locator())
        }
    }
}

/// `scrollBy` for the direction. Without an amount, scroll 80% of the viewport.
pub fn scroll_script(direction: ScrollDirection, amount: Option<i64>) -> String {
    let (dx, dy) = match (direction, amount) {
        (ScrollDirection::Up | ScrollDirection::Down, None) => {
            ("0".to_string(), "Math.round(window.innerHeight * 0.8)".to_string())
        }
        (ScrollDirection::Left | ScrollDirection::Right, None) => {
            ("Math.round(window.innerWidth * 0.8)".to_string(), "0".to_string())
        }
        (ScrollDirection::Up | ScrollDirection::Down, Some(a)) => ("0".to_string(), a.to_string()),
        (ScrollDirection::Left | ScrollDirection::Right, Some(a)) => (a.to_string(), "0".to_string()),
    };
    let (dx, dy) = match direction {
        ScrollDirection::Up => (dx, format!("-({})", dy)),
        ScrollDirection::Left => (format!("-({})", dx), dy),
        ScrollDirection::Down | ScrollDirection::Right => (dx, dy),
    };
    format!("/* pilot:scroll */ window.scrollBy({}, {})", dx, dy)
}
