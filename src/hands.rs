//! Headless Chrome implementation of [`Browser`].
//!
//! headless_chrome is a blocking CDP client, so every call runs on the
//! blocking thread pool. Each session gets its own tab in one shared Chrome.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use headless_chrome::protocol::cdp::Page::CaptureScreenshotFormatOption;
use headless_chrome::{Browser as Chrome, LaunchOptions, Tab};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::browser::{Browser, BrowserHandle, BrowserResult, js_string};
use crate::config::BrowserConfig;
use crate::error::BrowserError;

/// Pause after a click so the page can react before the next capture.
const CLICK_SETTLE: Duration = Duration::from_millis(500);

pub struct ChromeBrowser {
    chrome: Arc<Chrome>,
    tabs: Mutex<HashMap<BrowserHandle, Arc<Tab>>>,
}

impl ChromeBrowser {
    /// Attach to a running Chrome when a debug URL is configured, otherwise
    /// launch one. Blocking; call from `spawn_blocking`.
    pub fn launch(config: &BrowserConfig) -> BrowserResult<Self> {
        if let Some(url) = &config.debug_url {
            info!("attaching to existing Chrome at {}", url);
            match Chrome::connect(url.clone()) {
                Ok(chrome) => {
                    info!("attached to existing Chrome");
                    return Ok(Self::from_chrome(chrome));
                }
                Err(e) => warn!("could not attach to {}: {}; launching instead", url, e),
            }
        }

        if let Some(dir) = &config.user_data_dir {
            std::fs::create_dir_all(dir)
                .map_err(|e| BrowserError::Io(format!("{}: {}", dir.display(), e)))?;
            debug!("using profile at {}", dir.display());
        }

        let options = LaunchOptions {
            headless: config.headless,
            path: config.chrome_path.clone(),
            user_data_dir: config.user_data_dir.clone(),
            window_size: Some((config.window_width, config.window_height)),
            args: vec![
                OsStr::new("--no-first-run"),
                OsStr::new("--no-default-browser-check"),
                OsStr::new("--disable-blink-features=AutomationControlled"),
                OsStr::new("--disable-infobars"),
                OsStr::new("--password-store=basic"),
            ],
            idle_browser_timeout: config.idle_browser_timeout,
            ..Default::default()
        };

        info!(headless = config.headless, "starting Chrome");
        let chrome = Chrome::new(options).map_err(|e| BrowserError::Launch(e.to_string()))?;
        info!("Chrome ready");
        Ok(Self::from_chrome(chrome))
    }

    fn from_chrome(chrome: Chrome) -> Self {
        Self {
            chrome: Arc::new(chrome),
            tabs: Mutex::new(HashMap::new()),
        }
    }

    fn tab(&self, handle: &BrowserHandle) -> BrowserResult<Arc<Tab>> {
        self.tabs
            .lock()
            .get(handle)
            .cloned()
            .ok_or_else(|| BrowserError::SessionClosed(handle.to_string()))
    }

    async fn with_tab<T, F>(&self, handle: &BrowserHandle, op: F) -> BrowserResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Tab) -> BrowserResult<T> + Send + 'static,
    {
        let tab = self.tab(handle)?;
        tokio::task::spawn_blocking(move || op(&tab))
            .await
            .map_err(|e| BrowserError::Io(format!("browser task panicked: {}", e)))?
    }
}

#[async_trait]
impl Browser for ChromeBrowser {
    async fn new_session(&self) -> BrowserResult<BrowserHandle> {
        let chrome = self.chrome.clone();
        let tab = tokio::task::spawn_blocking(move || {
            let tab = chrome
                .new_tab()
                .map_err(|e| BrowserError::Launch(format!("new tab: {}", e)))?;
            tab.navigate_to("about:blank")
                .map_err(|e| BrowserError::Navigation(e.to_string()))?;
            Ok::<_, BrowserError>(tab)
        })
        .await
        .map_err(|e| BrowserError::Io(format!("browser task panicked: {}", e)))??;

        let handle = BrowserHandle(format!("tab-{}", Uuid::new_v4().simple()));
        self.tabs.lock().insert(handle.clone(), tab);
        debug!(%handle, "opened tab");
        Ok(handle)
    }

    async fn navigate(&self, handle: &BrowserHandle, url: &str) -> BrowserResult<()> {
        let url = url.to_string();
        self.with_tab(handle, move |tab| {
            tab.navigate_to(&url)
                .and_then(|t| t.wait_until_navigated())
                .map_err(|e| BrowserError::Navigation(format!("{}: {}", url, e)))?;
            Ok(())
        })
        .await
    }

    async fn click(&self, handle: &BrowserHandle, selector: &str) -> BrowserResult<()> {
        let selector = selector.to_string();
        self.with_tab(handle, move |tab| {
            let element = tab
                .find_element(&selector)
                .map_err(|e| BrowserError::ElementNotFound(format!("{}: {}", selector, e)))?;
            element
                .click()
                .map_err(|e| BrowserError::Script(format!("click {}: {}", selector, e)))?;
            std::thread::sleep(CLICK_SETTLE);
            Ok(())
        })
        .await
    }

    async fn fill(&self, handle: &BrowserHandle, selector: &str, text: &str) -> BrowserResult<()> {
        let selector = selector.to_string();
        let text = text.to_string();
        self.with_tab(handle, move |tab| {
            let element = tab
                .find_element(&selector)
                .map_err(|e| BrowserError::ElementNotFound(format!("{}: {}", selector, e)))?;
            element
                .click()
                .map_err(|e| BrowserError::Script(format!("focus {}: {}", selector, e)))?;
            let clear = format!(
                "(() => {{ const el = document.querySelector({}); \
                 if (el) {{ el.focus(); el.value = ''; \
                 el.dispatchEvent(new Event('input', {{ bubbles: true }})); }} }})()",
                js_string(&selector)
            );
            tab.evaluate(&clear, false)
                .map_err(|e| BrowserError::Script(e.to_string()))?;
            if !text.is_empty() {
                tab.type_str(&text)
                    .map_err(|e| BrowserError::Script(format!("type into {}: {}", selector, e)))?;
            }
            Ok(())
        })
        .await
    }

    async fn evaluate(&self, handle: &BrowserHandle, script: &str) -> BrowserResult<Value> {
        // Serialize in the page so objects come back by value.
        let wrapped = format!("JSON.stringify((\n{}\n) ?? null)", script);
        self.with_tab(handle, move |tab| {
            let result = tab
                .evaluate(&wrapped, false)
                .map_err(|e| BrowserError::Script(e.to_string()))?;
            match result.value {
                Some(Value::String(json)) => serde_json::from_str(&json)
                    .map_err(|e| BrowserError::Script(format!("unreadable result: {}", e))),
                _ => Ok(Value::Null),
            }
        })
        .await
    }

    async fn screenshot(&self, handle: &BrowserHandle) -> BrowserResult<Vec<u8>> {
        self.with_tab(handle, |tab| {
            tab.capture_screenshot(CaptureScreenshotFormatOption::Png, None, None, true)
                .map_err(|e| BrowserError::Script(format!("screenshot: {}", e)))
        })
        .await
    }

    async fn close(&self, handle: &BrowserHandle) -> BrowserResult<()> {
        let Some(tab) = self.tabs.lock().remove(handle) else {
            return Ok(());
        };
        let handle = handle.clone();
        tokio::task::spawn_blocking(move || {
            if let Err(e) = tab.close(true) {
                warn!(%handle, "closing tab failed: {}", e);
            } else {
                debug!(%handle, "closed tab");
            }
        })
        .await
        .map_err(|e| BrowserError::Io(format!("browser task panicked: {}", e)))
    }
}
