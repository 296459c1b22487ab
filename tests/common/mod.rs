#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::Notify;

use webpilot::agent::AgentRunLoop;
use webpilot::brain::Model;
use webpilot::browser::{Browser, BrowserHandle, BrowserResult};
use webpilot::config::{AgentConfig, RegistryConfig};
use webpilot::error::{AgentError, BrowserError, Result};
use webpilot::registry::SessionRegistry;
use webpilot::types::ConversationTurn;

/// A visible element with a 100x20 box.
pub fn element(tag: &str, text: &str) -> Value {
    json!({
        "tag": tag,
        "text": text,
        "role": null,
        "onclick": false,
        "id": null,
        "classes": "",
        "rect": {"x": 0.0, "y": 0.0, "width": 100.0, "height": 20.0},
        "display": "block",
        "visibility": "visible",
        "opacity": "1",
    })
}

pub fn hidden(tag: &str, text: &str) -> Value {
    let mut node = element(tag, text);
    node["display"] = json!("none");
    node
}

#[derive(Default)]
struct Page {
    url: String,
    title: String,
    /// Every node ever on the page; position is its identity.
    nodes: Vec<Value>,
    removed: HashSet<usize>,
    /// Snapshot marker currently stamped on the document.
    marker: Option<String>,
    /// Node ordinal stamped by the last capture -> node identity.
    stamped: Vec<usize>,
}

#[derive(Default)]
struct Inner {
    next_handle: usize,
    pages: HashMap<BrowserHandle, Page>,
    sites: HashMap<String, (String, Vec<Value>)>,
    home: Vec<Value>,
    stale_captures: usize,
    extract_text: Option<String>,
    calls: Vec<String>,
    closed: Vec<BrowserHandle>,
}

/// In-memory browser that understands the agent's page scripts by their
/// marker comments.
#[derive(Default)]
pub struct FakeBrowser {
    inner: Mutex<Inner>,
}

impl FakeBrowser {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Nodes of the blank page every new session starts on.
    pub fn set_home(&self, nodes: Vec<Value>) {
        self.inner.lock().home = nodes;
    }

    pub fn add_site(&self, url: &str, title: &str, nodes: Vec<Value>) {
        self.inner
            .lock()
            .sites
            .insert(url.to_string(), (title.to_string(), nodes));
    }

    pub fn remove_node(&self, handle: &BrowserHandle, node: usize) {
        if let Some(page) = self.inner.lock().pages.get_mut(handle) {
            page.removed.insert(node);
        }
    }

    /// Make the next `n` captures fail as if the page were mid-navigation.
    pub fn fail_next_captures(&self, n: usize) {
        self.inner.lock().stale_captures = n;
    }

    pub fn set_extract_text(&self, text: Option<&str>) {
        self.inner.lock().extract_text = text.map(String::from);
    }

    pub fn calls(&self) -> Vec<String> {
        self.inner.lock().calls.clone()
    }

    pub fn count_calls(&self, prefix: &str) -> usize {
        self.inner
            .lock()
            .calls
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    pub fn closed(&self) -> Vec<BrowserHandle> {
        self.inner.lock().closed.clone()
    }

    pub fn open_sessions(&self) -> usize {
        self.inner.lock().pages.len()
    }

    pub fn handles(&self) -> Vec<BrowserHandle> {
        self.inner.lock().pages.keys().cloned().collect()
    }
}

fn between<'a>(s: &'a str, start: &str, end: &str) -> Option<&'a str> {
    let from = s.find(start)? + start.len();
    let rest = &s[from..];
    let to = rest.find(end)?;
    Some(&rest[..to])
}

fn target(page: &Page, selector: &str) -> BrowserResult<()> {
    let missing = || BrowserError::ElementNotFound(selector.to_string());
    if selector.starts_with("#missing") {
        return Err(missing());
    }
    let (Some(snapshot), Some(ordinal)) = (
        between(selector, "data-pilot-snapshot=\"", "\""),
        between(selector, "data-pilot-node=\"", "\""),
    ) else {
        return Ok(());
    };
    if page.marker.as_deref() != Some(snapshot) {
        return Err(missing());
    }
    let node = ordinal
        .parse::<usize>()
        .ok()
        .and_then(|o| page.stamped.get(o).copied())
        .ok_or_else(missing)?;
    if page.removed.contains(&node) {
        return Err(missing());
    }
    Ok(())
}

#[async_trait]
impl Browser for FakeBrowser {
    async fn new_session(&self) -> BrowserResult<BrowserHandle> {
        let mut inner = self.inner.lock();
        inner.next_handle += 1;
        let handle = BrowserHandle(format!("fake-{}", inner.next_handle));
        let page = Page {
            url: "about:blank".into(),
            nodes: inner.home.clone(),
            ..Default::default()
        };
        inner.pages.insert(handle.clone(), page);
        inner.calls.push(format!("new_session {}", handle));
        Ok(handle)
    }

    async fn navigate(&self, handle: &BrowserHandle, url: &str) -> BrowserResult<()> {
        let mut inner = self.inner.lock();
        inner.calls.push(format!("navigate {}", url));
        if url.contains("unreachable") {
            return Err(BrowserError::Navigation(format!("{}: net::ERR_NAME_NOT_RESOLVED", url)));
        }
        let (title, nodes) = inner.sites.get(url).cloned().unwrap_or_default();
        let page = inner
            .pages
            .get_mut(handle)
            .ok_or_else(|| BrowserError::SessionClosed(handle.to_string()))?;
        *page = Page {
            url: url.to_string(),
            title,
            nodes,
            ..Default::default()
        };
        Ok(())
    }

    async fn click(&self, handle: &BrowserHandle, selector: &str) -> BrowserResult<()> {
        let mut inner = self.inner.lock();
        inner.calls.push(format!("click {}", selector));
        let page = inner
            .pages
            .get(handle)
            .ok_or_else(|| BrowserError::SessionClosed(handle.to_string()))?;
        target(page, selector)
    }

    async fn fill(&self, handle: &BrowserHandle, selector: &str, text: &str) -> BrowserResult<()> {
        let mut inner = self.inner.lock();
        inner.calls.push(format!("fill {} {}", selector, text));
        let page = inner
            .pages
            .get(handle)
            .ok_or_else(|| BrowserError::SessionClosed(handle.to_string()))?;
        target(page, selector)
    }

    async fn evaluate(&self, handle: &BrowserHandle, script: &str) -> BrowserResult<Value> {
        let mut inner = self.inner.lock();
        let Inner {
            pages,
            calls,
            stale_captures,
            extract_text,
            ..
        } = &mut *inner;
        let page = pages
            .get_mut(handle)
            .ok_or_else(|| BrowserError::SessionClosed(handle.to_string()))?;

        if script.contains("pilot:capture") {
            calls.push("capture".into());
            if *stale_captures > 0 {
                *stale_captures -= 1;
                return Err(BrowserError::PageUnavailable("navigation in progress".into()));
            }
            let marker = between(script, "'data-pilot-snapshot', '", "'").map(String::from);
            page.marker = marker;
            page.stamped = (0..page.nodes.len())
                .filter(|i| !page.removed.contains(i))
                .collect();
            let nodes: Vec<Value> = page
                .stamped
                .iter()
                .enumerate()
                .map(|(ordinal, &node)| {
                    let mut raw = page.nodes[node].clone();
                    raw["ordinal"] = json!(ordinal);
                    raw
                })
                .collect();
            return Ok(json!({ "url": page.url, "title": page.title, "nodes": nodes }));
        }
        if script.contains("pilot:location") {
            return Ok(Value::String(page.url.clone()));
        }
        if script.contains("pilot:highlight") {
            calls.push("highlight".into());
            let drawn = match &page.marker {
                Some(marker) => script
                    .matches(&format!("data-pilot-snapshot=\\\"{}\\\"", marker))
                    .count(),
                None => 0,
            };
            return Ok(json!(drawn));
        }
        if script.contains("pilot:clear-highlights") {
            calls.push("clear-highlights".into());
            return Ok(json!(0));
        }
        if script.contains("pilot:extract") {
            calls.push("extract".into());
            return Ok(extract_text.clone().map(Value::String).unwrap_or(Value::Null));
        }
        if script.contains("pilot:scroll") {
            calls.push(format!("scroll {}", script));
            return Ok(Value::Null);
        }
        calls.push(format!("evaluate {}", script));
        Ok(Value::Null)
    }

    async fn screenshot(&self, handle: &BrowserHandle) -> BrowserResult<Vec<u8>> {
        let mut inner = self.inner.lock();
        inner.calls.push("screenshot".into());
        if !inner.pages.contains_key(handle) {
            return Err(BrowserError::SessionClosed(handle.to_string()));
        }
        Ok(b"\x89PNG fake".to_vec())
    }

    async fn close(&self, handle: &BrowserHandle) -> BrowserResult<()> {
        let mut inner = self.inner.lock();
        inner.calls.push(format!("close {}", handle));
        inner.pages.remove(handle);
        inner.closed.push(handle.clone());
        Ok(())
    }
}

/// Model that replays canned replies in order.
pub struct ScriptedModel {
    replies: Mutex<VecDeque<String>>,
    fallback: Option<String>,
    gate: Option<Arc<Notify>>,
    calls: AtomicUsize,
    seen: Mutex<Vec<Vec<ConversationTurn>>>,
}

impl ScriptedModel {
    fn build(replies: &[&str], fallback: Option<&str>, gate: Option<Arc<Notify>>) -> Self {
        Self {
            replies: Mutex::new(replies.iter().map(|r| r.to_string()).collect()),
            fallback: fallback.map(String::from),
            gate,
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Fails with a model error once the replies run out.
    pub fn new(replies: &[&str]) -> Arc<Self> {
        Arc::new(Self::build(replies, None, None))
    }

    pub fn repeating(reply: &str) -> Arc<Self> {
        Arc::new(Self::build(&[], Some(reply), None))
    }

    /// Every call waits for a `notify_one` on the returned handle.
    pub fn gated(replies: &[&str]) -> (Arc<Self>, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        (
            Arc::new(Self::build(replies, None, Some(gate.clone()))),
            gate,
        )
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_turns(&self) -> Vec<ConversationTurn> {
        self.seen.lock().last().cloned().unwrap_or_default()
    }
}

#[async_trait]
impl Model for ScriptedModel {
    async fn complete(&self, turns: &[ConversationTurn]) -> Result<String> {
        self.seen.lock().push(turns.to_vec());
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        let next = self.replies.lock().pop_front();
        next.or_else(|| self.fallback.clone())
            .ok_or_else(|| AgentError::Model("no scripted reply left".into()))
    }
}

pub fn registry_with(
    browser: Arc<FakeBrowser>,
    model: Arc<ScriptedModel>,
    config: AgentConfig,
) -> Arc<SessionRegistry> {
    let agent = Arc::new(AgentRunLoop::new(browser.clone(), model, config));
    Arc::new(SessionRegistry::new(
        browser,
        agent,
        RegistryConfig {
            terminate_grace: Duration::from_secs(1),
            ..Default::default()
        },
    ))
}

pub fn registry(browser: Arc<FakeBrowser>, model: Arc<ScriptedModel>) -> Arc<SessionRegistry> {
    registry_with(browser, model, AgentConfig::default())
}

/// Poll `cond` until it holds, failing the test after two seconds.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
