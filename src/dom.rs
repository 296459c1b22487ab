//! Element indexing over the live DOM.
//!
//! A capture is a single script evaluation. The script walks the document in
//! pre-order, stamps the snapshot marker on `<html>` and an ordinal on every
//! candidate node, and reports raw facts about each candidate. The
//! interactivity and visibility predicates are applied here, on the Rust side,
//! so indexing is deterministic for a fixed set of node facts.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::browser::{Browser, BrowserHandle, js_string};
use crate::error::{AgentError, BrowserError, Result};
use crate::types::{
    BoundingBox, ELEMENT_TEXT_MAX_CHARS, ElementDescriptor, PageSnapshot, SnapshotId,
    compact_text,
};

pub const INTERACTIVE_TAGS: [&str; 5] = ["a", "button", "input", "select", "textarea"];
pub const INTERACTIVE_ROLES: [&str; 4] = ["button", "link", "menuitem", "tab"];

/// Reads the DOM without changing layout. Besides the two data attributes it
/// leaves the page untouched.
const CAPTURE_JS: &str = r#"
/* pilot:capture */
(() => {
  if (!document.body) return null;
  const TAGS = new Set(['A', 'BUTTON', 'INPUT', 'SELECT', 'TEXTAREA']);
  for (const el of document.querySelectorAll('[data-pilot-node]')) {
    el.removeAttribute('data-pilot-node');
  }
  document.documentElement.setAttribute('data-pilot-snapshot', '__SNAPSHOT_ID__');
  const nodes = [];
  let ordinal = 0;
  for (const el of document.body.querySelectorAll('*')) {
    if (!(TAGS.has(el.tagName) || el.hasAttribute('onclick') || el.hasAttribute('role'))) continue;
    el.setAttribute('data-pilot-node', String(ordinal));
    const rect = el.getBoundingClientRect();
    const style = getComputedStyle(el);
    const text = el.innerText || el.value || el.placeholder || el.getAttribute('aria-label') || '';
    nodes.push({
      ordinal: ordinal++,
      tag: el.tagName.toLowerCase(),
      text: String(text).slice(0, 300),
      role: el.getAttribute('role'),
      onclick: el.hasAttribute('onclick'),
      id: el.id || null,
      classes: typeof el.className === 'string' ? el.className : '',
      rect: { x: rect.x, y: rect.y, width: rect.width, height: rect.height },
      display: style.display,
      visibility: style.visibility,
      opacity: style.opacity,
    });
  }
  return { url: location.href, title: document.title, nodes };
})()
"#;

const HIGHLIGHT_JS: &str = r#"
/* pilot:highlight */
(() => {
  let drawn = 0;
  for (const [index, locator] of __TARGETS__) {
    const el = document.querySelector(locator);
    if (!el) continue;
    const rect = el.getBoundingClientRect();
    const box = document.createElement('div');
    box.className = 'pilot-highlight';
    box.setAttribute('data-highlight-index', String(index));
    box.style.cssText = 'position:fixed;border:2px solid #e5484d;background:rgba(229,72,77,0.08);'
      + 'z-index:2147483647;pointer-events:none;'
      + 'top:' + rect.top + 'px;left:' + rect.left + 'px;'
      + 'width:' + rect.width + 'px;height:' + rect.height + 'px;';
    const label = document.createElement('span');
    label.textContent = String(index);
    label.style.cssText = 'position:absolute;top:-16px;left:0;font:11px monospace;'
      + 'background:#e5484d;color:#fff;padding:0 3px;';
    box.appendChild(label);
    document.body.appendChild(box);
    drawn++;
  }
  return drawn;
})()
"#;

const CLEAR_HIGHLIGHTS_JS: &str = r#"
/* pilot:clear-highlights */
(() => {
  const boxes = document.querySelectorAll('.pilot-highlight');
  boxes.forEach(b => b.remove());
  return boxes.length;
})()
"#;

pub const LOCATION_JS: &str = "/* pilot:location */ window.location.href";

/// Facts the capture script reports for each candidate node.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawNode {
    pub ordinal: usize,
    pub tag: String,
    pub text: String,
    pub role: Option<String>,
    pub onclick: bool,
    pub id: Option<String>,
    pub classes: String,
    pub rect: BoundingBox,
    pub display: String,
    pub visibility: String,
    pub opacity: String,
}

impl RawNode {
    pub fn is_interactive(&self) -> bool {
        let tag = self.tag.to_ascii_lowercase();
        INTERACTIVE_TAGS.contains(&tag.as_str())
            || self.onclick
            || self
                .role
                .as_deref()
                .map(|r| INTERACTIVE_ROLES.contains(&r.trim().to_ascii_lowercase().as_str()))
                .unwrap_or(false)
    }

    pub fn is_visible(&self) -> bool {
        let transparent = self
            .opacity
            .trim()
            .parse::<f64>()
            .map(|o| o <= 0.0)
            .unwrap_or(false);
        !self.rect.is_empty()
            && self.display != "none"
            && self.visibility != "hidden"
            && !transparent
    }

    /// `#id`, else `tag.class1.class2`, else the bare tag.
    pub fn selector_hint(&self) -> String {
        let tag = self.tag.to_ascii_lowercase();
        if let Some(id) = self.id.as_deref().filter(|id| !id.is_empty()) {
            return format!("#{}", id);
        }
        let classes: Vec<&str> = self.classes.split_whitespace().collect();
        if classes.is_empty() {
            tag
        } else {
            format!("{}.{}", tag, classes.join("."))
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawCapture {
    #[serde(default)]
    url: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    nodes: Vec<RawNode>,
}

/// Keep the interactive, visible nodes and number them in document order.
pub fn index_nodes(nodes: &[RawNode]) -> Vec<ElementDescriptor> {
    nodes
        .iter()
        .filter(|n| n.is_interactive() && n.is_visible())
        .enumerate()
        .map(|(index, n)| ElementDescriptor {
            index,
            tag: n.tag.to_ascii_lowercase(),
            text: compact_text(&n.text, ELEMENT_TEXT_MAX_CHARS),
            bounding_box: n.rect,
            selector_hint: n.selector_hint(),
            is_interactive: true,
            is_visible: true,
            node: n.ordinal,
        })
        .collect()
}

pub struct ElementIndexer {
    browser: Arc<dyn Browser>,
    next_snapshot: AtomicU64,
}

impl ElementIndexer {
    pub fn new(browser: Arc<dyn Browser>) -> Self {
        Self {
            browser,
            next_snapshot: AtomicU64::new(1),
        }
    }

    /// Capture the current page. Fails with [`AgentError::StaleContext`] when the
    /// page is not available; the caller should capture again.
    pub async fn capture(&self, handle: &BrowserHandle) -> Result<PageSnapshot> {
        let id = SnapshotId(self.next_snapshot.fetch_add(1, Ordering::Relaxed));
        let script = CAPTURE_JS.replace("__SNAPSHOT_ID__", &id.to_string());

        let value = self
            .browser
            .evaluate(handle, &script)
            .await
            .map_err(|e| AgentError::StaleContext(e.to_string()))?;
        if value.is_null() {
            return Err(AgentError::StaleContext(
                "document has no body (page is loading or gone)".into(),
            ));
        }

        let raw: RawCapture = serde_json::from_value(value).map_err(|e| {
            AgentError::Browser(BrowserError::Script(format!(
                "unexpected capture payload: {}",
                e
            )))
        })?;
        let elements = index_nodes(&raw.nodes);
        debug!(
            snapshot = %id,
            candidates = raw.nodes.len(),
            indexed = elements.len(),
            url = %raw.url,
            "captured page"
        );

        Ok(PageSnapshot {
            id,
            url: raw.url,
            title: raw.title,
            captured_at: Utc::now(),
            elements,
        })
    }

    /// Draw an overlay box over one element at its current position.
    pub async fn highlight(
        &self,
        handle: &BrowserHandle,
        snapshot: &PageSnapshot,
        index: usize,
    ) -> Result<()> {
        let element = snapshot.element_ref(index)?;
        let targets = json!([[index, element.locator()]]);
        let drawn = self.draw(handle, &targets).await?;
        if drawn == 0 {
            return Err(AgentError::StaleContext(format!(
                "element [{}] of snapshot {} is no longer on the page",
                index, snapshot.id
            )));
        }
        Ok(())
    }

    /// Overlay every indexed element. Returns how many boxes were drawn.
    pub async fn highlight_all(
        &self,
        handle: &BrowserHandle,
        snapshot: &PageSnapshot,
    ) -> Result<usize> {
        let mut targets = Vec::with_capacity(snapshot.elements.len());
        for element in &snapshot.elements {
            let r = snapshot.element_ref(element.index)?;
            targets.push(json!([element.index, r.locator()]));
        }
        self.draw(handle, &serde_json::Value::Array(targets)).await
    }

    pub async fn clear_highlights(&self, handle: &BrowserHandle) -> Result<()> {
        self.browser.evaluate(handle, CLEAR_HIGHLIGHTS_JS).await?;
        Ok(())
    }

    async fn draw(&self, handle: &BrowserHandle, targets: &serde_json::Value) -> Result<usize> {
        // The targets array is valid JSON, hence a valid JS array literal.
        let script = HIGHLIGHT_JS.replace("__TARGETS__", &targets.to_string());
        let drawn = self.browser.evaluate(handle, &script).await?;
        Ok(drawn.as_u64().unwrap_or(0) as usize)
    }
}

/// Script reading the text of every element matching `selector`, or `null`
/// when nothing matches.
pub fn extract_text_script(selector: &str) -> String {
    format!(
        "/* pilot:extract */ (() => {{ const els = Array.from(document.querySelectorAll({})); \
         if (els.length === 0) return null; \
         return els.map(e => (e.innerText || e.textContent || '').trim()).join('\\n'); }})()",
        js_string(selector)
    )
}
