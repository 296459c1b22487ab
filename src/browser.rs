//! The primitive browser operations the agent core is built on.
//!
//! The core never launches or configures a browser process itself; it only
//! talks to an implementation of [`Browser`]. [`crate::hands::ChromeBrowser`]
//! is the production implementation.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::BrowserError;

pub type BrowserResult<T> = std::result::Result<T, BrowserError>;

/// Opaque handle to one browser session (a tab, in the Chrome implementation).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BrowserHandle(pub String);

impl fmt::Display for BrowserHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[async_trait]
pub trait Browser: Send + Sync {
    async fn new_session(&self) -> BrowserResult<BrowserHandle>;

    async fn navigate(&self, handle: &BrowserHandle, url: &str) -> BrowserResult<()>;

    /// Click the first element matching the CSS `selector`.
    async fn click(&self, handle: &BrowserHandle, selector: &str) -> BrowserResult<()>;

    /// Focus and clear the element matching `selector`, then type `text` into it.
    async fn fill(&self, handle: &BrowserHandle, selector: &str, text: &str) -> BrowserResult<()>;

    /// Evaluate a script expression and return its JSON value (`Null` for undefined).
    async fn evaluate(&self, handle: &BrowserHandle, script: &str) -> BrowserResult<Value>;

    /// PNG screenshot of the current viewport.
    async fn screenshot(&self, handle: &BrowserHandle) -> BrowserResult<Vec<u8>>;

    async fn close(&self, handle: &BrowserHandle) -> BrowserResult<()>;
}

/// Quote `s` as a JavaScript string literal.
pub fn js_string(s: &str) -> String {
    // JSON string syntax is a subset of JS string literal syntax.
    serde_json::Value::String(s.to_string()).to_string()
}
