use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{AgentError, Result};

/// Upper bound on text returned by a single `Extract` action.
pub const EXTRACT_MAX_CHARS: usize = 2000;
/// Visible text kept per element descriptor.
pub const ELEMENT_TEXT_MAX_CHARS: usize = 100;

/// Attribute stamped on `<html>` with the id of the snapshot that indexed the page.
pub const SNAPSHOT_MARKER_ATTR: &str = "data-pilot-snapshot";
/// Attribute stamped on every candidate node with its ordinal.
pub const NODE_ATTR: &str = "data-pilot-node";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SnapshotId(pub u64);

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl BoundingBox {
    pub fn is_empty(&self) -> bool {
        self.width <= 0.0 || self.height <= 0.0
    }
}

/// One indexed element of a [`PageSnapshot`].
///
/// `index` is positional and only meaningful within the snapshot that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementDescriptor {
    pub index: usize,
    pub tag: String,
    pub text: String,
    pub bounding_box: BoundingBox,
    pub selector_hint: String,
    pub is_interactive: bool,
    pub is_visible: bool,
    /// Ordinal of the node among the page's candidate nodes.
    pub node: usize,
}

impl ElementDescriptor {
    /// Compact one-line form sent to the model, e.g. `[3] button "Search"`.
    pub fn summary_line(&self) -> String {
        if self.text.is_empty() {
            format!("[{}] {} ({})", self.index, self.tag, self.selector_hint)
        } else {
            format!("[{}] {} \"{}\"", self.index, self.tag, self.text)
        }
    }
}

/// A point-in-time capture of a page's interactive element set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageSnapshot {
    pub id: SnapshotId,
    pub url: String,
    pub title: String,
    pub captured_at: DateTime<Utc>,
    pub elements: Vec<ElementDescriptor>,
}

impl PageSnapshot {
    /// Bind `index` to this snapshot.
    pub fn element_ref(&self, index: usize) -> Result<ElementRef> {
        let element = self
            .elements
            .get(index)
            .ok_or(AgentError::IndexOutOfRange {
                index,
                len: self.elements.len(),
            })?;
        Ok(ElementRef {
            snapshot: self.id,
            index,
            node: element.node,
        })
    }
}

/// An element index tied to the snapshot it was derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElementRef {
    pub snapshot: SnapshotId,
    pub index: usize,
    pub node: usize,
}

impl ElementRef {
    /// CSS locator that only matches while the document still carries this
    /// snapshot's marker. Re-captures and navigations make it match nothing.
    pub fn locator(&self) -> String {
        format!(
            "html[{}=\"{}\"] [{}=\"{}\"]",
            SNAPSHOT_MARKER_ATTR, self.snapshot, NODE_ATTR, self.node
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    State,
    User,
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::System => "system",
            Role::State => "state",
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        f.write_str(name)
    }
}

/// A message in the conversation sent to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl ConversationTurn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            created_at: Utc::now(),
        }
    }
}

/// How an action addresses an element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Target {
    Index(usize),
    Selector(String),
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Index(i) => write!(f, "[{}]", i),
            Target::Selector(s) => write!(f, "{}", s),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScrollDirection {
    Up,
    #[default]
    Down,
    Left,
    Right,
}

impl FromStr for ScrollDirection {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "up" => Ok(Self::Up),
            "down" => Ok(Self::Down),
            "left" => Ok(Self::Left),
            "right" => Ok(Self::Right),
            other => Err(format!("unknown scroll direction '{}'", other)),
        }
    }
}

/// A single action the model asks the agent to perform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionSpec {
    Click {
        target: Target,
    },
    Input {
        target: Target,
        text: String,
    },
    Navigate {
        url: String,
    },
    Scroll {
        direction: ScrollDirection,
        amount: Option<i64>,
    },
    Extract {
        selector: String,
    },
    Done {
        text: String,
        success: bool,
    },
}

impl ActionSpec {
    pub fn kind(&self) -> ActionKind {
        match self {
            ActionSpec::Click { .. } => ActionKind::Click,
            ActionSpec::Input { .. } => ActionKind::Input,
            ActionSpec::Navigate { .. } => ActionKind::Navigate,
            ActionSpec::Scroll { .. } => ActionKind::Scroll,
            ActionSpec::Extract { .. } => ActionKind::Extract,
            ActionSpec::Done { .. } => ActionKind::Done,
        }
    }

    /// Short human-readable form for logs and events.
    pub fn describe(&self) -> String {
        match self {
            ActionSpec::Click { target } => format!("click {}", target),
            ActionSpec::Input { target, text } => format!("input {} {:?}", target, text),
            ActionSpec::Navigate { url } => format!("navigate {}", url),
            ActionSpec::Scroll { direction, amount } => match amount {
                Some(a) => format!("scroll {:?} {}", direction, a),
                None => format!("scroll {:?}", direction),
            },
            ActionSpec::Extract { selector } => format!("extract {}", selector),
            ActionSpec::Done { success, .. } => format!("done (success={})", success),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Click,
    Input,
    Navigate,
    Scroll,
    Extract,
    Done,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ActionKind::Click => "click",
            ActionKind::Input => "input",
            ActionKind::Navigate => "navigate",
            ActionKind::Scroll => "scroll",
            ActionKind::Extract => "extract",
            ActionKind::Done => "done",
        };
        f.write_str(name)
    }
}

impl FromStr for ActionKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "click" => Ok(Self::Click),
            "input" => Ok(Self::Input),
            "navigate" => Ok(Self::Navigate),
            "scroll" => Ok(Self::Scroll),
            "extract" => Ok(Self::Extract),
            "done" => Ok(Self::Done),
            other => Err(format!("unknown action kind '{}'", other)),
        }
    }
}

/// Outcome of dispatching one action. Always produced, even on failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub success: bool,
    pub action: ActionKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ActionResult {
    pub fn ok(action: ActionKind, data: Option<Value>) -> Self {
        Self {
            success: true,
            action,
            data,
            error: None,
        }
    }

    pub fn failed(action: ActionKind, error: impl Into<String>) -> Self {
        Self {
            success: false,
            action,
            data: None,
            error: Some(error.into()),
        }
    }
}

/// Audit entry for one dispatched action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    /// Loop iteration that produced the action (1-based).
    pub step: usize,
    pub action: ActionSpec,
    pub result: ActionResult,
    pub timestamp: DateTime<Utc>,
}

/// Trim whitespace, collapse inner runs and cut to `max` characters.
pub fn compact_text(raw: &str, max: usize) -> String {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() > max {
        collapsed.chars().take(max).collect()
    } else {
        collapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> PageSnapshot {
        PageSnapshot {
            id: SnapshotId(7),
            url: "https://example.com".into(),
            title: "Example".into(),
            captured_at: Utc::now(),
            elements: vec![ElementDescriptor {
                index: 0,
                tag: "button".into(),
                text: "Go".into(),
                bounding_box: BoundingBox {
                    x: 0.0,
                    y: 0.0,
                    width: 10.0,
                    height: 10.0,
                },
                selector_hint: "#go".into(),
                is_interactive: true,
                is_visible: true,
                node: 4,
            }],
        }
    }

    #[test]
    fn test_element_ref_locator_is_bound_to_snapshot() {
        let r = snapshot().element_ref(0).unwrap();
        assert_eq!(r.snapshot, SnapshotId(7));
        assert_eq!(
            r.locator(),
            "html[data-pilot-snapshot=\"7\"] [data-pilot-node=\"4\"]"
        );
    }

    #[test]
    fn test_element_ref_out_of_range() {
        let err = snapshot().element_ref(3).unwrap_err();
        assert_eq!(err, AgentError::IndexOutOfRange { index: 3, len: 1 });
    }

    #[test]
    fn test_action_spec_serializes_tagged() {
        let action = ActionSpec::Navigate {
            url: "https://x".into(),
        };
        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["type"], "navigate");
        assert_eq!(json["url"], "https://x");
    }

    #[test]
    fn test_compact_text() {
        assert_eq!(compact_text("  Sign \n  in  ", 100), "Sign in");
        assert_eq!(compact_text("abcdef", 3), "abc");
    }

    #[test]
    fn test_action_kind_from_str() {
        assert_eq!("Navigate".parse::<ActionKind>().unwrap(), ActionKind::Navigate);
        assert!("hover".parse::<ActionKind>().is_err());
    }
}
