//! Turning free model text into a validated action plan.

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::error::{AgentError, Result};
use crate::types::{ActionSpec, ScrollDirection, Target};

/// Parse a model reply into an ordered, validated plan.
///
/// The JSON payload may be wrapped in prose or markdown fences. Accepted
/// shapes are a single action object, an array of actions, or an object with
/// an `actions` array.
pub fn parse(raw: &str) -> Result<Vec<ActionSpec>> {
    let payload = extract_payload(raw).ok_or_else(|| AgentError::MalformedPlan {
        raw: raw.to_string(),
    })?;

    let items = match payload {
        Value::Array(items) => items,
        Value::Object(mut map) => match take_envelope(&mut map) {
            Some(items) => items,
            None => vec![Value::Object(map)],
        },
        _ => {
            return Err(AgentError::MalformedPlan {
                raw: raw.to_string(),
            });
        }
    };
    if items.is_empty() {
        return Err(AgentError::MalformedPlan {
            raw: raw.to_string(),
        });
    }

    items.into_iter().map(parse_action).collect()
}

/// Find the first balanced `{...}` or `[...]` in `raw` that is valid JSON
/// and shaped like a plan. Bracketed prose such as `[3]` is skipped.
pub fn extract_payload(raw: &str) -> Option<Value> {
    let mut from = 0;
    while let Some(offset) = raw[from..].find(['{', '[']) {
        let open = from + offset;
        if let Some(close) = balanced_end(raw, open) {
            if let Ok(value) = serde_json::from_str::<Value>(&raw[open..=close]) {
                if could_be_plan(&value) {
                    return Some(value);
                }
            }
        }
        from = open + 1;
    }
    None
}

fn could_be_plan(value: &Value) -> bool {
    match value {
        Value::Object(_) => true,
        Value::Array(items) => items.iter().all(Value::is_object),
        _ => false,
    }
}

fn balanced_end(text: &str, open: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in text[open..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' | '[' => depth += 1,
            '}' | ']' => {
                depth -= 1;
                if depth == 0 {
                    return Some(open + i);
                }
            }
            _ => {}
        }
    }
    None
}

fn take_envelope(map: &mut Map<String, Value>) -> Option<Vec<Value>> {
    for key in ["actions", "action"] {
        if matches!(map.get(key), Some(Value::Array(_))) {
            if let Some(Value::Array(items)) = map.remove(key) {
                return Some(items);
            }
        }
    }
    None
}

fn parse_action(value: Value) -> Result<ActionSpec> {
    let Value::Object(map) = value else {
        return Err(AgentError::InvalidAction {
            kind: "?".into(),
            reason: format!("expected an action object, got {}", value),
        });
    };
    let (kind, args) = split_kind(map)?;

    match kind.as_str() {
        "click" | "click_element" => {
            let a: TargetArgs = args_as(&kind, args)?;
            Ok(ActionSpec::Click {
                target: a.into_target(&kind)?,
            })
        }
        "input" | "input_text" | "type" | "type_text" | "fill" => {
            let a: InputArgs = args_as(&kind, args)?;
            let text = a.text.ok_or_else(|| invalid(&kind, "requires a 'text' string"))?;
            let target = TargetArgs {
                index: a.index,
                selector: a.selector,
            };
            Ok(ActionSpec::Input {
                target: target.into_target(&kind)?,
                text,
            })
        }
        "navigate" | "go_to_url" | "goto" | "open_url" => {
            let a: NavigateArgs = args_as(&kind, args)?;
            let url = a
                .url
                .map(|u| u.trim().to_string())
                .filter(|u| !u.is_empty())
                .ok_or_else(|| invalid(&kind, "requires a non-empty 'url'"))?;
            Ok(ActionSpec::Navigate { url })
        }
        "scroll" | "scroll_down" | "scroll_up" => {
            let a: ScrollArgs = args_as(&kind, args)?;
            let direction = match (kind.as_str(), a.direction) {
                ("scroll_up", _) => ScrollDirection::Up,
                ("scroll_down", _) => ScrollDirection::Down,
                (_, Some(d)) => d.parse().map_err(|e: String| invalid(&kind, &e))?,
                (_, None) => ScrollDirection::default(),
            };
            Ok(ActionSpec::Scroll {
                direction,
                amount: a.amount.map(|n| n.round() as i64),
            })
        }
        "extract" | "extract_content" => {
            let a: ExtractArgs = args_as(&kind, args)?;
            let selector = a
                .selector
                .filter(|s| !s.trim().is_empty())
                .ok_or_else(|| invalid(&kind, "requires a non-empty 'selector'"))?;
            Ok(ActionSpec::Extract { selector })
        }
        "done" | "finish" => {
            let a: DoneArgs = args_as(&kind, args)?;
            Ok(ActionSpec::Done {
                text: a.text.unwrap_or_default(),
                success: a.success.unwrap_or(true),
            })
        }
        _ => Err(AgentError::UnknownActionKind { kind }),
    }
}

/// Pull the action kind out of an action object, returning it with the
/// object holding the arguments.
fn split_kind(mut map: Map<String, Value>) -> Result<(String, Value)> {
    let named = ["type", "action"]
        .iter()
        .find_map(|key| map.get(*key).and_then(Value::as_str).map(normalize_kind));
    if let Some(kind) = named {
        let args = match map.remove("params") {
            Some(params @ Value::Object(_)) => params,
            _ => Value::Object(map),
        };
        return Ok((kind, args));
    }

    // `{"click_element": {"index": 3}}`
    if map.len() == 1 {
        if let Some((key, args @ Value::Object(_))) = map.into_iter().next() {
            return Ok((normalize_kind(&key), args));
        }
    }

    Err(AgentError::InvalidAction {
        kind: "?".into(),
        reason: "action has no 'type' field".into(),
    })
}

fn normalize_kind(kind: &str) -> String {
    kind.trim().to_ascii_lowercase().replace(['-', ' '], "_")
}

fn invalid(kind: &str, reason: &str) -> AgentError {
    AgentError::InvalidAction {
        kind: kind.to_string(),
        reason: reason.to_string(),
    }
}

fn args_as<T: DeserializeOwned>(kind: &str, args: Value) -> Result<T> {
    serde_json::from_value(args).map_err(|e| invalid(kind, &e.to_string()))
}

#[derive(Deserialize)]
struct TargetArgs {
    index: Option<usize>,
    selector: Option<String>,
}

impl TargetArgs {
    fn into_target(self, kind: &str) -> Result<Target> {
        if let Some(index) = self.index {
            return Ok(Target::Index(index));
        }
        match self.selector.map(|s| s.trim().to_string()) {
            Some(s) if !s.is_empty() => Ok(Target::Selector(s)),
            _ => Err(invalid(
                kind,
                "requires an element 'index' or a non-empty 'selector'",
            )),
        }
    }
}

#[derive(Deserialize)]
struct InputArgs {
    index: Option<usize>,
    selector: Option<String>,
    #[serde(alias = "value")]
    text: Option<String>,
}

#[derive(Deserialize)]
struct NavigateArgs {
    url: Option<String>,
}

#[derive(Deserialize)]
struct ScrollArgs {
    direction: Option<String>,
    amount: Option<f64>,
}

#[derive(Deserialize)]
struct ExtractArgs {
    selector: Option<String>,
}

#[derive(Deserialize)]
struct DoneArgs {
    #[serde(alias = "summary")]
    text: Option<String>,
    success: Option<bool>,
}
