use thiserror::Error;

use crate::session::{SessionId, SessionState};
use crate::types::ActionKind;

/// Failures raised by a [`Browser`](crate::browser::Browser) implementation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BrowserError {
    #[error("browser launch failed: {0}")]
    Launch(String),

    #[error("browser session {0} is closed")]
    SessionClosed(String),

    #[error("element not found: {0}")]
    ElementNotFound(String),

    #[error("navigation failed: {0}")]
    Navigation(String),

    #[error("script error: {0}")]
    Script(String),

    #[error("page unavailable: {0}")]
    PageUnavailable(String),

    #[error("io error: {0}")]
    Io(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AgentError {
    /// The snapshot or page the caller holds is no longer valid. Re-capture and retry.
    #[error("stale page context: {0}")]
    StaleContext(String),

    #[error("no JSON action plan found in model output")]
    MalformedPlan { raw: String },

    #[error("invalid {kind} action: {reason}")]
    InvalidAction { kind: String, reason: String },

    #[error("unknown action kind '{kind}'")]
    UnknownActionKind { kind: String },

    #[error("{action} failed: {message}")]
    DispatchFailure { action: ActionKind, message: String },

    #[error("session {0} is busy running another task")]
    SessionBusy(SessionId),

    #[error("session {0} not found")]
    SessionNotFound(SessionId),

    #[error("cannot move session from {from} to {to}")]
    InvalidTransition { from: SessionState, to: SessionState },

    #[error("element index {index} out of range (snapshot has {len} elements)")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("invalid task: {0}")]
    InvalidTask(String),

    #[error(transparent)]
    Browser(#[from] BrowserError),

    #[error("model error: {0}")]
    Model(String),
}

impl AgentError {
    /// Parse and plan rejections: the model output could not be turned into actions.
    pub fn is_plan_rejection(&self) -> bool {
        matches!(
            self,
            AgentError::MalformedPlan { .. }
                | AgentError::InvalidAction { .. }
                | AgentError::UnknownActionKind { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;
