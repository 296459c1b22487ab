//! Session data and its run/pause/stop state machine.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use uuid::Uuid;

use crate::browser::BrowserHandle;
use crate::context_window::ContextWindow;
use crate::error::{AgentError, Result};
use crate::types::{ActionKind, PageSnapshot, StepRecord};

pub const DEFAULT_MAX_HISTORY: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// First eight characters, used for default session names.
    pub fn short(&self) -> &str {
        self.0.get(..8).unwrap_or(&self.0)
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Created,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Failed | SessionState::Cancelled
        )
    }

    /// A run loop currently owns the session.
    pub fn is_active(self) -> bool {
        matches!(self, SessionState::Running | SessionState::Paused)
    }

    /// Transitions only move forward within a run, except Running <-> Paused.
    /// Completed and Failed sessions may start a new run; Cancelled is final.
    /// A run that reaches its outcome while a pause is pending finishes from Paused.
    pub fn can_transition_to(self, to: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, to),
            (Created | Completed | Failed, Running)
                | (Running, Paused)
                | (Paused, Running)
                | (Running | Paused, Completed | Failed)
                | (Created | Running | Paused | Completed | Failed, Cancelled)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Created => "created",
            SessionState::Running => "running",
            SessionState::Paused => "paused",
            SessionState::Completed => "completed",
            SessionState::Failed => "failed",
            SessionState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Append-only step history with oldest-first eviction past `capacity`.
#[derive(Debug, Clone)]
pub struct StepHistory {
    records: VecDeque<StepRecord>,
    capacity: usize,
}

impl StepHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, record: StepRecord) {
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StepRecord> {
        self.records.iter()
    }

    pub fn to_vec(&self) -> Vec<StepRecord> {
        self.records.iter().cloned().collect()
    }
}

/// Why a run ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    StepLimitExceeded { limit: usize },
    /// The model reply could not be turned into a plan; `raw` is the reply.
    PlanRejected { error: String, raw: String },
    Model { error: String },
    StaleContext { error: String },
    DispatchFailure { action: ActionKind, error: String },
    /// The model finished with `done` and `success: false`.
    ReportedFailure { summary: String },
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::StepLimitExceeded { limit } => {
                write!(f, "step limit of {} exceeded", limit)
            }
            FailureReason::PlanRejected { error, .. } => write!(f, "plan rejected: {}", error),
            FailureReason::Model { error } => write!(f, "model error: {}", error),
            FailureReason::StaleContext { error } => write!(f, "page unavailable: {}", error),
            FailureReason::DispatchFailure { action, error } => {
                write!(f, "fatal {} failure: {}", action, error)
            }
            FailureReason::ReportedFailure { summary } => {
                write!(f, "task reported failure: {}", summary)
            }
        }
    }
}

/// What a finished run reports to its caller. Runs never end in an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub state: SessionState,
    /// Loop iterations started.
    pub steps: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureReason>,
}

impl RunOutcome {
    pub fn completed(steps: usize, summary: impl Into<String>) -> Self {
        Self {
            state: SessionState::Completed,
            steps,
            summary: Some(summary.into()),
            reason: None,
        }
    }

    pub fn failed(steps: usize, reason: FailureReason) -> Self {
        Self {
            state: SessionState::Failed,
            steps,
            summary: None,
            reason: Some(reason),
        }
    }

    pub fn cancelled(steps: usize) -> Self {
        Self {
            state: SessionState::Cancelled,
            steps,
            summary: None,
            reason: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SessionOptions {
    pub name: Option<String>,
    /// Page to load once the browser session is open.
    pub start_url: Option<String>,
    /// Overrides the configured context budget for this session.
    pub context_budget: Option<usize>,
    /// Overrides the configured step limit for runs on this session.
    pub max_steps: Option<usize>,
}

/// Instructions for one run.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TaskRequest {
    pub instructions: String,
    /// Overrides the session's step limit for this run only.
    #[serde(default)]
    pub max_steps: Option<usize>,
}

impl TaskRequest {
    pub fn new(instructions: impl Into<String>) -> Self {
        Self {
            instructions: instructions.into(),
            max_steps: None,
        }
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = Some(max_steps);
        self
    }

    pub fn validate(&self, max_chars: usize, max_steps_limit: usize) -> Result<()> {
        let instructions = self.instructions.trim();
        if instructions.is_empty() {
            return Err(AgentError::InvalidTask("instructions are required".into()));
        }
        if instructions.chars().count() > max_chars {
            return Err(AgentError::InvalidTask(format!(
                "instructions exceed {} characters",
                max_chars
            )));
        }
        validate_step_limit(self.max_steps, max_steps_limit)
    }
}

impl From<&str> for TaskRequest {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for TaskRequest {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

pub fn validate_step_limit(max_steps: Option<usize>, limit: usize) -> Result<()> {
    match max_steps {
        Some(n) if n == 0 || n > limit => Err(AgentError::InvalidTask(format!(
            "max_steps must be between 1 and {}",
            limit
        ))),
        _ => Ok(()),
    }
}

/// Broadcast to observers of the registry.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    StateChanged {
        session: SessionId,
        state: SessionState,
    },
    StepStarted {
        session: SessionId,
        step: usize,
    },
    ActionRecorded {
        session: SessionId,
        record: StepRecord,
    },
    RunFinished {
        session: SessionId,
        outcome: RunOutcome,
    },
    SessionClosed {
        session: SessionId,
        reason: String,
    },
}

impl SessionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::StateChanged { .. } => "state_changed",
            SessionEvent::StepStarted { .. } => "step_started",
            SessionEvent::ActionRecorded { .. } => "action_recorded",
            SessionEvent::RunFinished { .. } => "run_finished",
            SessionEvent::SessionClosed { .. } => "session_closed",
        }
    }
}

#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    pub name: String,
    pub browser: BrowserHandle,
    pub state: SessionState,
    pub current_snapshot: Option<Arc<PageSnapshot>>,
    pub history: StepHistory,
    pub context: ContextWindow,
    pub created_at: DateTime<Utc>,
    pub last_activity: Instant,
    pub task: Option<String>,
    pub last_outcome: Option<RunOutcome>,
    pub max_steps: Option<usize>,
}

impl Session {
    pub fn new(
        id: SessionId,
        name: String,
        browser: BrowserHandle,
        context: ContextWindow,
        max_history: usize,
    ) -> Self {
        Self {
            id,
            name,
            browser,
            state: SessionState::Created,
            current_snapshot: None,
            history: StepHistory::new(max_history),
            context,
            created_at: Utc::now(),
            last_activity: Instant::now(),
            task: None,
            last_outcome: None,
            max_steps: None,
        }
    }

    pub fn transition(&mut self, to: SessionState) -> Result<()> {
        if !self.state.can_transition_to(to) {
            return Err(AgentError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        self.state = to;
        self.touch();
        Ok(())
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            state: self.state,
            created_at: self.created_at,
            idle_secs: self.last_activity.elapsed().as_secs(),
            task: self.task.clone(),
            current_url: self.current_snapshot.as_ref().map(|s| s.url.clone()),
            current_title: self.current_snapshot.as_ref().map(|s| s.title.clone()),
            steps_recorded: self.history.len(),
            last_outcome: self.last_outcome.clone(),
        }
    }
}

/// Serializable view of a session for status queries.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub name: String,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub idle_secs: u64,
    pub task: Option<String>,
    pub current_url: Option<String>,
    pub current_title: Option<String>,
    pub steps_recorded: usize,
    pub last_outcome: Option<RunOutcome>,
}

/// A session plus the controls shared between the registry and the run loop.
///
/// `session` is only ever locked for short synchronous sections. `gate` is
/// held across each primitive browser operation so that teardown can wait for
/// the in-flight one instead of interrupting it.
pub struct SessionSlot {
    id: SessionId,
    session: Mutex<Session>,
    paused: watch::Sender<bool>,
    cancel: CancellationToken,
    gate: tokio::sync::Mutex<()>,
}

impl SessionSlot {
    pub fn new(session: Session) -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            id: session.id.clone(),
            session: Mutex::new(session),
            paused,
            cancel: CancellationToken::new(),
            gate: tokio::sync::Mutex::new(()),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut Session) -> R) -> R {
        f(&mut self.session.lock())
    }

    pub fn state(&self) -> SessionState {
        self.session.lock().state
    }

    pub fn info(&self) -> SessionInfo {
        self.session.lock().info()
    }

    /// Claim the session for a new run. Fails with `SessionBusy` without
    /// touching any state when a run is already in progress.
    pub fn begin_run(&self, task: &str) -> Result<()> {
        let mut session = self.session.lock();
        if session.state.is_active() {
            return Err(AgentError::SessionBusy(session.id.clone()));
        }
        // Retired by terminate or eviction; the registry no longer owns it.
        if session.state == SessionState::Cancelled {
            return Err(AgentError::SessionNotFound(session.id.clone()));
        }
        session.transition(SessionState::Running)?;
        session.task = Some(task.to_string());
        session.last_outcome = None;
        self.paused.send_replace(false);
        Ok(())
    }

    pub fn pause(&self) -> Result<()> {
        self.session.lock().transition(SessionState::Paused)?;
        self.paused.send_replace(true);
        Ok(())
    }

    pub fn resume(&self) -> Result<()> {
        let mut session = self.session.lock();
        if session.state != SessionState::Paused {
            return Err(AgentError::InvalidTransition {
                from: session.state,
                to: SessionState::Running,
            });
        }
        session.transition(SessionState::Running)?;
        self.paused.send_replace(false);
        Ok(())
    }

    /// Mark the session cancelled and wake anything waiting on it.
    pub fn cancel(&self) {
        {
            let mut session = self.session.lock();
            if session.state != SessionState::Cancelled {
                session.state = SessionState::Cancelled;
                session.touch();
            }
        }
        self.cancel.cancel();
    }

    /// Mark the session `Cancelled` if it is not running and has been idle
    /// longer than `timeout` at `now`. The check and the state change happen
    /// under one lock, so a run cannot start in between.
    pub fn retire_if_idle(&self, now: Instant, timeout: Duration) -> bool {
        let mut session = self.session.lock();
        if session.state == SessionState::Running
            || now.saturating_duration_since(session.last_activity) <= timeout
        {
            return false;
        }
        session.state = SessionState::Cancelled;
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    /// Block while the session is paused. Returns `false` if it was cancelled.
    pub async fn wait_while_paused(&self) -> bool {
        let mut paused = self.paused.subscribe();
        tokio::select! {
            resumed = async { paused.wait_for(|p| !*p).await.is_ok() } => {
                resumed && !self.is_cancelled()
            }
            _ = self.cancel.cancelled() => false,
        }
    }

    pub async fn gate(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.gate.lock().await
    }
}
