//! Drives one task on one session: capture, ask the model, act, repeat.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::brain::{Model, SYSTEM_PROMPT};
use crate::browser::{Browser, BrowserHandle};
use crate::config::AgentConfig;
use crate::context_window::CostModel;
use crate::dispatch::{ActionDispatcher, PageContext};
use crate::dom::ElementIndexer;
use crate::error::{AgentError, Result};
use crate::plan;
use crate::session::{
    FailureReason, RunOutcome, SessionEvent, SessionSlot, SessionState, TaskRequest,
};
use crate::types::{ActionResult, ActionSpec, PageSnapshot, Role, StepRecord};

const CAPTURE_RETRY_DELAY: Duration = Duration::from_millis(250);
const EVENT_CAPACITY: usize = 256;

pub struct AgentRunLoop {
    model: Arc<dyn Model>,
    indexer: ElementIndexer,
    dispatcher: ActionDispatcher,
    config: AgentConfig,
    system_prompt: String,
    events: broadcast::Sender<SessionEvent>,
}

impl AgentRunLoop {
    pub fn new(browser: Arc<dyn Browser>, model: Arc<dyn Model>, config: AgentConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            model,
            indexer: ElementIndexer::new(browser.clone()),
            dispatcher: ActionDispatcher::new(browser),
            config,
            system_prompt: SYSTEM_PROMPT.to_string(),
            events,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    pub fn events(&self) -> broadcast::Sender<SessionEvent> {
        self.events.clone()
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    /// Run `task` to a terminal outcome. The slot must already have been
    /// moved to `Running` (see [`SessionSlot::begin_run`]).
    pub async fn run(&self, slot: &SessionSlot, task: &TaskRequest) -> RunOutcome {
        let span = info_span!("run", session = %slot.id());
        self.run_steps(slot, task).instrument(span).await
    }

    async fn run_steps(&self, slot: &SessionSlot, task: &TaskRequest) -> RunOutcome {
        let (handle, session_limit) = slot.with(|s| (s.browser.clone(), s.max_steps));
        let max_steps = task
            .max_steps
            .or(session_limit)
            .unwrap_or(self.config.max_steps);
        let mut page = PageContext::new(handle);
        let mut last_results: Vec<ActionResult> = Vec::new();

        info!(max_steps, "starting task: {}", task.instructions);

        for step in 1..=max_steps {
            if !slot.wait_while_paused().await {
                return self.finish(slot, RunOutcome::cancelled(step - 1));
            }
            self.emit(SessionEvent::StepStarted {
                session: slot.id().clone(),
                step,
            });

            let snapshot = match self.capture(slot, &page.handle).await {
                Ok(snapshot) => snapshot,
                Err(_) if slot.is_cancelled() => {
                    return self.finish(slot, RunOutcome::cancelled(step));
                }
                Err(AgentError::StaleContext(error)) => {
                    return self.finish(
                        slot,
                        RunOutcome::failed(step, FailureReason::StaleContext { error }),
                    );
                }
                Err(e) => {
                    return self.finish(
                        slot,
                        RunOutcome::failed(step, FailureReason::StaleContext {
                            error: e.to_string(),
                        }),
                    );
                }
            };
            page.snapshot = Some(snapshot.clone());
            debug!(step, elements = snapshot.elements.len(), url = %snapshot.url, "page captured");

            if self.config.highlight_elements {
                let _gate = slot.gate().await;
                if let Err(e) = self.indexer.highlight_all(&page.handle, &snapshot).await {
                    debug!("highlighting failed: {}", e);
                }
            }

            let task_turn = format!("Task: {}", task.instructions);
            let (cost_model, room) = slot.with(|s| {
                let reserved = s.context.system_cost() + s.context.cost_model().cost(&task_turn);
                (s.context.cost_model(), s.context.budget().saturating_sub(reserved))
            });
            let state = self.state_message(
                &snapshot,
                step,
                max_steps,
                &last_results,
                cost_model.as_ref(),
                room,
            );
            let turns = slot.with(|s| {
                s.current_snapshot = Some(snapshot.clone());
                s.context.add_state(&state);
                s.context.add_turn(Role::User, task_turn);
                s.touch();
                s.context.turns().to_vec()
            });

            let reply = tokio::select! {
                reply = self.model.complete(&turns) => reply,
                _ = slot.cancelled() => {
                    return self.finish(slot, RunOutcome::cancelled(step));
                }
            };
            let reply = match reply {
                Ok(reply) => reply,
                Err(e) => {
                    let error = match e {
                        AgentError::Model(message) => message,
                        other => other.to_string(),
                    };
                    return self.finish(slot, RunOutcome::failed(step, FailureReason::Model { error }));
                }
            };
            slot.with(|s| s.context.add_turn(Role::Assistant, reply.clone()));

            let actions = match plan::parse(&reply) {
                Ok(actions) => actions,
                Err(e) => {
                    warn!(step, "plan rejected: {}", e);
                    return self.finish(
                        slot,
                        RunOutcome::failed(step, FailureReason::PlanRejected {
                            error: e.to_string(),
                            raw: reply,
                        }),
                    );
                }
            };
            debug!(step, actions = actions.len(), "plan parsed");

            if self.config.highlight_elements {
                let _gate = slot.gate().await;
                if let Err(e) = self.indexer.clear_highlights(&page.handle).await {
                    debug!("clearing highlights failed: {}", e);
                }
            }

            last_results.clear();
            for action in actions {
                let result = {
                    let _gate = slot.gate().await;
                    if slot.is_cancelled() {
                        return self.finish(slot, RunOutcome::cancelled(step));
                    }
                    self.dispatcher.execute(&mut page, &action).await
                };
                info!(step, action = %action.kind(), success = result.success, "{}", action.describe());

                let record = StepRecord {
                    step,
                    action: action.clone(),
                    result: result.clone(),
                    timestamp: Utc::now(),
                };
                slot.with(|s| {
                    s.history.push(record.clone());
                    if page.snapshot.is_none() {
                        s.current_snapshot = None;
                    }
                    s.touch();
                });
                self.emit(SessionEvent::ActionRecorded {
                    session: slot.id().clone(),
                    record,
                });

                if let ActionSpec::Done { text, success } = &action {
                    let outcome = if *success {
                        RunOutcome::completed(step, text.clone())
                    } else {
                        RunOutcome::failed(step, FailureReason::ReportedFailure {
                            summary: text.clone(),
                        })
                    };
                    return self.finish(slot, outcome);
                }

                if !result.success && self.config.fatal_actions.contains(&result.action) {
                    let error = result.error.clone().unwrap_or_default();
                    return self.finish(
                        slot,
                        RunOutcome::failed(step, FailureReason::DispatchFailure {
                            action: result.action,
                            error,
                        }),
                    );
                }
                last_results.push(result);
            }
        }

        self.finish(
            slot,
            RunOutcome::failed(max_steps, FailureReason::StepLimitExceeded { limit: max_steps }),
        )
    }

    /// Capture under the step gate, retrying while the page is unavailable.
    async fn capture(&self, slot: &SessionSlot, handle: &BrowserHandle) -> Result<Arc<PageSnapshot>> {
        let mut attempt = 0;
        loop {
            let captured = {
                let _gate = slot.gate().await;
                if slot.is_cancelled() {
                    return Err(AgentError::StaleContext("session cancelled".into()));
                }
                self.indexer.capture(handle).await
            };
            match captured {
                Ok(snapshot) => return Ok(Arc::new(snapshot)),
                Err(AgentError::StaleContext(reason)) if attempt < self.config.capture_retries => {
                    attempt += 1;
                    warn!(attempt, "page unavailable, capturing again: {}", reason);
                    tokio::time::sleep(CAPTURE_RETRY_DELAY).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Build the state turn. Elements past `max_state_elements`, or past what
    /// fits in `room`, are left out and counted in `omitted_elements`.
    fn state_message(
        &self,
        snapshot: &PageSnapshot,
        step: usize,
        max_steps: usize,
        last_results: &[ActionResult],
        cost_model: &dyn CostModel,
        room: usize,
    ) -> Value {
        let total = snapshot.elements.len();
        let mut shown = total.min(self.config.max_state_elements);
        loop {
            let elements: Vec<String> = snapshot
                .elements
                .iter()
                .take(shown)
                .map(|e| e.summary_line())
                .collect();
            let state = json!({
                "step": step,
                "max_steps": max_steps,
                "url": snapshot.url,
                "title": snapshot.title,
                "elements": elements,
                "omitted_elements": total - shown,
                "last_results": last_results,
            });
            if shown == 0 || cost_model.cost(&state.to_string()) <= room {
                return state;
            }
            shown -= (shown / 10).max(1);
        }
    }

    fn finish(&self, slot: &SessionSlot, outcome: RunOutcome) -> RunOutcome {
        slot.with(|s| {
            if s.state != SessionState::Cancelled {
                if let Err(e) = s.transition(outcome.state) {
                    warn!("could not record outcome: {}", e);
                }
            }
            s.last_outcome = Some(outcome.clone());
            s.touch();
        });
        match &outcome.reason {
            None => info!(steps = outcome.steps, state = %outcome.state, "run finished"),
            Some(reason) => warn!(steps = outcome.steps, state = %outcome.state, "run finished: {}", reason),
        }
        self.emit(SessionEvent::StateChanged {
            session: slot.id().clone(),
            state: slot.state(),
        });
        self.emit(SessionEvent::RunFinished {
            session: slot.id().clone(),
            outcome: outcome.clone(),
        });
        outcome
    }
}
