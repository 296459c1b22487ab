//! Owns every live session and the only paths that create or destroy one.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::agent::AgentRunLoop;
use crate::browser::Browser;
use crate::config::RegistryConfig;
use crate::context_window::ContextWindow;
use crate::error::{AgentError, Result};
use crate::session::{
    RunOutcome, Session, SessionEvent, SessionId, SessionInfo, SessionOptions, SessionSlot,
    SessionState, TaskRequest, validate_step_limit,
};
use crate::types::{Role, StepRecord};

pub struct SessionRegistry {
    browser: Arc<dyn Browser>,
    agent: Arc<AgentRunLoop>,
    config: RegistryConfig,
    sessions: RwLock<HashMap<SessionId, Arc<SessionSlot>>>,
    /// Serializes create, terminate and eviction.
    lifecycle: tokio::sync::Mutex<()>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionRegistry {
    pub fn new(browser: Arc<dyn Browser>, agent: Arc<AgentRunLoop>, config: RegistryConfig) -> Self {
        let events = agent.events();
        Self {
            browser,
            agent,
            config,
            sessions: RwLock::new(HashMap::new()),
            lifecycle: tokio::sync::Mutex::new(()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn slot(&self, id: &SessionId) -> Result<Arc<SessionSlot>> {
        self.sessions
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| AgentError::SessionNotFound(id.clone()))
    }

    pub async fn create(&self, options: SessionOptions) -> Result<SessionInfo> {
        if let Some(url) = &options.start_url {
            Url::parse(url)
                .map_err(|e| AgentError::InvalidTask(format!("invalid start url '{}': {}", url, e)))?;
        }
        validate_step_limit(options.max_steps, self.config.max_steps_limit)?;

        let _lifecycle = self.lifecycle.lock().await;
        let handle = self.browser.new_session().await?;
        if let Some(url) = &options.start_url {
            if let Err(e) = self.browser.navigate(&handle, url).await {
                if let Err(close) = self.browser.close(&handle).await {
                    warn!(%handle, "closing browser session failed: {}", close);
                }
                return Err(e.into());
            }
        }

        let id = SessionId::new();
        let name = options
            .name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| format!("Session {}", id.short()));
        let agent_config = self.agent.config();
        let mut context =
            ContextWindow::new(options.context_budget.unwrap_or(agent_config.context_budget));
        context.add_turn(Role::System, self.agent.system_prompt());

        let mut session = Session::new(id.clone(), name, handle, context, agent_config.max_history);
        session.max_steps = options.max_steps;
        let slot = Arc::new(SessionSlot::new(session));
        let info = slot.info();
        self.sessions.write().insert(id.clone(), slot);

        info!(session = %id, name = %info.name, "session created");
        self.emit(SessionEvent::StateChanged {
            session: id,
            state: SessionState::Created,
        });
        Ok(info)
    }

    pub fn get(&self, id: &SessionId) -> Result<SessionInfo> {
        Ok(self.slot(id)?.info())
    }

    /// All sessions, oldest first.
    pub fn list(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> =
            self.sessions.read().values().map(|slot| slot.info()).collect();
        sessions.sort_by_key(|s| s.created_at);
        sessions
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    pub fn history(&self, id: &SessionId) -> Result<Vec<StepRecord>> {
        Ok(self.slot(id)?.with(|s| s.history.to_vec()))
    }

    pub fn pause(&self, id: &SessionId) -> Result<SessionInfo> {
        let slot = self.slot(id)?;
        slot.pause()?;
        info!(session = %id, "session paused");
        self.emit(SessionEvent::StateChanged {
            session: id.clone(),
            state: SessionState::Paused,
        });
        Ok(slot.info())
    }

    pub fn resume(&self, id: &SessionId) -> Result<SessionInfo> {
        let slot = self.slot(id)?;
        slot.resume()?;
        info!(session = %id, "session resumed");
        self.emit(SessionEvent::StateChanged {
            session: id.clone(),
            state: SessionState::Running,
        });
        Ok(slot.info())
    }

    /// Validate the task and claim the session for it.
    fn begin(&self, id: &SessionId, task: &TaskRequest) -> Result<Arc<SessionSlot>> {
        task.validate(self.config.max_task_chars, self.config.max_steps_limit)?;
        let slot = self.slot(id)?;
        slot.begin_run(task.instructions.trim())?;
        self.emit(SessionEvent::StateChanged {
            session: id.clone(),
            state: SessionState::Running,
        });
        Ok(slot)
    }

    /// Run a task to completion on the calling task.
    pub async fn run(&self, id: &SessionId, task: impl Into<TaskRequest>) -> Result<RunOutcome> {
        let task = task.into();
        let slot = self.begin(id, &task)?;
        Ok(self.agent.run(&slot, &task).await)
    }

    /// Start a task in the background. The session is already `Running` when
    /// this returns.
    pub fn spawn_run(
        &self,
        id: &SessionId,
        task: impl Into<TaskRequest>,
    ) -> Result<JoinHandle<RunOutcome>> {
        let task = task.into();
        let slot = self.begin(id, &task)?;
        let agent = self.agent.clone();
        Ok(tokio::spawn(async move { agent.run(&slot, &task).await }))
    }

    pub async fn screenshot(&self, id: &SessionId) -> Result<Vec<u8>> {
        let slot = self.slot(id)?;
        let handle = slot.with(|s| {
            s.touch();
            s.browser.clone()
        });
        let _gate = slot.gate().await;
        Ok(self.browser.screenshot(&handle).await?)
    }

    /// Cancel any run, release the browser session and forget the session.
    pub async fn terminate(&self, id: &SessionId) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        let removed = self.sessions.write().remove(id);
        let slot = removed.ok_or_else(|| AgentError::SessionNotFound(id.clone()))?;
        self.release(slot, "terminated").await;
        Ok(())
    }

    /// Remove sessions that are not running and have been idle longer than
    /// the idle timeout. Returns the ids that were removed.
    pub async fn evict_idle(&self, now: Instant) -> Vec<SessionId> {
        let _lifecycle = self.lifecycle.lock().await;
        let retired: Vec<(SessionId, Arc<SessionSlot>)> = {
            let mut sessions = self.sessions.write();
            let expired: Vec<SessionId> = sessions
                .iter()
                .filter(|(_, slot)| slot.retire_if_idle(now, self.config.idle_timeout))
                .map(|(id, _)| id.clone())
                .collect();
            expired
                .into_iter()
                .filter_map(|id| sessions.remove(&id).map(|slot| (id, slot)))
                .collect()
        };

        let mut evicted = Vec::with_capacity(retired.len());
        for (id, slot) in retired {
            info!(session = %id, "evicting idle session");
            self.release(slot, "idle timeout").await;
            evicted.push(id);
        }
        evicted
    }

    /// Terminate every session.
    pub async fn shutdown(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        let slots: Vec<Arc<SessionSlot>> =
            self.sessions.write().drain().map(|(_, slot)| slot).collect();
        for slot in slots {
            self.release(slot, "shutdown").await;
        }
    }

    async fn release(&self, slot: Arc<SessionSlot>, reason: &str) {
        slot.cancel();
        let gate = tokio::time::timeout(self.config.terminate_grace, slot.gate()).await;
        if gate.is_err() {
            warn!(
                session = %slot.id(),
                grace = ?self.config.terminate_grace,
                "browser operation still in flight after grace period, closing anyway"
            );
        }
        let handle = slot.with(|s| s.browser.clone());
        if let Err(e) = self.browser.close(&handle).await {
            warn!(session = %slot.id(), %handle, "closing browser session failed: {}", e);
        }
        drop(gate);
        debug!(session = %slot.id(), reason, "session released");
        self.emit(SessionEvent::SessionClosed {
            session: slot.id().clone(),
            reason: reason.to_string(),
        });
    }

    /// Periodically evict idle sessions. Stops once the registry is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let registry: Weak<Self> = Arc::downgrade(self);
        let period = self.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                let evicted = registry.evict_idle(Instant::now()).await;
                if !evicted.is_empty() {
                    info!(count = evicted.len(), "evicted idle sessions");
                }
            }
        })
    }
}
