//! Environment-driven configuration.
//!
//! Every value has a default, so an empty environment (plus an API key for the
//! model) is a working setup.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::context_window::DEFAULT_CONTEXT_BUDGET;
use crate::session::DEFAULT_MAX_HISTORY;
use crate::types::ActionKind;

pub const DEFAULT_MAX_STEPS: usize = 25;
/// Upper bound accepted for a per-session or per-run step limit.
pub const MAX_STEPS_LIMIT: usize = 50;
pub const MAX_TASK_CHARS: usize = 2000;

#[derive(Error, Debug, Clone, PartialEq)]
#[error("invalid value for {var}: {value:?} ({reason})")]
pub struct ConfigError {
    pub var: String,
    pub value: String,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct ModelConfig {
    /// `OPENAI_API_KEY`. Required by [`crate::brain::OpenAiModel`].
    pub api_key: Option<String>,
    /// `PILOT_MODEL_BASE_URL`, default `https://api.openai.com/v1`.
    pub base_url: String,
    /// `PILOT_MODEL`, default `gpt-4o-mini`.
    pub model: String,
    /// `PILOT_TEMPERATURE`, default 0.2.
    pub temperature: f32,
    pub request_timeout: Duration,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.openai.com/v1".into(),
            model: "gpt-4o-mini".into(),
            temperature: 0.2,
            request_timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BrowserConfig {
    /// `PILOT_HEADLESS`, default true.
    pub headless: bool,
    /// `PILOT_CHROME_PATH`. When unset, headless_chrome locates Chrome itself.
    pub chrome_path: Option<PathBuf>,
    /// `PILOT_CHROME_DEBUG_URL`. Attach to a running Chrome instead of launching one.
    pub debug_url: Option<String>,
    /// `PILOT_USER_DATA_DIR`, default `<data_local_dir>/webpilot/chrome-profile`.
    pub user_data_dir: Option<PathBuf>,
    /// `PILOT_WINDOW_WIDTH` x `PILOT_WINDOW_HEIGHT`, default 1280x720.
    pub window_width: u32,
    pub window_height: u32,
    pub idle_browser_timeout: Duration,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            headless: true,
            chrome_path: None,
            debug_url: None,
            user_data_dir: dirs::data_local_dir().map(|d| d.join("webpilot").join("chrome-profile")),
            window_width: 1280,
            window_height: 720,
            idle_browser_timeout: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// `PILOT_MAX_STEPS`, default 25.
    pub max_steps: usize,
    /// `PILOT_CONTEXT_BUDGET`, default 4096 tokens.
    pub context_budget: usize,
    /// `PILOT_MAX_HISTORY`, default 100 records per session.
    pub max_history: usize,
    /// `PILOT_CAPTURE_RETRIES`, default 2.
    pub capture_retries: usize,
    /// `PILOT_HIGHLIGHT`, default false.
    pub highlight_elements: bool,
    /// `PILOT_MAX_STATE_ELEMENTS`, default 150.
    pub max_state_elements: usize,
    /// `PILOT_FATAL_ACTIONS`, comma separated. A failed action of one of these
    /// kinds ends the run.
    pub fatal_actions: Vec<ActionKind>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_steps: DEFAULT_MAX_STEPS,
            context_budget: DEFAULT_CONTEXT_BUDGET,
            max_history: DEFAULT_MAX_HISTORY,
            capture_retries: 2,
            highlight_elements: false,
            max_state_elements: 150,
            fatal_actions: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// `PILOT_IDLE_TIMEOUT_SECS`, default 30 minutes.
    pub idle_timeout: Duration,
    /// `PILOT_SWEEP_INTERVAL_SECS`, default 5 minutes.
    pub sweep_interval: Duration,
    /// `PILOT_TERMINATE_GRACE_SECS`, default 10 seconds.
    pub terminate_grace: Duration,
    pub max_task_chars: usize,
    pub max_steps_limit: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(30 * 60),
            sweep_interval: Duration::from_secs(5 * 60),
            terminate_grace: Duration::from_secs(10),
            max_task_chars: MAX_TASK_CHARS,
            max_steps_limit: MAX_STEPS_LIMIT,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PilotConfig {
    pub model: ModelConfig,
    pub browser: BrowserConfig,
    pub agent: AgentConfig,
    pub registry: RegistryConfig,
}

impl PilotConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from an arbitrary variable source. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(&lookup);
        let mut config = PilotConfig::default();

        let model = &mut config.model;
        model.api_key = env.string("OPENAI_API_KEY");
        if let Some(url) = env.string("PILOT_MODEL_BASE_URL") {
            model.base_url = url.trim_end_matches('/').to_string();
        }
        if let Some(name) = env.string("PILOT_MODEL") {
            model.model = name;
        }
        model.temperature = env.parse("PILOT_TEMPERATURE", model.temperature)?;

        let browser = &mut config.browser;
        browser.headless = env.flag("PILOT_HEADLESS", browser.headless)?;
        browser.chrome_path = env.string("PILOT_CHROME_PATH").map(PathBuf::from);
        browser.debug_url = env.string("PILOT_CHROME_DEBUG_URL");
        if let Some(dir) = env.string("PILOT_USER_DATA_DIR") {
            browser.user_data_dir = Some(PathBuf::from(dir));
        }
        browser.window_width = env.parse("PILOT_WINDOW_WIDTH", browser.window_width)?;
        browser.window_height = env.parse("PILOT_WINDOW_HEIGHT", browser.window_height)?;

        let agent = &mut config.agent;
        agent.max_steps = env.parse("PILOT_MAX_STEPS", agent.max_steps)?;
        agent.context_budget = env.parse("PILOT_CONTEXT_BUDGET", agent.context_budget)?;
        agent.max_history = env.parse("PILOT_MAX_HISTORY", agent.max_history)?;
        agent.capture_retries = env.parse("PILOT_CAPTURE_RETRIES", agent.capture_retries)?;
        agent.highlight_elements = env.flag("PILOT_HIGHLIGHT", agent.highlight_elements)?;
        agent.max_state_elements =
            env.parse("PILOT_MAX_STATE_ELEMENTS", agent.max_state_elements)?;
        if let Some(list) = env.string("PILOT_FATAL_ACTIONS") {
            agent.fatal_actions = parse_action_list(&list).map_err(|reason| ConfigError {
                var: "PILOT_FATAL_ACTIONS".into(),
                value: list.clone(),
                reason,
            })?;
        }
        if agent.max_steps == 0 {
            return Err(ConfigError {
                var: "PILOT_MAX_STEPS".into(),
                value: "0".into(),
                reason: "must be at least 1".into(),
            });
        }

        let registry = &mut config.registry;
        registry.idle_timeout = env.secs("PILOT_IDLE_TIMEOUT_SECS", registry.idle_timeout)?;
        registry.sweep_interval = env.secs("PILOT_SWEEP_INTERVAL_SECS", registry.sweep_interval)?;
        registry.terminate_grace =
            env.secs("PILOT_TERMINATE_GRACE_SECS", registry.terminate_grace)?;
        if registry.sweep_interval.is_zero() {
            return Err(ConfigError {
                var: "PILOT_SWEEP_INTERVAL_SECS".into(),
                value: "0".into(),
                reason: "must be at least 1".into(),
            });
        }

        Ok(config)
    }
}

struct Env<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn string(&self, var: &str) -> Option<String> {
        (self.0)(var)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, var: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.string(var) {
            None => Ok(default),
            Some(value) => value.parse::<T>().map_err(|e| ConfigError {
                var: var.to_string(),
                reason: e.to_string(),
                value,
            }),
        }
    }

    fn flag(&self, var: &str, default: bool) -> Result<bool, ConfigError> {
        let Some(value) = self.string(var) else {
            return Ok(default);
        };
        match value.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError {
                var: var.to_string(),
                value,
                reason: "expected true or false".into(),
            }),
        }
    }

    fn secs(&self, var: &str, default: Duration) -> Result<Duration, ConfigError> {
        self.parse(var, default.as_secs()).map(Duration::from_secs)
    }
}

fn parse_action_list(list: &str) -> Result<Vec<ActionKind>, String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ActionKind::from_str)
        .collect()
}
