//! Browser automation agent core: indexes live pages, keeps a bounded model
//! conversation per session, turns model replies into browser actions and
//! manages the sessions those actions run in.

pub mod agent;
pub mod brain;
pub mod browser;
pub mod config;
pub mod context_window;
pub mod dispatch;
pub mod dom;
pub mod error;
pub mod hands;
pub mod plan;
pub mod registry;
pub mod session;
pub mod types;

pub use agent::AgentRunLoop;
pub use brain::{Model, OpenAiModel};
pub use browser::{Browser, BrowserHandle};
pub use config::PilotConfig;
pub use context_window::{CharsPerToken, ContextWindow, CostModel};
pub use dispatch::{ActionDispatcher, PageContext};
pub use dom::ElementIndexer;
pub use error::{AgentError, BrowserError, Result};
pub use hands::ChromeBrowser;
pub use registry::SessionRegistry;
pub use session::{
    FailureReason, RunOutcome, SessionEvent, SessionId, SessionInfo, SessionOptions, SessionState,
    TaskRequest,
};
pub use types::{ActionKind, ActionResult, ActionSpec, PageSnapshot, StepRecord, Target};
