//! Bounded conversation history sent to the model.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::types::{ConversationTurn, Role};

pub const DEFAULT_CONTEXT_BUDGET: usize = 4096;

/// Never trim below this many turns.
const MIN_TURNS: usize = 2;

/// Approximate token cost of a piece of content. Implementations only need to
/// be monotone in content size.
pub trait CostModel: Send + Sync {
    fn cost(&self, content: &str) -> usize;
}

/// `ceil(len / divisor)` over the content's byte length.
#[derive(Debug, Clone, Copy)]
pub struct CharsPerToken(pub usize);

impl Default for CharsPerToken {
    fn default() -> Self {
        Self(4)
    }
}

impl CostModel for CharsPerToken {
    fn cost(&self, content: &str) -> usize {
        content.len().div_ceil(self.0.max(1))
    }
}

#[derive(Clone)]
pub struct ContextWindow {
    turns: Vec<ConversationTurn>,
    costs: Vec<usize>,
    budget: usize,
    cost_model: Arc<dyn CostModel>,
}

impl fmt::Debug for ContextWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextWindow")
            .field("turns", &self.turns.len())
            .field("total_cost", &self.total_cost())
            .field("budget", &self.budget)
            .finish()
    }
}

impl Default for ContextWindow {
    fn default() -> Self {
        Self::new(DEFAULT_CONTEXT_BUDGET)
    }
}

impl ContextWindow {
    pub fn new(budget: usize) -> Self {
        Self::with_cost_model(budget, Arc::new(CharsPerToken::default()))
    }

    pub fn with_cost_model(budget: usize, cost_model: Arc<dyn CostModel>) -> Self {
        Self {
            turns: Vec::new(),
            costs: Vec::new(),
            budget,
            cost_model,
        }
    }

    /// Append a serialized page/task state turn.
    pub fn add_state(&mut self, data: &Value) {
        self.add_turn(Role::State, data.to_string());
    }

    pub fn add_turn(&mut self, role: Role, content: impl Into<String>) {
        let turn = ConversationTurn::new(role, content);
        let cost = self.cost_model.cost(&turn.content);
        self.turns.push(turn);
        self.costs.push(cost);
        self.trim();
    }

    pub fn turns(&self) -> &[ConversationTurn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn total_cost(&self) -> usize {
        self.costs.iter().sum()
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    pub fn cost_model(&self) -> Arc<dyn CostModel> {
        self.cost_model.clone()
    }

    /// Cost of the turn that trimming protects, or 0 without a system turn.
    pub fn system_cost(&self) -> usize {
        self.turns
            .iter()
            .rposition(|t| t.role == Role::System)
            .map_or(0, |i| self.costs[i])
    }

    /// Shed the oldest turns until the window fits the budget or reaches the
    /// floor. The most recent system turn is never removed.
    fn trim(&mut self) {
        let mut total = self.total_cost();
        let mut removed = 0;
        while total > self.budget && self.turns.len() > MIN_TURNS {
            let protected = self.turns.iter().rposition(|t| t.role == Role::System);
            let victim = match protected {
                Some(0) => 1,
                _ => 0,
            };
            self.turns.remove(victim);
            total -= self.costs.remove(victim);
            removed += 1;
        }
        if removed > 0 {
            debug!(
                removed,
                remaining = self.turns.len(),
                total,
                budget = self.budget,
                "trimmed context window"
            );
        }
    }
}
