//! Action registry: named handlers the plan executor dispatches to.
//!
//! The table is open. Handlers are registered at start-up by name, and any name the
//! planner emits that has no handler goes to the fallback, which never fails the turn.

mod builtin;
mod delegate;
mod lights;

pub use builtin::{FlaggedInput, FlaggedOutput, Say, UnknownAction};
pub use delegate::CallSkillBots;
pub use lights::{LightsOff, LightsOn, Pause, DEFAULT_MAX_PAUSE_MS, DEFAULT_PAUSE_MS};

use crate::activity::Activity;
use crate::channel::Channel;
use crate::error::RelayError;
use crate::state::ConversationRecord;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Planner `SAY` responses.
pub const SAY_ACTION: &str = "SAY";
/// Runs instead of the planner when input moderation flags the turn.
pub const FLAGGED_INPUT_ACTION: &str = "FLAGGED_INPUT";
/// Replaces the plan when output moderation flags a response.
pub const FLAGGED_OUTPUT_ACTION: &str = "FLAGGED_OUTPUT";

/// Whether the plan goes on after a step, and whether the step changed anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionOutcome {
    pub continue_plan: bool,
    pub side_effects_applied: bool,
}

impl ActionOutcome {
    pub fn proceed() -> Self {
        Self {
            continue_plan: true,
            side_effects_applied: true,
        }
    }

    pub fn halt() -> Self {
        Self {
            continue_plan: false,
            side_effects_applied: true,
        }
    }

    pub fn with_side_effects(mut self, applied: bool) -> Self {
        self.side_effects_applied = applied;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error("invalid argument {name}: {reason}")]
    InvalidArgument { name: String, reason: String },
    #[error(transparent)]
    Relay(#[from] RelayError),
    #[error("turn cancelled")]
    Cancelled,
}

/// Everything a handler may touch during one step.
pub struct ActionContext<'a> {
    pub record: &'a mut ConversationRecord,
    pub channel: &'a dyn Channel,
    /// The inbound activity that started the turn.
    pub activity: &'a Activity,
    pub cancel: &'a CancellationToken,
}

impl ActionContext<'_> {
    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), ActionError> {
        self.channel.send_activity(Activity::message(text)).await?;
        Ok(())
    }

    pub fn conversation_key(&self) -> String {
        self.record.key().to_string()
    }
}

#[async_trait::async_trait]
pub trait ActionHandler: Send + Sync {
    /// Conversation fields this handler reads or writes.
    fn declared_fields(&self) -> &'static [&'static str] {
        &[]
    }

    /// Runs one plan step. `action` is the name as the planner wrote it, which for the
    /// fallback is the unresolved name.
    async fn handle(
        &self,
        ctx: &mut ActionContext<'_>,
        action: &str,
        arguments: &Map<String, Value>,
    ) -> Result<ActionOutcome, ActionError>;
}

/// Name → handler table plus the fallback for unknown names.
pub struct ActionRegistry {
    handlers: HashMap<String, Arc<dyn ActionHandler>>,
    fallback: Arc<dyn ActionHandler>,
}

impl ActionRegistry {
    /// Registry with the built-in `SAY`, `FLAGGED_INPUT` and `FLAGGED_OUTPUT` handlers
    /// and the default unknown-action fallback.
    pub fn new() -> Self {
        let mut registry = Self::empty(Arc::new(UnknownAction));
        registry.register(SAY_ACTION, Arc::new(Say));
        registry.register(FLAGGED_INPUT_ACTION, Arc::new(FlaggedInput));
        registry.register(FLAGGED_OUTPUT_ACTION, Arc::new(FlaggedOutput));
        registry
    }

    /// Registry with no handlers at all.
    pub fn empty(fallback: Arc<dyn ActionHandler>) -> Self {
        Self {
            handlers: HashMap::new(),
            fallback,
        }
    }

    /// Binds `name` to `handler`, replacing any previous binding.
    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn ActionHandler>) {
        let name = name.into();
        if self.handlers.insert(name.clone(), handler).is_some() {
            tracing::warn!(action = %name, "action handler replaced");
        }
    }

    pub fn with(mut self, name: impl Into<String>, handler: Arc<dyn ActionHandler>) -> Self {
        self.register(name, handler);
        self
    }

    pub fn set_fallback(&mut self, fallback: Arc<dyn ActionHandler>) {
        self.fallback = fallback;
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ActionHandler>> {
        self.handlers.get(name).cloned()
    }

    /// Handler for `name`, or the fallback. The flag is true when the fallback was used.
    pub fn resolve(&self, name: &str) -> (Arc<dyn ActionHandler>, bool) {
        match self.handlers.get(name) {
            Some(h) => (Arc::clone(h), false),
            None => (Arc::clone(&self.fallback), true),
        }
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for ActionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Reads `name` from `arguments` as a string, accepting numbers and booleans too.
pub(crate) fn argument_str(arguments: &Map<String, Value>, name: &str) -> Option<String> {
    match arguments.get(name)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
