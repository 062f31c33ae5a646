//! Plan executor: runs plan steps in order against the action registry.
//!
//! Fail-forward: each step's side effects stand even if a later step halts or fails.
//! A halting step discards the rest of the plan. Handler errors stop the plan as a halt
//! and never escape to the caller.

use crate::actions::{ActionContext, ActionError, ActionRegistry};
use crate::planner::Plan;
use std::sync::Arc;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionResult {
    /// Steps whose handler was invoked.
    pub steps_executed: usize,
    /// Index of the step that stopped the plan, if any.
    pub halted_at: Option<usize>,
    pub cancelled: bool,
    /// True if any invoked step reported side effects.
    pub side_effects_applied: bool,
    /// Error of the step that failed, if the plan stopped on one.
    pub error: Option<String>,
}

impl ExecutionResult {
    pub fn completed(&self) -> bool {
        self.halted_at.is_none() && !self.cancelled
    }
}

#[derive(Clone)]
pub struct PlanExecutor {
    registry: Arc<ActionRegistry>,
}

impl PlanExecutor {
    pub fn new(registry: Arc<ActionRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ActionRegistry {
        &self.registry
    }

    pub async fn execute(&self, plan: &Plan, ctx: &mut ActionContext<'_>) -> ExecutionResult {
        let mut result = ExecutionResult::default();
        for (index, command) in plan.commands.iter().enumerate() {
            if ctx.cancel.is_cancelled() {
                result.cancelled = true;
                result.halted_at = Some(index);
                break;
            }
            let (handler, is_fallback) = self.registry.resolve(&command.action);
            if is_fallback {
                tracing::debug!(action = %command.action, "routing to fallback handler");
            }
            result.steps_executed += 1;
            match handler.handle(ctx, &command.action, &command.arguments).await {
                Ok(outcome) => {
                    result.side_effects_applied |= outcome.side_effects_applied;
                    if !outcome.continue_plan {
                        result.halted_at = Some(index);
                        break;
                    }
                }
                Err(ActionError::Cancelled) => {
                    result.cancelled = true;
                    result.halted_at = Some(index);
                    break;
                }
                Err(e) => {
                    tracing::warn!(
                        conversation = %ctx.conversation_key(),
                        action = %command.action,
                        step = index,
                        error = %e,
                        "action failed, halting plan"
                    );
                    result.error = Some(e.to_string());
                    result.halted_at = Some(index);
                    break;
                }
            }
        }
        result
    }
}
