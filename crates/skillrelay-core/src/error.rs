//! Turn-level error taxonomy.
//!
//! An unknown action name is deliberately absent: it routes to the fallback handler
//! and never surfaces as an error.

use crate::storage::StorageError;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Delegation target is not in the skill registry. Fatal to that delegation attempt.
    #[error("unknown skill: {0}")]
    UnknownSkill(String),
    /// Reply addressed to a skill conversation id that was never issued or has expired.
    #[error("unknown skill conversation id: {0}")]
    UnknownDelegation(String),
    #[error("planner unavailable: {0}")]
    PlannerUnavailable(String),
    #[error("planner returned a malformed plan: {0}")]
    PlannerMalformed(String),
    #[error("prompt: {0}")]
    Prompt(String),
    #[error("moderation: {0}")]
    Moderation(String),
    #[error("storage: {0}")]
    Storage(#[from] StorageError),
    #[error("skill {skill_id}: {reason}")]
    Skill { skill_id: String, reason: String },
    #[error("channel: {0}")]
    Channel(String),
    #[error("turn failed: {0}")]
    TurnFatal(String),
}

pub type RelayResult<T> = Result<T, RelayError>;

impl RelayError {
    /// True for failures of the remote planning capability.
    pub fn is_planner_failure(&self) -> bool {
        matches!(
            self,
            RelayError::PlannerUnavailable(_) | RelayError::PlannerMalformed(_)
        )
    }
}
