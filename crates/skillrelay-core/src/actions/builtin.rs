use super::{argument_str, ActionContext, ActionError, ActionHandler, ActionOutcome};
use serde_json::{Map, Value};

pub struct Say;

#[async_trait::async_trait]
impl ActionHandler for Say {
    async fn handle(
        &self,
        ctx: &mut ActionContext<'_>,
        _action: &str,
        arguments: &Map<String, Value>,
    ) -> Result<ActionOutcome, ActionError> {
        let response = argument_str(arguments, "response").unwrap_or_default();
        if response.trim().is_empty() {
            return Ok(ActionOutcome::proceed().with_side_effects(false));
        }
        ctx.send_text(response).await?;
        Ok(ActionOutcome::proceed())
    }
}

pub struct FlaggedInput;

#[async_trait::async_trait]
impl ActionHandler for FlaggedInput {
    async fn handle(
        &self,
        ctx: &mut ActionContext<'_>,
        _action: &str,
        arguments: &Map<String, Value>,
    ) -> Result<ActionOutcome, ActionError> {
        let mut text = String::from(
            "I'm sorry, your message was flagged for violating the content policy.",
        );
        if let Some(categories) = argument_str(arguments, "categories").filter(|c| !c.is_empty()) {
            text.push_str(&format!(" Reason: {}.", categories));
        }
        ctx.send_text(text).await?;
        Ok(ActionOutcome::halt())
    }
}

pub struct FlaggedOutput;

#[async_trait::async_trait]
impl ActionHandler for FlaggedOutput {
    async fn handle(
        &self,
        ctx: &mut ActionContext<'_>,
        _action: &str,
        _arguments: &Map<String, Value>,
    ) -> Result<ActionOutcome, ActionError> {
        ctx.send_text("I'm not allowed to talk about such things.").await?;
        Ok(ActionOutcome::halt())
    }
}

/// Default fallback: tells the user the action is not supported and halts the plan.
pub struct UnknownAction;

#[async_trait::async_trait]
impl ActionHandler for UnknownAction {
    async fn handle(
        &self,
        ctx: &mut ActionContext<'_>,
        action: &str,
        _arguments: &Map<String, Value>,
    ) -> Result<ActionOutcome, ActionError> {
        tracing::warn!(
            conversation = %ctx.conversation_key(),
            action = %action,
            "planner chose an unregistered action"
        );
        ctx.send_text(format!("I don't know how to do '{}'.", action))
            .await?;
        Ok(ActionOutcome::halt())
    }
}
