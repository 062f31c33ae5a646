use super::{argument_str, ActionContext, ActionError, ActionHandler, ActionOutcome};
use crate::delegation::SkillDelegationBridge;
use crate::state::{ACTIVE_SKILL_FIELD, LIGHTS_ON_FIELD};
use serde_json::{Map, Value};
use std::sync::Arc;

/// Hands the conversation to a skill bot. The skill is the configured default unless
/// the planner names one in a `skill` argument.
pub struct CallSkillBots {
    bridge: Arc<SkillDelegationBridge>,
    default_skill: String,
}

impl CallSkillBots {
    pub fn new(bridge: Arc<SkillDelegationBridge>, default_skill: impl Into<String>) -> Self {
        Self {
            bridge,
            default_skill: default_skill.into(),
        }
    }
}

#[async_trait::async_trait]
impl ActionHandler for CallSkillBots {
    fn declared_fields(&self) -> &'static [&'static str] {
        &[LIGHTS_ON_FIELD, ACTIVE_SKILL_FIELD]
    }

    async fn handle(
        &self,
        ctx: &mut ActionContext<'_>,
        _action: &str,
        arguments: &Map<String, Value>,
    ) -> Result<ActionOutcome, ActionError> {
        let skill_id =
            argument_str(arguments, "skill").unwrap_or_else(|| self.default_skill.clone());

        ctx.record.set_lights_on(false);
        ctx.send_text("[call skill bots]").await?;
        ctx.record.set_active_skill(Some(&skill_id));

        let key = ctx.conversation_key();
        match self.bridge.delegate(&key, &skill_id, ctx.activity).await {
            Ok(handle) => {
                tracing::info!(
                    conversation = %key,
                    skill = %handle.skill_id,
                    "conversation delegated"
                );
                Ok(ActionOutcome::proceed())
            }
            Err(e) => {
                ctx.record.set_active_skill(None);
                ctx.send_text(format!("Sorry, the skill '{}' is not available.", skill_id))
                    .await?;
                Err(ActionError::Relay(e))
            }
        }
    }
}
