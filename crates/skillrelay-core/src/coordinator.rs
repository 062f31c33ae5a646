//! Turn coordinator: the per-turn entry point.
//!
//! A user turn either goes to the skill that currently owns the conversation, or
//! through moderation, the planner and the plan executor. Turns on one conversation are
//! serialized; errors are contained here and reported to the user, never raised to the
//! server.

use crate::actions::{ActionContext, FLAGGED_INPUT_ACTION, FLAGGED_OUTPUT_ACTION, SAY_ACTION};
use crate::activity::{Activity, ActivityType};
use crate::channel::Channel;
use crate::delegation::{DelegationHandle, ReplyRouting, SkillDelegationBridge};
use crate::error::{RelayError, RelayResult};
use crate::executor::{ExecutionResult, PlanExecutor};
use crate::moderation::Moderator;
use crate::planner::{Plan, PlanCommand, PlanRequest, Planner};
use crate::state::{ConversationLocks, ConversationRecord, ConversationStateStore};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_PROMPT: &str = "chat";

const ERROR_TRACE_NAME: &str = "OnTurnError Trace";
const ERROR_TRACE_TYPE: &str = "https://www.botframework.com/schemas/error";
const ERROR_TRACE_LABEL: &str = "TurnError";
const ERROR_MESSAGE: &str = "The bot encountered an error or bug.";
const ERROR_HINT: &str = "To continue to run this bot, please fix the bot source code.";

#[derive(Debug)]
pub enum TurnOutcome {
    /// The planner's plan ran (possibly halted or cancelled part way).
    Planned(ExecutionResult),
    /// Input moderation flagged the turn; planning was skipped.
    FlaggedInput(ExecutionResult),
    /// The turn was forwarded to the active skill.
    Delegated(DelegationHandle),
    /// Nothing to do for this activity type.
    Ignored,
    /// The turn failed and the user was told.
    Failed(String),
}

#[derive(Debug)]
pub struct TurnReport {
    pub conversation_key: String,
    pub outcome: TurnOutcome,
}

pub struct TurnCoordinator {
    store: ConversationStateStore,
    locks: ConversationLocks,
    planner: Arc<dyn Planner>,
    moderator: Option<Arc<dyn Moderator>>,
    executor: PlanExecutor,
    bridge: Arc<SkillDelegationBridge>,
    prompt: String,
}

impl TurnCoordinator {
    pub fn new(
        store: ConversationStateStore,
        planner: Arc<dyn Planner>,
        executor: PlanExecutor,
        bridge: Arc<SkillDelegationBridge>,
    ) -> Self {
        Self {
            store,
            locks: ConversationLocks::new(),
            planner,
            moderator: None,
            executor,
            bridge,
            prompt: DEFAULT_PROMPT.to_string(),
        }
    }

    pub fn with_moderator(mut self, moderator: Arc<dyn Moderator>) -> Self {
        self.moderator = Some(moderator);
        self
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }

    pub fn store(&self) -> &ConversationStateStore {
        &self.store
    }

    pub fn bridge(&self) -> &SkillDelegationBridge {
        &self.bridge
    }

    /// Processes one inbound activity. Always returns; failures become
    /// [`TurnOutcome::Failed`] after the user has been notified.
    #[tracing::instrument(skip_all, fields(conversation = %activity.conversation_key()))]
    pub async fn on_turn(
        &self,
        activity: &Activity,
        channel: Arc<dyn Channel>,
        cancel: CancellationToken,
    ) -> TurnReport {
        let conversation_key = activity.conversation_key();
        let outcome = match self
            .run_turn(&conversation_key, activity, channel.as_ref(), &cancel)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(
                    error = %e,
                    activity_id = ?activity.id,
                    activity_type = ?activity.activity_type,
                    "unhandled error during turn"
                );
                self.report_turn_error(channel.as_ref(), &e).await;
                TurnOutcome::Failed(e.to_string())
            }
        };
        TurnReport {
            conversation_key,
            outcome,
        }
    }

    async fn run_turn(
        &self,
        key: &str,
        activity: &Activity,
        channel: &dyn Channel,
        cancel: &CancellationToken,
    ) -> RelayResult<TurnOutcome> {
        let _turn = self.locks.lock(key).await;
        let mut record = self.store.load(key).await?;

        if let Some(skill_id) = record.active_skill().map(str::to_string) {
            if self.episode_is_live(key, &skill_id).await? {
                return self.forward_to_skill(key, &skill_id, activity, &mut record).await;
            }
            tracing::info!(skill = %skill_id, "delegation episode ended, resuming local handling");
            record.set_active_skill(None);
        }

        if !activity.is_message() {
            self.store.save(&mut record).await?;
            return Ok(TurnOutcome::Ignored);
        }

        let input = activity.text_or_empty().to_string();
        let mut ctx = ActionContext {
            record: &mut record,
            channel,
            activity,
            cancel,
        };

        if let Some(moderator) = self.moderator.as_ref().filter(|m| m.mode().reviews_input()) {
            if let crate::moderation::Verdict::Flagged { categories } =
                moderator.review(&input).await?
            {
                tracing::warn!(?categories, "input flagged by moderation");
                let plan = Plan::new(vec![PlanCommand::new(FLAGGED_INPUT_ACTION)
                    .with_argument("categories", categories.join(", "))]);
                let result = self.executor.execute(&plan, &mut ctx).await;
                self.store.save(&mut record).await?;
                return Ok(TurnOutcome::FlaggedInput(result));
            }
        }

        let request = PlanRequest {
            state: ctx.record.snapshot(),
            input,
            prompt: self.prompt.clone(),
        };
        let mut plan = self.planner.generate_plan(&request).await?;
        tracing::debug!(steps = plan.len(), "plan received");

        if let Some(moderator) = self.moderator.as_ref().filter(|m| m.mode().reviews_output()) {
            if self.output_flagged(moderator.as_ref(), &plan).await? {
                tracing::warn!("planner output flagged by moderation");
                plan = Plan::new(vec![PlanCommand::new(FLAGGED_OUTPUT_ACTION)]);
            }
        }

        let result = self.executor.execute(&plan, &mut ctx).await;
        // Fail-forward: whatever the executed steps changed is kept.
        self.store.save(&mut record).await?;
        Ok(TurnOutcome::Planned(result))
    }

    async fn episode_is_live(&self, key: &str, skill_id: &str) -> RelayResult<bool> {
        Ok(self
            .bridge
            .identities()
            .live_skill_conversation_id(key, skill_id)
            .await?
            .is_some())
    }

    async fn forward_to_skill(
        &self,
        key: &str,
        skill_id: &str,
        activity: &Activity,
        record: &mut ConversationRecord,
    ) -> RelayResult<TurnOutcome> {
        match self.bridge.delegate(key, skill_id, activity).await {
            Ok(handle) => {
                if activity.activity_type == ActivityType::EndOfConversation {
                    // The user ended the conversation; the skill was told, control returns.
                    record.set_active_skill(None);
                    self.bridge
                        .end_delegation(&handle.skill_conversation_id)
                        .await?;
                    self.store.save(record).await?;
                }
                Ok(TurnOutcome::Delegated(handle))
            }
            Err(e) => {
                record.set_active_skill(None);
                self.store.save(record).await?;
                Err(e)
            }
        }
    }

    async fn output_flagged(&self, moderator: &dyn Moderator, plan: &Plan) -> RelayResult<bool> {
        for command in plan.commands.iter().filter(|c| c.action == SAY_ACTION) {
            let Some(text) = command.arguments.get("response").and_then(|v| v.as_str()) else {
                continue;
            };
            if moderator.review(text).await?.is_flagged() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn report_turn_error(&self, channel: &dyn Channel, error: &RelayError) {
        let trace = Activity::trace(
            ERROR_TRACE_NAME,
            serde_json::Value::String(error.to_string()),
            ERROR_TRACE_TYPE,
            ERROR_TRACE_LABEL,
        );
        for activity in [
            trace,
            Activity::message(ERROR_MESSAGE),
            Activity::message(ERROR_HINT),
        ] {
            if let Err(e) = channel.send_activity(activity).await {
                tracing::error!(error = %e, "failed to report turn error to user");
                return;
            }
        }
    }

    /// Handles an activity a skill posted to the callback endpoint. Unknown skill
    /// conversation ids, and ids the authenticated `caller` does not own, fail with
    /// [`RelayError::UnknownDelegation`] and produce no output.
    #[tracing::instrument(skip(self, activity))]
    pub async fn on_skill_activity(
        &self,
        skill_conversation_id: &str,
        caller: Option<&str>,
        reply_to_id: Option<String>,
        activity: Activity,
    ) -> RelayResult<ReplyRouting> {
        let routing = self
            .bridge
            .route_reply(skill_conversation_id, caller, reply_to_id, activity)
            .await?;
        if let ReplyRouting::EndOfConversation { mapping, activity } = &routing {
            let key = mapping.conversation_key();
            self.bridge.end_delegation(skill_conversation_id).await?;
            // A turn in flight on this conversation may be waiting on the skill; the
            // next turn clears the field instead once it sees the episode is gone.
            if let Some(_turn) = self.locks.try_lock(&key) {
                let mut record = self.store.load(&key).await?;
                if record.active_skill() == Some(mapping.skill_id.as_str()) {
                    record.set_active_skill(None);
                    self.store.save(&mut record).await?;
                }
            }
            let notice = format!(
                "Received endOfConversation.\n\nCode: {}",
                activity.code.as_deref().unwrap_or("unknown")
            );
            self.bridge
                .channel_for(mapping)
                .send_activity(Activity::message(notice))
                .await?;
            tracing::info!(skill = %mapping.skill_id, conversation = %key, "skill ended conversation");
        }
        Ok(routing)
    }
}
