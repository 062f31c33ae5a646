//! Shared fixtures for the integration tests: a scripted planner, a recording skill
//! client and a channel factory that captures proactive sends.

#![allow(dead_code)]

use serde_json::{Map, Value};
use skillrelay_core::actions::{ActionContext, ActionError, ActionHandler, ActionOutcome};
use skillrelay_core::{
    Activity, ActionRegistry, BufferedChannel, CallSkillBots, Channel, ChannelFactory,
    ConversationAccount, ConversationIdFactory, ConversationReference, ConversationStateStore,
    InvokeResponse, LightsOff, LightsOn, MemoryStorage, ModerationMode, Moderator, Pause, Plan,
    PlanExecutor, PlanRequest, Planner, RelayError, RelayResult, SkillClient, SkillDelegationBridge,
    SkillDescriptor, SkillRegistry, TurnCoordinator, Verdict,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use url::Url;

pub const SKILL_ID: &str = "EchoSkillBot";
pub const SKILL_APP_ID: &str = "echo-skill-app";

/// Planner that replays queued plans, then repeats the last one.
pub struct ScriptedPlanner {
    plans: Mutex<VecDeque<RelayResult<Plan>>>,
    last: Mutex<Option<Plan>>,
    delay: Duration,
    pub calls: AtomicUsize,
    pub requests: Mutex<Vec<PlanRequest>>,
}

impl ScriptedPlanner {
    pub fn new(plans: Vec<Plan>) -> Self {
        Self::with_results(plans.into_iter().map(Ok).collect())
    }

    pub fn with_results(plans: Vec<RelayResult<Plan>>) -> Self {
        Self {
            plans: Mutex::new(plans.into()),
            last: Mutex::new(None),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Planner for ScriptedPlanner {
    async fn generate_plan(&self, request: &PlanRequest) -> RelayResult<Plan> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let next = self.plans.lock().unwrap().pop_front();
        match next {
            Some(Ok(plan)) => {
                *self.last.lock().unwrap() = Some(plan.clone());
                Ok(plan)
            }
            Some(Err(e)) => Err(e),
            None => Ok(self.last.lock().unwrap().clone().unwrap_or_default()),
        }
    }
}

/// Moderator that flags any text containing one of its words.
pub struct WordModerator {
    pub words: Vec<String>,
    pub mode: ModerationMode,
}

#[async_trait::async_trait]
impl Moderator for WordModerator {
    fn mode(&self) -> ModerationMode {
        self.mode
    }

    async fn review(&self, text: &str) -> RelayResult<Verdict> {
        if self.words.iter().any(|w| text.contains(w.as_str())) {
            Ok(Verdict::Flagged {
                categories: vec!["test".into()],
            })
        } else {
            Ok(Verdict::Pass)
        }
    }
}

#[derive(Default)]
pub struct RecordingSkillClient {
    pub posted: Mutex<Vec<(String, Activity)>>,
    pub fail: bool,
}

impl RecordingSkillClient {
    pub fn count(&self) -> usize {
        self.posted.lock().unwrap().len()
    }

    pub fn last(&self) -> Option<Activity> {
        self.posted.lock().unwrap().last().map(|(_, a)| a.clone())
    }
}

#[async_trait::async_trait]
impl SkillClient for RecordingSkillClient {
    async fn post_activity(
        &self,
        skill: &SkillDescriptor,
        activity: &Activity,
    ) -> RelayResult<InvokeResponse> {
        self.posted
            .lock()
            .unwrap()
            .push((skill.id.clone(), activity.clone()));
        if self.fail {
            return Err(RelayError::Skill {
                skill_id: skill.id.clone(),
                reason: "connection refused".into(),
            });
        }
        Ok(InvokeResponse {
            status: 200,
            body: None,
        })
    }
}

/// Proactive sends all land in one buffer.
pub struct CapturingFactory(pub Arc<BufferedChannel>);

impl ChannelFactory for CapturingFactory {
    fn for_reference(&self, _reference: &ConversationReference) -> Arc<dyn Channel> {
        self.0.clone()
    }
}

/// Adds 1 to the `counter` field. Reads then writes, with a yield in between.
pub struct Increment;

#[async_trait::async_trait]
impl ActionHandler for Increment {
    fn declared_fields(&self) -> &'static [&'static str] {
        &["counter"]
    }

    async fn handle(
        &self,
        ctx: &mut ActionContext<'_>,
        _action: &str,
        _arguments: &Map<String, Value>,
    ) -> Result<ActionOutcome, ActionError> {
        let current = ctx.record.get_i64("counter").unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(10)).await;
        ctx.record.set("counter", current + 1);
        Ok(ActionOutcome::proceed())
    }
}

pub struct Harness {
    pub coordinator: TurnCoordinator,
    pub planner: Arc<ScriptedPlanner>,
    pub skills: Arc<RecordingSkillClient>,
    pub proactive: Arc<BufferedChannel>,
    pub store: ConversationStateStore,
}

pub fn registry() -> SkillRegistry {
    SkillRegistry::new(Url::parse("http://localhost:3978/api/skills").unwrap()).with_skill(
        SkillDescriptor {
            id: SKILL_ID.into(),
            app_id: SKILL_APP_ID.into(),
            skill_endpoint: Url::parse("http://localhost:39783/api/messages").unwrap(),
        },
    )
}

pub fn harness(planner: ScriptedPlanner) -> Harness {
    harness_with(planner, RecordingSkillClient::default(), SKILL_ID, None)
}

pub fn harness_with(
    planner: ScriptedPlanner,
    skills: RecordingSkillClient,
    default_skill: &str,
    moderator: Option<Arc<dyn Moderator>>,
) -> Harness {
    let storage = Arc::new(MemoryStorage::new());
    let store = ConversationStateStore::new(storage.clone());
    let skills = Arc::new(skills);
    let proactive = Arc::new(BufferedChannel::new());
    let bridge = Arc::new(SkillDelegationBridge::new(
        Arc::new(registry()),
        Arc::new(ConversationIdFactory::new(storage)),
        skills.clone(),
        Arc::new(CapturingFactory(proactive.clone())),
    ));
    let actions = ActionRegistry::new()
        .with("LightsOn", Arc::new(LightsOn))
        .with("LightsOff", Arc::new(LightsOff))
        .with("Pause", Arc::new(Pause::default()))
        .with("Increment", Arc::new(Increment))
        .with(
            "CallSkillBots",
            Arc::new(CallSkillBots::new(bridge.clone(), default_skill)),
        );
    let planner = Arc::new(planner);
    let mut coordinator = TurnCoordinator::new(
        store.clone(),
        planner.clone(),
        PlanExecutor::new(Arc::new(actions)),
        bridge,
    );
    if let Some(m) = moderator {
        coordinator = coordinator.with_moderator(m);
    }
    Harness {
        coordinator,
        planner,
        skills,
        proactive,
        store,
    }
}

pub fn user_message(conversation: &str, text: &str) -> Activity {
    let mut a = Activity::message(text);
    a.id = Some(format!("{}-{}", conversation, text.len()));
    a.channel_id = "test".into();
    a.service_url = "http://connector.test".into();
    a.conversation = ConversationAccount {
        id: conversation.into(),
        ..Default::default()
    };
    a
}

pub fn key(conversation: &str) -> String {
    format!("test/conversations/{}", conversation)
}
