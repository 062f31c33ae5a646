//! skillrelay core library.
//!
//! Turns free-text user turns into planner-chosen actions and bridges delegated
//! sub-conversations to remote skill bots. The gateway crate is a thin HTTP shell
//! around [`TurnCoordinator`].

pub mod actions;
pub mod activity;
pub mod channel;
pub mod config;
pub mod coordinator;
pub mod delegation;
pub mod error;
pub mod executor;
pub mod identity;
pub mod moderation;
pub mod planner;
pub mod prompts;
pub mod skills;
pub mod state;
pub mod storage;

pub use actions::{
    ActionContext, ActionError, ActionHandler, ActionOutcome, ActionRegistry, CallSkillBots,
    LightsOff, LightsOn, Pause, FLAGGED_INPUT_ACTION, FLAGGED_OUTPUT_ACTION, SAY_ACTION,
};
pub use activity::{
    Activity, ActivityType, ChannelAccount, ConversationAccount, ConversationReference,
    DeliveryMode,
};
pub use channel::{BufferedChannel, Channel, ChannelFactory, ConnectorChannelFactory, ResourceResponse};
pub use config::{RelayConfig, RelayConfigError};
pub use coordinator::{TurnCoordinator, TurnOutcome, TurnReport};
pub use delegation::{
    DelegationHandle, HttpSkillClient, InvokeResponse, ReplyRouting, SkillClient,
    SkillDelegationBridge,
};
pub use error::{RelayError, RelayResult};
pub use executor::{ExecutionResult, PlanExecutor};
pub use identity::{ConversationIdFactory, SkillConversationMapping};
pub use moderation::{ModerationMode, Moderator, OpenAiModerator, Verdict};
pub use planner::{OpenAiPlanner, Plan, PlanCommand, PlanRequest, Planner, PlannerBackend};
pub use prompts::{CompletionSettings, PromptManager, PromptTemplate};
pub use skills::{SkillDescriptor, SkillRegistry};
pub use state::{ConversationLocks, ConversationRecord, ConversationStateStore};
pub use storage::{MemoryStorage, SledStorage, Storage, StorageError, StoreItem, WriteCondition};

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
