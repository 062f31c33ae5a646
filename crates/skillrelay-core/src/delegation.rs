//! Skill delegation bridge.
//!
//! Outbound: forwards a turn to a registered skill under a skill conversation id, with
//! the host callback endpoint as `serviceUrl` so the skill knows where to reply.
//! Inbound: resolves a skill conversation id back to the original conversation and
//! re-emits the skill's activity there. Unknown ids are rejected outright; nothing is
//! forwarded for them.
//!
//! Sends to skills are at-most-once. A failed send is reported, never retried.

use crate::activity::{Activity, ActivityType, ChannelAccount};
use crate::channel::{Channel, ChannelFactory, ResourceResponse};
use crate::error::{RelayError, RelayResult};
use crate::identity::{ConversationIdFactory, SkillConversationMapping};
use crate::skills::{SkillDescriptor, SkillRegistry};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

const SKILL_TIMEOUT: Duration = Duration::from_secs(30);

/// Status and body of a skill's HTTP answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvokeResponse {
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
}

#[async_trait::async_trait]
pub trait SkillClient: Send + Sync {
    async fn post_activity(
        &self,
        skill: &SkillDescriptor,
        activity: &Activity,
    ) -> RelayResult<InvokeResponse>;
}

/// Posts activities to a skill's messaging endpoint over HTTP.
pub struct HttpSkillClient {
    client: reqwest::Client,
    token: Option<String>,
}

impl HttpSkillClient {
    pub fn new(token: Option<String>) -> RelayResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(SKILL_TIMEOUT)
            .build()
            .map_err(|e| RelayError::Channel(e.to_string()))?;
        Ok(Self {
            client,
            token: token.filter(|t| !t.is_empty()),
        })
    }
}

#[async_trait::async_trait]
impl SkillClient for HttpSkillClient {
    async fn post_activity(
        &self,
        skill: &SkillDescriptor,
        activity: &Activity,
    ) -> RelayResult<InvokeResponse> {
        let mut req = self
            .client
            .post(skill.skill_endpoint.clone())
            .json(activity);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        let res = req.send().await.map_err(|e| RelayError::Skill {
            skill_id: skill.id.clone(),
            reason: e.to_string(),
        })?;
        let status = res.status();
        let text = res.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(RelayError::Skill {
                skill_id: skill.id.clone(),
                reason: format!(
                    "returned {}: {}",
                    status,
                    text.chars().take(200).collect::<String>()
                ),
            });
        }
        Ok(InvokeResponse {
            status: status.as_u16(),
            body: serde_json::from_str(&text).ok(),
        })
    }
}

/// Result of a successful forward.
#[derive(Debug, Clone, PartialEq)]
pub struct DelegationHandle {
    pub skill_id: String,
    pub skill_conversation_id: String,
    pub status: u16,
}

/// What happened to an inbound skill activity.
#[derive(Debug)]
pub enum ReplyRouting {
    /// Re-emitted into the original conversation.
    Forwarded {
        mapping: SkillConversationMapping,
        resource: ResourceResponse,
    },
    /// The skill ended its conversation; the caller decides how to wrap up.
    EndOfConversation {
        mapping: SkillConversationMapping,
        activity: Activity,
    },
}

pub struct SkillDelegationBridge {
    registry: Arc<SkillRegistry>,
    identities: Arc<ConversationIdFactory>,
    client: Arc<dyn SkillClient>,
    channels: Arc<dyn ChannelFactory>,
}

impl SkillDelegationBridge {
    pub fn new(
        registry: Arc<SkillRegistry>,
        identities: Arc<ConversationIdFactory>,
        client: Arc<dyn SkillClient>,
        channels: Arc<dyn ChannelFactory>,
    ) -> Self {
        Self {
            registry,
            identities,
            client,
            channels,
        }
    }

    pub fn registry(&self) -> &SkillRegistry {
        &self.registry
    }

    pub fn identities(&self) -> &ConversationIdFactory {
        &self.identities
    }

    /// Forwards `activity` to `skill_id` on behalf of `conversation_key`.
    #[tracing::instrument(skip(self, activity), fields(activity_type = ?activity.activity_type))]
    pub async fn delegate(
        &self,
        conversation_key: &str,
        skill_id: &str,
        activity: &Activity,
    ) -> RelayResult<DelegationHandle> {
        let skill = self
            .registry
            .get(skill_id)
            .ok_or_else(|| RelayError::UnknownSkill(skill_id.to_string()))?;

        let reference = activity.get_conversation_reference();
        if reference.conversation_key() != conversation_key {
            tracing::warn!(
                activity_key = %reference.conversation_key(),
                "delegated activity belongs to a different conversation"
            );
        }
        let skill_conversation_id = self
            .identities
            .create_skill_conversation_id(&reference, skill_id)
            .await?;

        let mut outbound = activity.clone();
        outbound.conversation.id = skill_conversation_id.clone();
        outbound.service_url = self.registry.host_endpoint().to_string();
        outbound.recipient = Some(ChannelAccount {
            id: skill.app_id.clone(),
            role: Some("skill".into()),
            ..Default::default()
        });
        outbound.relates_to = Some(reference);

        let response = self.client.post_activity(skill, &outbound).await?;
        tracing::info!(
            skill = %skill_id,
            status = response.status,
            "turn forwarded to skill"
        );
        Ok(DelegationHandle {
            skill_id: skill_id.to_string(),
            skill_conversation_id,
            status: response.status,
        })
    }

    /// Routes an activity a skill posted to the host callback endpoint. `caller` is the
    /// authenticated app id, `None` for anonymous callers; an authenticated caller must
    /// be the skill the id was issued for.
    #[tracing::instrument(skip(self, activity))]
    pub async fn route_reply(
        &self,
        skill_conversation_id: &str,
        caller: Option<&str>,
        reply_to_id: Option<String>,
        mut activity: Activity,
    ) -> RelayResult<ReplyRouting> {
        let Some(mapping) = self
            .identities
            .get_conversation_reference(skill_conversation_id)
            .await?
        else {
            tracing::warn!("rejected skill activity for unknown skill conversation id");
            return Err(RelayError::UnknownDelegation(
                skill_conversation_id.to_string(),
            ));
        };

        if let Some(caller) = caller {
            let owner = self.registry.get(&mapping.skill_id).map(|s| s.app_id.as_str());
            if owner != Some(caller) {
                tracing::warn!(
                    caller = %caller,
                    skill = %mapping.skill_id,
                    "rejected skill activity from a caller that does not own the conversation"
                );
                return Err(RelayError::UnknownDelegation(
                    skill_conversation_id.to_string(),
                ));
            }
        }

        if activity.activity_type == ActivityType::EndOfConversation {
            return Ok(ReplyRouting::EndOfConversation { mapping, activity });
        }

        activity.id = None;
        activity.reply_to_id = reply_to_id;
        activity.relates_to = None;
        let channel = self.channel_for(&mapping);
        let resource = channel.send_activity(activity).await?;
        tracing::debug!(
            skill = %mapping.skill_id,
            conversation = %mapping.conversation_key(),
            "skill reply forwarded"
        );
        Ok(ReplyRouting::Forwarded { mapping, resource })
    }

    /// Ends the delegation episode behind `skill_conversation_id`.
    pub async fn end_delegation(&self, skill_conversation_id: &str) -> RelayResult<()> {
        self.identities
            .delete_conversation_reference(skill_conversation_id)
            .await?;
        Ok(())
    }

    /// Channel addressed to the conversation a mapping points back to.
    pub fn channel_for(&self, mapping: &SkillConversationMapping) -> Arc<dyn Channel> {
        self.channels.for_reference(&mapping.conversation_reference)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::{ConversationAccount, ConversationReference};
    use crate::channel::BufferedChannel;
    use crate::storage::MemoryStorage;
    use std::sync::Mutex;
    use url::Url;

    #[derive(Default)]
    struct RecordingClient {
        posted: Mutex<Vec<(String, Activity)>>,
    }

    #[async_trait::async_trait]
    impl SkillClient for RecordingClient {
        async fn post_activity(
            &self,
            skill: &SkillDescriptor,
            activity: &Activity,
        ) -> RelayResult<InvokeResponse> {
            self.posted
                .lock()
                .unwrap()
                .push((skill.id.clone(), activity.clone()));
            Ok(InvokeResponse {
                status: 200,
                body: None,
            })
        }
    }

    struct SharedChannelFactory(Arc<BufferedChannel>);

    impl ChannelFactory for SharedChannelFactory {
        fn for_reference(&self, _reference: &ConversationReference) -> Arc<dyn Channel> {
            self.0.clone()
        }
    }

    fn bridge() -> (SkillDelegationBridge, Arc<RecordingClient>, Arc<BufferedChannel>) {
        let registry = SkillRegistry::new(Url::parse("http://host:3978/api/skills").unwrap())
            .with_skill(SkillDescriptor {
                id: "EchoSkillBot".into(),
                app_id: "echo-app".into(),
                skill_endpoint: Url::parse("http://echo:39783/api/messages").unwrap(),
            });
        let client = Arc::new(RecordingClient::default());
        let out = Arc::new(BufferedChannel::new());
        let bridge = SkillDelegationBridge::new(
            Arc::new(registry),
            Arc::new(ConversationIdFactory::new(Arc::new(MemoryStorage::new()))),
            client.clone(),
            Arc::new(SharedChannelFactory(out.clone())),
        );
        (bridge, client, out)
    }

    fn user_turn() -> Activity {
        let mut a = Activity::message("hello skill");
        a.channel_id = "test".into();
        a.service_url = "http://connector".into();
        a.conversation = ConversationAccount {
            id: "conv-1".into(),
            ..Default::default()
        };
        a
    }

    #[tokio::test]
    async fn delegate_rewrites_conversation_and_callback() {
        let (bridge, client, _) = bridge();
        let turn = user_turn();
        let handle = bridge
            .delegate(&turn.conversation_key(), "EchoSkillBot", &turn)
            .await
            .unwrap();

        let posted = client.posted.lock().unwrap();
        assert_eq!(posted.len(), 1);
        let (skill, sent) = &posted[0];
        assert_eq!(skill, "EchoSkillBot");
        assert_eq!(sent.conversation.id, handle.skill_conversation_id);
        assert_eq!(sent.service_url, "http://host:3978/api/skills");
        assert_eq!(sent.relates_to.as_ref().unwrap().conversation.id, "conv-1");
        assert_eq!(sent.text_or_empty(), "hello skill");
    }

    #[tokio::test]
    async fn unknown_skill_makes_no_call() {
        let (bridge, client, _) = bridge();
        let turn = user_turn();
        let err = bridge
            .delegate(&turn.conversation_key(), "Nope", &turn)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::UnknownSkill(ref s) if s == "Nope"));
        assert!(client.posted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn reply_is_routed_back_to_source_conversation() {
        let (bridge, _, out) = bridge();
        let turn = user_turn();
        let handle = bridge
            .delegate(&turn.conversation_key(), "EchoSkillBot", &turn)
            .await
            .unwrap();

        let routed = bridge
            .route_reply(&handle.skill_conversation_id, None, None, Activity::message("echo: hello"))
            .await
            .unwrap();
        match routed {
            ReplyRouting::Forwarded { mapping, .. } => {
                assert_eq!(mapping.conversation_key(), turn.conversation_key())
            }
            other => panic!("unexpected routing {:?}", other),
        }
        assert_eq!(out.texts(), ["echo: hello"]);
    }

    #[tokio::test]
    async fn forged_id_is_rejected_without_output() {
        let (bridge, _, out) = bridge();
        let err = bridge
            .route_reply("never-issued", None, None, Activity::message("spoof"))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::UnknownDelegation(_)));
        assert!(out.activities().is_empty());
    }

    #[tokio::test]
    async fn reply_from_another_skill_is_rejected() {
        let (bridge, _, out) = bridge();
        let turn = user_turn();
        let handle = bridge
            .delegate(&turn.conversation_key(), "EchoSkillBot", &turn)
            .await
            .unwrap();

        let err = bridge
            .route_reply(
                &handle.skill_conversation_id,
                Some("calc-app"),
                None,
                Activity::message("not yours"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::UnknownDelegation(_)));
        assert!(out.activities().is_empty());

        bridge
            .route_reply(
                &handle.skill_conversation_id,
                Some("echo-app"),
                Some("a1".into()),
                Activity::message("echo: hello"),
            )
            .await
            .unwrap();
        assert_eq!(out.texts(), ["echo: hello"]);
    }

    #[tokio::test]
    async fn end_of_conversation_is_not_forwarded() {
        let (bridge, _, out) = bridge();
        let turn = user_turn();
        let handle = bridge
            .delegate(&turn.conversation_key(), "EchoSkillBot", &turn)
            .await
            .unwrap();
        let routed = bridge
            .route_reply(
                &handle.skill_conversation_id,
                Some("echo-app"),
                None,
                Activity::end_of_conversation("completedSuccessfully"),
            )
            .await
            .unwrap();
        assert!(matches!(routed, ReplyRouting::EndOfConversation { .. }));
        assert!(out.activities().is_empty());

        bridge.end_delegation(&handle.skill_conversation_id).await.unwrap();
        assert!(bridge
            .identities()
            .get_conversation_reference(&handle.skill_conversation_id)
            .await
            .unwrap()
            .is_none());
    }
}
