//! Outbound channel: where a turn's activities go.
//!
//! [`ConnectorChannel`] posts to the channel connector named by the conversation's
//! `serviceUrl`. [`BufferedChannel`] keeps activities in memory; the gateway uses it for
//! `expectReplies` turns and tests use it to observe output.

use crate::activity::{Activity, ConversationReference};
use crate::error::RelayError;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const CONNECTOR_TIMEOUT: Duration = Duration::from_secs(30);

/// Connector acknowledgement for a sent activity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceResponse {
    #[serde(default)]
    pub id: String,
}

#[async_trait::async_trait]
pub trait Channel: Send + Sync {
    async fn send_activity(&self, activity: Activity) -> Result<ResourceResponse, RelayError>;
}

/// Builds a channel addressed to a conversation. Used for proactive sends such as
/// re-emitting skill replies into the original conversation.
pub trait ChannelFactory: Send + Sync {
    fn for_reference(&self, reference: &ConversationReference) -> Arc<dyn Channel>;
}

pub struct ConnectorChannel {
    client: reqwest::Client,
    token: Option<String>,
    reference: ConversationReference,
}

impl ConnectorChannel {
    fn activities_url(&self, activity: &Activity) -> String {
        let base = self.reference.service_url.trim_end_matches('/');
        let conversation = &self.reference.conversation.id;
        match activity.reply_to_id.as_deref() {
            Some(reply_to) => format!(
                "{}/v3/conversations/{}/activities/{}",
                base, conversation, reply_to
            ),
            None => format!("{}/v3/conversations/{}/activities", base, conversation),
        }
    }
}

#[async_trait::async_trait]
impl Channel for ConnectorChannel {
    async fn send_activity(&self, activity: Activity) -> Result<ResourceResponse, RelayError> {
        let activity = activity.apply_conversation_reference(&self.reference);
        let url = self.activities_url(&activity);
        let mut req = self.client.post(&url).json(&activity);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        let res = req
            .send()
            .await
            .map_err(|e| RelayError::Channel(format!("POST {}: {}", url, e)))?;
        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(RelayError::Channel(format!(
                "connector returned {}: {}",
                status,
                body.chars().take(200).collect::<String>()
            )));
        }
        // Some connectors answer 200 with an empty body.
        let text = res.text().await.unwrap_or_default();
        Ok(serde_json::from_str(&text).unwrap_or_default())
    }
}

pub struct ConnectorChannelFactory {
    client: reqwest::Client,
    token: Option<String>,
}

impl ConnectorChannelFactory {
    pub fn new(token: Option<String>) -> Result<Self, RelayError> {
        let client = reqwest::Client::builder()
            .timeout(CONNECTOR_TIMEOUT)
            .build()
            .map_err(|e| RelayError::Channel(e.to_string()))?;
        Ok(Self {
            client,
            token: token.filter(|t| !t.is_empty()),
        })
    }
}

impl ChannelFactory for ConnectorChannelFactory {
    fn for_reference(&self, reference: &ConversationReference) -> Arc<dyn Channel> {
        Arc::new(ConnectorChannel {
            client: self.client.clone(),
            token: self.token.clone(),
            reference: reference.clone(),
        })
    }
}

/// In-memory channel. Activities are addressed with the reference when one is given.
#[derive(Default)]
pub struct BufferedChannel {
    reference: Option<ConversationReference>,
    sent: Mutex<Vec<Activity>>,
}

impl BufferedChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn addressed_to(reference: ConversationReference) -> Self {
        Self {
            reference: Some(reference),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Activities sent so far, in send order.
    pub fn activities(&self) -> Vec<Activity> {
        self.sent.lock().map(|v| v.clone()).unwrap_or_default()
    }

    /// Texts of the message activities sent so far.
    pub fn texts(&self) -> Vec<String> {
        self.activities()
            .into_iter()
            .filter(|a| a.is_message())
            .map(|a| a.text.unwrap_or_default())
            .collect()
    }

    pub fn take(&self) -> Vec<Activity> {
        self.sent
            .lock()
            .map(|mut v| std::mem::take(&mut *v))
            .unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl Channel for BufferedChannel {
    async fn send_activity(&self, activity: Activity) -> Result<ResourceResponse, RelayError> {
        let mut activity = match &self.reference {
            Some(r) => activity.apply_conversation_reference(r),
            None => activity,
        };
        let id = uuid::Uuid::new_v4().to_string();
        if activity.id.is_none() {
            activity.id = Some(id.clone());
        }
        let mut sent = self
            .sent
            .lock()
            .map_err(|_| RelayError::Channel("buffer poisoned".into()))?;
        sent.push(activity);
        Ok(ResourceResponse { id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::{ChannelAccount, ConversationAccount};

    fn reference() -> ConversationReference {
        ConversationReference {
            activity_id: Some("act-9".into()),
            user: Some(ChannelAccount {
                id: "user".into(),
                ..Default::default()
            }),
            bot: Some(ChannelAccount {
                id: "bot".into(),
                ..Default::default()
            }),
            conversation: ConversationAccount {
                id: "conv".into(),
                ..Default::default()
            },
            channel_id: "test".into(),
            service_url: "https://connector.example/".into(),
            locale: None,
        }
    }

    #[tokio::test]
    async fn buffered_channel_keeps_send_order() {
        let channel = BufferedChannel::new();
        channel.send_activity(Activity::message("one")).await.unwrap();
        channel.send_activity(Activity::message("two")).await.unwrap();
        assert_eq!(channel.texts(), ["one", "two"]);
        assert_eq!(channel.take().len(), 2);
        assert!(channel.activities().is_empty());
    }

    #[tokio::test]
    async fn buffered_channel_addresses_activities() {
        let channel = BufferedChannel::addressed_to(reference());
        channel.send_activity(Activity::message("hi")).await.unwrap();
        let sent = channel.activities();
        assert_eq!(sent[0].conversation.id, "conv");
        assert_eq!(sent[0].recipient.as_ref().unwrap().id, "user");
    }

    #[test]
    fn connector_url_threads_replies() {
        let factory = ConnectorChannelFactory::new(None).unwrap();
        let channel = ConnectorChannel {
            client: factory.client.clone(),
            token: None,
            reference: reference(),
        };
        let reply = Activity::message("x").apply_conversation_reference(&reference());
        assert_eq!(
            channel.activities_url(&reply),
            "https://connector.example/v3/conversations/conv/activities/act-9"
        );
        let mut proactive = Activity::message("y");
        proactive.reply_to_id = None;
        assert_eq!(
            channel.activities_url(&proactive),
            "https://connector.example/v3/conversations/conv/activities"
        );
    }
}
