//! Device actions: the lights flag and a cancellable pause.

use super::{argument_str, ActionContext, ActionError, ActionHandler, ActionOutcome};
use crate::state::LIGHTS_ON_FIELD;
use serde_json::{Map, Value};
use std::time::Duration;

/// Pause length when the planner gives no `time`.
pub const DEFAULT_PAUSE_MS: u64 = 1_000;
/// Longest pause a single step may request.
pub const DEFAULT_MAX_PAUSE_MS: u64 = 60_000;

pub struct LightsOn;

#[async_trait::async_trait]
impl ActionHandler for LightsOn {
    fn declared_fields(&self) -> &'static [&'static str] {
        &[LIGHTS_ON_FIELD]
    }

    async fn handle(
        &self,
        ctx: &mut ActionContext<'_>,
        _action: &str,
        _arguments: &Map<String, Value>,
    ) -> Result<ActionOutcome, ActionError> {
        ctx.record.set_lights_on(true);
        ctx.send_text("[lights on]").await?;
        Ok(ActionOutcome::proceed())
    }
}

pub struct LightsOff;

#[async_trait::async_trait]
impl ActionHandler for LightsOff {
    fn declared_fields(&self) -> &'static [&'static str] {
        &[LIGHTS_ON_FIELD]
    }

    async fn handle(
        &self,
        ctx: &mut ActionContext<'_>,
        _action: &str,
        _arguments: &Map<String, Value>,
    ) -> Result<ActionOutcome, ActionError> {
        ctx.record.set_lights_on(false);
        ctx.send_text("[lights off]").await?;
        Ok(ActionOutcome::proceed())
    }
}

/// Announces the pause, then waits `time` milliseconds unless the turn is cancelled.
pub struct Pause {
    max_pause: Duration,
}

impl Pause {
    pub fn new(max_pause_ms: u64) -> Self {
        Self {
            max_pause: Duration::from_millis(max_pause_ms),
        }
    }

    fn requested(&self, arguments: &Map<String, Value>) -> Result<Duration, ActionError> {
        let Some(raw) = argument_str(arguments, "time") else {
            return Ok(Duration::from_millis(DEFAULT_PAUSE_MS));
        };
        let raw = raw.trim();
        // Leading number wins, so "500ms" means 500.
        let ms: f64 = match raw.parse() {
            Ok(ms) => ms,
            Err(_) => {
                let rest = raw.trim_start_matches(|c: char| c.is_ascii_digit());
                let digits = &raw[..raw.len() - rest.len()];
                digits.parse().map_err(|_| ActionError::InvalidArgument {
                    name: "time".into(),
                    reason: format!("not a number: {:?}", raw),
                })?
            }
        };
        if !ms.is_finite() || ms < 0.0 {
            return Err(ActionError::InvalidArgument {
                name: "time".into(),
                reason: format!("out of range: {}", raw),
            });
        }
        Ok(Duration::from_millis(ms as u64).min(self.max_pause))
    }
}

impl Default for Pause {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAUSE_MS)
    }
}

#[async_trait::async_trait]
impl ActionHandler for Pause {
    async fn handle(
        &self,
        ctx: &mut ActionContext<'_>,
        _action: &str,
        arguments: &Map<String, Value>,
    ) -> Result<ActionOutcome, ActionError> {
        let delay = match self.requested(arguments) {
            Ok(delay) => delay,
            Err(e) => {
                ctx.send_text("[can't pause: the requested time is not a number]")
                    .await?;
                return Err(e);
            }
        };
        let seconds = delay.as_millis() as f64 / 1000.0;
        ctx.send_text(format!("[pausing for {} seconds]", seconds))
            .await?;
        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(ActionOutcome::proceed()),
            _ = ctx.cancel.cancelled() => {
                tracing::info!(conversation = %ctx.conversation_key(), "pause cancelled");
                Err(ActionError::Cancelled)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::Activity;
    use crate::channel::BufferedChannel;
    use crate::state::ConversationRecord;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    fn args(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn lights_toggle_flag_and_announce() {
        let channel = BufferedChannel::new();
        let activity = Activity::message("hi");
        let cancel = CancellationToken::new();
        let mut record = ConversationRecord::new("k");
        let mut ctx = ActionContext {
            record: &mut record,
            channel: &channel,
            activity: &activity,
            cancel: &cancel,
        };
        let out = LightsOn.handle(&mut ctx, "LightsOn", &Map::new()).await.unwrap();
        assert!(out.continue_plan);
        assert!(ctx.record.lights_on());
        LightsOff.handle(&mut ctx, "LightsOff", &Map::new()).await.unwrap();
        assert!(!ctx.record.lights_on());
        assert_eq!(channel.texts(), ["[lights on]", "[lights off]"]);
    }

    #[test]
    fn pause_parses_time_argument() {
        let pause = Pause::new(5_000);
        assert_eq!(pause.requested(&Map::new()).unwrap(), Duration::from_millis(1_000));
        assert_eq!(pause.requested(&args(json!({"time": 500}))).unwrap(), Duration::from_millis(500));
        assert_eq!(pause.requested(&args(json!({"time": "250"}))).unwrap(), Duration::from_millis(250));
        assert_eq!(pause.requested(&args(json!({"time": 99_999}))).unwrap(), Duration::from_millis(5_000));
        assert_eq!(pause.requested(&args(json!({"time": "500ms"}))).unwrap(), Duration::from_millis(500));
        assert_eq!(pause.requested(&args(json!({"time": " 2000 ms"}))).unwrap(), Duration::from_millis(2_000));
        assert!(pause.requested(&args(json!({"time": "soon"}))).is_err());
        assert!(pause.requested(&args(json!({"time": -1}))).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn pause_waits_then_continues() {
        let channel = BufferedChannel::new();
        let activity = Activity::message("hi");
        let cancel = CancellationToken::new();
        let mut record = ConversationRecord::new("k");
        let mut ctx = ActionContext {
            record: &mut record,
            channel: &channel,
            activity: &activity,
            cancel: &cancel,
        };
        let started = tokio::time::Instant::now();
        let out = Pause::default()
            .handle(&mut ctx, "Pause", &args(json!({"time": 500})))
            .await
            .unwrap();
        assert!(out.continue_plan);
        assert!(started.elapsed() >= Duration::from_millis(500));
        assert_eq!(channel.texts(), ["[pausing for 0.5 seconds]"]);
    }

    #[tokio::test]
    async fn unusable_pause_time_is_explained() {
        let channel = BufferedChannel::new();
        let activity = Activity::message("hi");
        let cancel = CancellationToken::new();
        let mut record = ConversationRecord::new("k");
        let mut ctx = ActionContext {
            record: &mut record,
            channel: &channel,
            activity: &activity,
            cancel: &cancel,
        };
        let res = Pause::default()
            .handle(&mut ctx, "Pause", &args(json!({"time": "a while"})))
            .await;
        assert!(matches!(res, Err(ActionError::InvalidArgument { .. })));
        assert_eq!(channel.texts(), ["[can't pause: the requested time is not a number]"]);
    }

    #[tokio::test(start_paused = true)]
    async fn pause_aborts_on_cancel() {
        let channel = BufferedChannel::new();
        let activity = Activity::message("hi");
        let cancel = CancellationToken::new();
        let mut record = ConversationRecord::new("k");
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });
        let mut ctx = ActionContext {
            record: &mut record,
            channel: &channel,
            activity: &activity,
            cancel: &cancel,
        };
        let started = tokio::time::Instant::now();
        let res = Pause::default()
            .handle(&mut ctx, "Pause", &args(json!({"time": 10_000})))
            .await;
        assert!(matches!(res, Err(ActionError::Cancelled)));
        assert!(started.elapsed() < Duration::from_millis(10_000));
        assert_eq!(channel.texts(), ["[pausing for 10 seconds]"]);
    }
}
