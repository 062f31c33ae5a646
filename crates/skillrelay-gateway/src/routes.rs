//! HTTP routes: channel messages in, skill callbacks in, health.

use crate::auth::{ChannelAuthenticator, ClaimsIdentity};
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use skillrelay_core::{
    Activity, BufferedChannel, Channel, ChannelFactory, RelayError, ReplyRouting,
    ResourceResponse, TurnCoordinator, TurnOutcome,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<TurnCoordinator>,
    pub channels: Arc<dyn ChannelFactory>,
    pub auth: Arc<dyn ChannelAuthenticator>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/messages", post(messages_handler))
        .route(
            "/api/skills/v3/conversations/:conversation_id/activities",
            post(send_to_conversation),
        )
        .route(
            "/api/skills/v3/conversations/:conversation_id/activities/:activity_id",
            post(reply_to_activity),
        )
        .with_state(state)
}

async fn health() -> &'static str {
    "OK"
}

fn parse_activity(body: &Bytes) -> Result<Activity, (StatusCode, String)> {
    serde_json::from_slice(body)
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("invalid activity: {}", e)))
}

async fn authenticate(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<ClaimsIdentity, (StatusCode, String)> {
    state
        .auth
        .authenticate(headers)
        .await
        .map_err(|e| (StatusCode::UNAUTHORIZED, e.to_string()))
}

/// POST /api/messages: one channel activity per request, processed before responding.
async fn messages_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, (StatusCode, String)> {
    let identity = authenticate(&state, &headers).await?;
    let activity = parse_activity(&body)?;
    tracing::debug!(
        anonymous = identity.is_anonymous(),
        activity_type = ?activity.activity_type,
        "channel activity received"
    );

    // A dropped request (client gone) cancels the turn.
    let cancel = CancellationToken::new();
    let _cancel_on_drop = cancel.clone().drop_guard();

    if activity.expects_replies() {
        let buffer = Arc::new(BufferedChannel::addressed_to(
            activity.get_conversation_reference(),
        ));
        let report = state
            .coordinator
            .on_turn(&activity, buffer.clone() as Arc<dyn Channel>, cancel)
            .await;
        log_outcome(&report.outcome);
        return Ok(Json(json!({ "activities": buffer.take() })).into_response());
    }

    let channel = state
        .channels
        .for_reference(&activity.get_conversation_reference());
    let report = state.coordinator.on_turn(&activity, channel, cancel).await;
    log_outcome(&report.outcome);
    Ok((StatusCode::OK, Json(json!({}))).into_response())
}

fn log_outcome(outcome: &TurnOutcome) {
    match outcome {
        TurnOutcome::Failed(e) => tracing::warn!(error = %e, "turn failed"),
        TurnOutcome::Planned(r) | TurnOutcome::FlaggedInput(r) => tracing::debug!(
            steps = r.steps_executed,
            halted_at = ?r.halted_at,
            cancelled = r.cancelled,
            "turn complete"
        ),
        TurnOutcome::Delegated(h) => tracing::debug!(skill = %h.skill_id, "turn delegated"),
        TurnOutcome::Ignored => {}
    }
}

async fn send_to_conversation(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ResourceResponse>, (StatusCode, String)> {
    skill_callback(state, conversation_id, None, headers, body).await
}

async fn reply_to_activity(
    State(state): State<AppState>,
    Path((conversation_id, activity_id)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ResourceResponse>, (StatusCode, String)> {
    skill_callback(state, conversation_id, Some(activity_id), headers, body).await
}

/// Skill → host channel. Only registered skills may call; only issued skill
/// conversation ids are routed.
async fn skill_callback(
    state: AppState,
    skill_conversation_id: String,
    reply_to_id: Option<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ResourceResponse>, (StatusCode, String)> {
    let identity = authenticate(&state, &headers).await?;
    if let Some(app_id) = identity.app_id.as_deref() {
        if !state.coordinator.bridge().registry().is_allowed_caller(app_id) {
            tracing::warn!(caller = %app_id, "skill callback from caller not in allow-list");
            return Err((
                StatusCode::FORBIDDEN,
                format!("{} is not an allowed caller", app_id),
            ));
        }
    }
    let activity = parse_activity(&body)?;

    match state
        .coordinator
        .on_skill_activity(
            &skill_conversation_id,
            identity.app_id.as_deref(),
            reply_to_id,
            activity,
        )
        .await
    {
        Ok(ReplyRouting::Forwarded { resource, .. }) => Ok(Json(resource)),
        Ok(ReplyRouting::EndOfConversation { .. }) => Ok(Json(ResourceResponse {
            id: uuid::Uuid::new_v4().to_string(),
        })),
        Err(RelayError::UnknownDelegation(_)) => Err((
            StatusCode::NOT_FOUND,
            "unknown conversation".to_string(),
        )),
        Err(e) => {
            tracing::error!(error = %e, "skill callback failed");
            Err((StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
        }
    }
}
