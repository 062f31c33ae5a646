//! skillrelay gateway: the bot's HTTP endpoint.
//!
//! `POST /api/messages` takes channel activities, `/api/skills/v3/...` takes skill
//! callbacks. Configuration comes from `config/skillrelay.toml` and the environment.

mod auth;
mod routes;

use auth::{AnonymousAuthenticator, ChannelAuthenticator, ProxyHeaderAuthenticator};
use axum::{
    body::Body,
    extract::ConnectInfo,
    http::Request,
    middleware::Next,
    response::Response,
};
use routes::AppState;
use skillrelay_core::{
    ActionRegistry, CallSkillBots, ConnectorChannelFactory, ConversationIdFactory,
    ConversationStateStore, HttpSkillClient, LightsOff, LightsOn, OpenAiModerator,
    OpenAiPlanner, Pause, PlanExecutor, PromptManager, RelayConfig, SkillDelegationBridge,
    TurnCoordinator,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,skillrelay_core=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = run().await {
        tracing::error!(error = %e, "gateway stopped");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config = RelayConfig::load()?;

    let storage = config.open_storage()?;
    let registry = Arc::new(config.skill_registry()?);
    let identities = Arc::new(ConversationIdFactory::with_limits(
        storage.clone(),
        config.mapping_ttl(),
        config.delegation.max_mappings,
    ));
    let token = config.bot.connector_token.clone().filter(|t| !t.trim().is_empty());
    let channels = Arc::new(ConnectorChannelFactory::new(token.clone())?);
    let bridge = Arc::new(SkillDelegationBridge::new(
        registry.clone(),
        identities,
        Arc::new(HttpSkillClient::new(token)?),
        channels.clone(),
    ));

    let mut prompts = PromptManager::new(&config.planner.prompt_folder);
    prompts.add_function("getLightStatus", |state| {
        let on = state.get("lightsOn").and_then(|v| v.as_bool()).unwrap_or(false);
        format!("the lights are {}", if on { "on" } else { "off" })
    });
    let (backend, api_key) = config.planner_backend()?;
    let planner = OpenAiPlanner::new(
        backend,
        api_key,
        config.planner.default_model.clone(),
        Arc::new(prompts),
    )?;

    let actions = ActionRegistry::new()
        .with("LightsOn", Arc::new(LightsOn))
        .with("LightsOff", Arc::new(LightsOff))
        .with("Pause", Arc::new(Pause::new(config.actions.max_pause_ms)))
        .with(
            "CallSkillBots",
            Arc::new(CallSkillBots::new(
                bridge.clone(),
                config.default_skill_id().unwrap_or_default(),
            )),
        );
    tracing::info!(actions = ?actions.names(), skills = ?registry.skill_ids(), "action registry ready");

    let mut coordinator = TurnCoordinator::new(
        ConversationStateStore::new(storage),
        Arc::new(planner),
        PlanExecutor::new(Arc::new(actions)),
        bridge,
    )
    .with_prompt(config.planner.prompt.clone());
    match config.moderation_key() {
        Some(key) => {
            coordinator = coordinator
                .with_moderator(Arc::new(OpenAiModerator::new(key, config.moderation.mode)?));
        }
        None => tracing::warn!("moderation disabled"),
    }

    let auth: Arc<dyn ChannelAuthenticator> = if config.bot.is_anonymous() {
        tracing::warn!("no bot app id configured; accepting anonymous requests");
        Arc::new(AnonymousAuthenticator)
    } else {
        Arc::new(ProxyHeaderAuthenticator)
    };

    let app = routes::router(AppState {
        coordinator: Arc::new(coordinator),
        channels,
        auth,
    })
    .layer(axum::middleware::from_fn(log_requests));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;
    Ok(())
}

async fn log_requests(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let started = Instant::now();
    let response = next.run(request).await;
    tracing::info!(
        %addr,
        %method,
        %path,
        status = response.status().as_u16(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "request"
    );
    response
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
        return;
    }
    tracing::info!("shutting down");
}
