//! Planner: asks a chat-completions model what to do with the user's turn and parses
//! the answer into a [`Plan`].
//!
//! The model may answer with a plan object
//! `{"type":"plan","commands":[{"type":"DO","action":"LightsOn","entities":{}},{"type":"SAY","response":"..."}]}`
//! or with plain text, which becomes a single `SAY`. Anything else is malformed.

use crate::actions::SAY_ACTION;
use crate::error::{RelayError, RelayResult};
use crate::prompts::PromptManager;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;

const PLANNER_TIMEOUT: Duration = Duration::from_secs(60);
const OPENAI_API_BASE: &str = "https://api.openai.com/v1";

/// One plan step: an action name and its arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanCommand {
    pub action: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
}

impl PlanCommand {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            arguments: Map::new(),
        }
    }

    pub fn with_argument(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.arguments.insert(name.into(), value.into());
        self
    }
}

/// Ordered steps produced by the planner. Untrusted: names may be unknown.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub commands: Vec<PlanCommand>,
}

impl Plan {
    pub fn new(commands: Vec<PlanCommand>) -> Self {
        Self { commands }
    }

    /// A plan that only says `text`.
    pub fn say(text: impl Into<String>) -> Self {
        Self::new(vec![PlanCommand::new(SAY_ACTION).with_argument("response", text.into())])
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

/// What the planner is given for one turn.
#[derive(Debug, Clone)]
pub struct PlanRequest {
    /// Snapshot of the conversation's fields.
    pub state: Value,
    pub input: String,
    /// Name of the prompt template to plan with.
    pub prompt: String,
}

#[async_trait::async_trait]
pub trait Planner: Send + Sync {
    async fn generate_plan(&self, request: &PlanRequest) -> RelayResult<Plan>;
}

#[derive(Deserialize)]
struct RawPlan {
    #[serde(default)]
    commands: Vec<RawCommand>,
}

#[derive(Deserialize)]
struct RawCommand {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    action: Option<String>,
    #[serde(default, alias = "parameters", alias = "arguments")]
    entities: Option<Map<String, Value>>,
    #[serde(default)]
    response: Option<String>,
}

/// Parses model output into a plan.
pub fn parse_plan_response(text: &str) -> RelayResult<Plan> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(RelayError::PlannerMalformed("empty response".into()));
    }
    let Some(json) = extract_json_object(trimmed) else {
        return Ok(Plan::say(trimmed));
    };
    let value = match serde_json::from_str::<Value>(json) {
        Ok(value) if is_plan_object(&value) => value,
        Ok(_) => return Ok(Plan::say(trimmed)),
        // Braces in prose are text; a broken plan object is not.
        Err(e) if looks_like_plan(json) => {
            return Err(RelayError::PlannerMalformed(format!("plan object: {}", e)))
        }
        Err(_) => return Ok(Plan::say(trimmed)),
    };
    let raw: RawPlan = serde_json::from_value(value)
        .map_err(|e| RelayError::PlannerMalformed(format!("plan object: {}", e)))?;
    let mut commands = Vec::with_capacity(raw.commands.len());
    for (i, cmd) in raw.commands.into_iter().enumerate() {
        match cmd.kind.to_ascii_uppercase().as_str() {
            "DO" => {
                let action = cmd
                    .action
                    .filter(|a| !a.trim().is_empty())
                    .ok_or_else(|| {
                        RelayError::PlannerMalformed(format!("command {} has no action", i))
                    })?;
                commands.push(PlanCommand {
                    action,
                    arguments: cmd.entities.unwrap_or_default(),
                });
            }
            "SAY" => {
                commands.push(
                    PlanCommand::new(SAY_ACTION)
                        .with_argument("response", cmd.response.unwrap_or_default()),
                );
            }
            other => {
                return Err(RelayError::PlannerMalformed(format!(
                    "command {} has unknown type {:?}",
                    i, other
                )))
            }
        }
    }
    Ok(Plan::new(commands))
}

fn is_plan_object(value: &Value) -> bool {
    value
        .get("type")
        .and_then(Value::as_str)
        .is_some_and(|t| t.eq_ignore_ascii_case("plan"))
}

/// A JSON-looking object that names itself a plan.
fn looks_like_plan(span: &str) -> bool {
    let lower = span.to_ascii_lowercase();
    span[1..].trim_start().starts_with('"')
        && lower.contains("\"type\"")
        && lower.contains("\"plan\"")
}

/// The outermost `{ ... }` span, if the text contains one.
fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

/// Where the chat-completions endpoint lives and how it authenticates.
#[derive(Debug, Clone, PartialEq)]
pub enum PlannerBackend {
    /// Azure OpenAI: `api-key` header, model is the deployment name.
    Azure { endpoint: String, api_version: String },
    /// OpenAI or a compatible API: bearer token.
    OpenAi { base_url: String },
}

impl PlannerBackend {
    pub fn openai() -> Self {
        PlannerBackend::OpenAi {
            base_url: OPENAI_API_BASE.to_string(),
        }
    }

    fn chat_url(&self, model: &str) -> String {
        match self {
            PlannerBackend::Azure {
                endpoint,
                api_version,
            } => format!(
                "{}/openai/deployments/{}/chat/completions?api-version={}",
                endpoint.trim_end_matches('/'),
                model,
                api_version
            ),
            PlannerBackend::OpenAi { base_url } => {
                format!("{}/chat/completions", base_url.trim_end_matches('/'))
            }
        }
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    presence_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    frequency_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    stop: Vec<String>,
}

#[derive(Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessageResponse,
}

#[derive(Deserialize)]
struct ChatMessageResponse {
    #[serde(default)]
    content: Option<String>,
}

/// Plans with an OpenAI or Azure OpenAI chat model, using prompts from a
/// [`PromptManager`].
pub struct OpenAiPlanner {
    client: reqwest::Client,
    backend: PlannerBackend,
    api_key: String,
    default_model: String,
    prompts: Arc<PromptManager>,
}

impl OpenAiPlanner {
    pub fn new(
        backend: PlannerBackend,
        api_key: impl Into<String>,
        default_model: impl Into<String>,
        prompts: Arc<PromptManager>,
    ) -> RelayResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(PLANNER_TIMEOUT)
            .build()
            .map_err(|e| RelayError::PlannerUnavailable(e.to_string()))?;
        Ok(Self {
            client,
            backend,
            api_key: api_key.into().trim().to_string(),
            default_model: default_model.into(),
            prompts,
        })
    }

    pub fn backend(&self) -> &PlannerBackend {
        &self.backend
    }
}

#[async_trait::async_trait]
impl Planner for OpenAiPlanner {
    #[tracing::instrument(skip(self, request), fields(prompt = %request.prompt))]
    async fn generate_plan(&self, request: &PlanRequest) -> RelayResult<Plan> {
        let template = self.prompts.load_template(&request.prompt)?;
        let system = self.prompts.render(&template, request)?;
        let settings = &template.completion;
        let model = settings.model.as_deref().unwrap_or(&self.default_model);

        let body = ChatRequest {
            model: match self.backend {
                PlannerBackend::Azure { .. } => None,
                PlannerBackend::OpenAi { .. } => Some(model),
            },
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: request.input.clone(),
                },
            ],
            temperature: settings.temperature,
            max_tokens: settings.max_tokens,
            top_p: settings.top_p,
            presence_penalty: settings.presence_penalty,
            frequency_penalty: settings.frequency_penalty,
            stop: settings.stop_sequences.clone(),
        };

        let url = self.backend.chat_url(model);
        let req = self.client.post(&url).json(&body);
        let req = match self.backend {
            PlannerBackend::Azure { .. } => req.header("api-key", &self.api_key),
            PlannerBackend::OpenAi { .. } => req.bearer_auth(&self.api_key),
        };
        let res = req
            .send()
            .await
            .map_err(|e| RelayError::PlannerUnavailable(e.to_string()))?;
        let status = res.status();
        if !status.is_success() {
            let text = res.text().await.unwrap_or_default();
            return Err(RelayError::PlannerUnavailable(format!(
                "planner returned {}: {}",
                status,
                text.chars().take(200).collect::<String>()
            )));
        }
        let parsed: ChatResponse = res
            .json()
            .await
            .map_err(|e| RelayError::PlannerMalformed(e.to_string()))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| RelayError::PlannerMalformed("no choices in response".into()))?;

        let plan = parse_plan_response(&content)?;
        tracing::debug!(steps = plan.len(), "plan generated");
        Ok(plan)
    }
}
