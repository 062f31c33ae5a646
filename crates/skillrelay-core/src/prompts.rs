//! Prompt templates.
//!
//! A prompt named `chat` lives at `<folder>/chat/skprompt.txt`, with optional completion
//! settings in `<folder>/chat/config.json`. Templates are cached after first load.
//!
//! Template syntax:
//! * `{{$input}}`: the user's input text
//! * `{{$state.<field>}}`: a conversation field (empty when absent)
//! * `{{name}}`: a registered prompt function, called with the state snapshot

use crate::error::{RelayError, RelayResult};
use crate::planner::PlanRequest;
use dashmap::DashMap;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const PROMPT_FILE: &str = "skprompt.txt";
const CONFIG_FILE: &str = "config.json";

/// Prompt function: derives text from the conversation state snapshot.
pub type PromptFunction = Arc<dyn Fn(&Value) -> String + Send + Sync>;

/// Model parameters a prompt asks for. Unset fields use the service defaults.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct CompletionSettings {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub presence_penalty: Option<f32>,
    #[serde(default)]
    pub frequency_penalty: Option<f32>,
    #[serde(default)]
    pub stop_sequences: Vec<String>,
}

#[derive(Deserialize)]
struct PromptConfig {
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    completion: CompletionSettings,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PromptTemplate {
    pub name: String,
    pub text: String,
    pub description: Option<String>,
    pub completion: CompletionSettings,
}

pub struct PromptManager {
    folder: PathBuf,
    templates: DashMap<String, Arc<PromptTemplate>>,
    functions: HashMap<String, PromptFunction>,
}

impl PromptManager {
    pub fn new(folder: impl AsRef<Path>) -> Self {
        Self {
            folder: folder.as_ref().to_path_buf(),
            templates: DashMap::new(),
            functions: HashMap::new(),
        }
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    pub fn add_function<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(&Value) -> String + Send + Sync + 'static,
    {
        self.functions.insert(name.into(), Arc::new(f));
    }

    /// Registers an in-memory template under `name`, shadowing any file of that name.
    pub fn with_template(
        self,
        name: impl Into<String>,
        text: impl Into<String>,
        completion: CompletionSettings,
    ) -> Self {
        let name = name.into();
        self.templates.insert(
            name.clone(),
            Arc::new(PromptTemplate {
                name,
                text: text.into(),
                description: None,
                completion,
            }),
        );
        self
    }

    pub fn load_template(&self, name: &str) -> RelayResult<Arc<PromptTemplate>> {
        if let Some(t) = self.templates.get(name) {
            return Ok(Arc::clone(t.value()));
        }
        if name.is_empty() || name.contains(|c| c == '/' || c == '\\') || name.contains("..") {
            return Err(RelayError::Prompt(format!("invalid prompt name {:?}", name)));
        }
        let dir = self.folder.join(name);
        let text = std::fs::read_to_string(dir.join(PROMPT_FILE)).map_err(|e| {
            RelayError::Prompt(format!("{}: {}", dir.join(PROMPT_FILE).display(), e))
        })?;
        let config = match std::fs::read_to_string(dir.join(CONFIG_FILE)) {
            Ok(raw) => serde_json::from_str::<PromptConfig>(&raw)
                .map_err(|e| RelayError::Prompt(format!("{}/{}: {}", name, CONFIG_FILE, e)))?,
            Err(_) => PromptConfig {
                description: None,
                completion: CompletionSettings::default(),
            },
        };
        let template = Arc::new(PromptTemplate {
            name: name.to_string(),
            text,
            description: config.description,
            completion: config.completion,
        });
        self.templates.insert(name.to_string(), Arc::clone(&template));
        tracing::debug!(prompt = %name, "prompt template loaded");
        Ok(template)
    }

    pub fn render(&self, template: &PromptTemplate, request: &PlanRequest) -> RelayResult<String> {
        let mut out = String::with_capacity(template.text.len());
        let mut rest = template.text.as_str();
        while let Some(open) = rest.find("{{") {
            out.push_str(&rest[..open]);
            let after = &rest[open + 2..];
            let Some(close) = after.find("}}") else {
                return Err(RelayError::Prompt(format!(
                    "unterminated variable in prompt {}",
                    template.name
                )));
            };
            let token = after[..close].trim();
            out.push_str(&self.resolve(token, request, &template.name)?);
            rest = &after[close + 2..];
        }
        out.push_str(rest);
        Ok(out)
    }

    fn resolve(&self, token: &str, request: &PlanRequest, prompt: &str) -> RelayResult<String> {
        if token == "$input" {
            return Ok(request.input.clone());
        }
        if let Some(field) = token.strip_prefix("$state.") {
            return Ok(match request.state.get(field) {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Null) | None => String::new(),
                Some(other) => other.to_string(),
            });
        }
        if token.starts_with('$') {
            tracing::debug!(prompt = %prompt, variable = %token, "unbound prompt variable");
            return Ok(String::new());
        }
        let f = self.functions.get(token).ok_or_else(|| {
            RelayError::Prompt(format!("unknown prompt function {} in {}", token, prompt))
        })?;
        Ok(f(&request.state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request() -> PlanRequest {
        PlanRequest {
            state: json!({"lightsOn": true, "skillbot": "Echo"}),
            input: "turn them off".into(),
            prompt: "chat".into(),
        }
    }

    #[test]
    fn renders_input_state_and_functions() {
        let mut prompts = PromptManager::new("prompts");
        prompts.add_function("getLightStatus", |state| {
            if state.get("lightsOn").and_then(Value::as_bool).unwrap_or(false) {
                "on".into()
            } else {
                "off".into()
            }
        });
        let prompts = prompts.with_template(
            "chat",
            "Lights are {{getLightStatus}}. Skill: {{$state.skillbot}}{{$state.missing}}. Human: {{ $input }}",
            CompletionSettings::default(),
        );
        let t = prompts.load_template("chat").unwrap();
        assert_eq!(
            prompts.render(&t, &request()).unwrap(),
            "Lights are on. Skill: Echo. Human: turn them off"
        );
    }

    #[test]
    fn unknown_function_is_an_error() {
        let prompts =
            PromptManager::new("prompts").with_template("p", "{{nope}}", CompletionSettings::default());
        let t = prompts.load_template("p").unwrap();
        assert!(matches!(prompts.render(&t, &request()), Err(RelayError::Prompt(_))));
    }

    #[test]
    fn loads_template_and_settings_from_folder() {
        let dir = tempfile::tempdir().unwrap();
        let chat = dir.path().join("chat");
        std::fs::create_dir_all(&chat).unwrap();
        std::fs::write(chat.join(PROMPT_FILE), "Human: {{$input}}").unwrap();
        std::fs::write(
            chat.join(CONFIG_FILE),
            r#"{"schema":1,"description":"Chat","type":"completion",
                "completion":{"max_tokens":256,"temperature":0.2,"stop_sequences":["Human:"]}}"#,
        )
        .unwrap();

        let prompts = PromptManager::new(dir.path());
        let t = prompts.load_template("chat").unwrap();
        assert_eq!(t.description.as_deref(), Some("Chat"));
        assert_eq!(t.completion.max_tokens, Some(256));
        assert_eq!(t.completion.stop_sequences, ["Human:"]);
        assert!(prompts.load_template("missing").is_err());
        assert!(prompts.load_template("../etc").is_err());
    }
}
