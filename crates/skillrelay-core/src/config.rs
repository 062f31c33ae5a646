//! Service configuration.
//!
//! Precedence, lowest first: built-in defaults, the TOML file named by
//! `SKILLRELAY_CONFIG` (default `config/skillrelay.toml`, optional),
//! `SKILLRELAY__SECTION__KEY` environment variables, then the bot's classic environment
//! names (`BOT_ID`, `SECRET_OPENAI_API_KEY`, `SKILL_ENDPOINT`, `PORT`, ...).
//! Loaded once at start-up.

use crate::identity::{DEFAULT_MAPPING_TTL, DEFAULT_MAX_MAPPINGS};
use crate::moderation::ModerationMode;
use crate::planner::PlannerBackend;
use crate::skills::{SkillDescriptor, SkillRegistry};
use crate::storage::{MemoryStorage, SledStorage, Storage, StorageError};
use config::builder::DefaultState;
use config::ConfigBuilder;
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

const DEFAULT_CONFIG_PATH: &str = "config/skillrelay.toml";

/// Classic environment names and the keys they set.
const LEGACY_ENV: &[(&str, &str)] = &[
    ("PORT", "port"),
    ("BOT_ID", "bot.app_id"),
    ("BOT_PASSWORD", "bot.app_password"),
    ("SECRET_OPENAI_API_KEY", "planner.openai_api_key"),
    ("SECRET_AZURE_OPENAI_API_KEY", "planner.azure_api_key"),
    ("AZURE_OPENAI_ENDPOINT", "planner.endpoint"),
    ("SKILL_ID", "skill.id"),
    ("SKILL_APP_ID", "skill.app_id"),
    ("SKILL_ENDPOINT", "skill.endpoint"),
    ("SKILL_HOST_ENDPOINT", "skill_host_endpoint"),
];

#[derive(Debug, thiserror::Error)]
pub enum RelayConfigError {
    #[error("config: {0}")]
    Load(#[from] config::ConfigError),
    #[error("missing configuration: {0}")]
    Missing(&'static str),
    #[error("invalid url in {key}: {reason}")]
    InvalidUrl { key: &'static str, reason: String },
    #[error("storage: {0}")]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BotSettings {
    #[serde(default)]
    pub app_id: String,
    #[serde(default)]
    pub app_password: String,
    /// Pre-acquired bearer token for outbound connector and skill calls.
    #[serde(default)]
    pub connector_token: Option<String>,
}

impl BotSettings {
    /// No app id means the emulator-style anonymous mode.
    pub fn is_anonymous(&self) -> bool {
        self.app_id.trim().is_empty()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlannerSettings {
    #[serde(default)]
    pub azure_api_key: Option<String>,
    #[serde(default)]
    pub openai_api_key: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    pub api_version: String,
    pub default_model: String,
    pub prompt_folder: String,
    pub prompt: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModerationSettings {
    pub enabled: bool,
    pub mode: ModerationMode,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SkillSettings {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub app_id: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    Sled,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageSettings {
    pub backend: StorageBackend,
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DelegationSettings {
    pub mapping_ttl_secs: u64,
    pub max_mappings: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ActionSettings {
    pub max_pause_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    pub port: u16,
    #[serde(default)]
    pub bot: BotSettings,
    pub planner: PlannerSettings,
    pub moderation: ModerationSettings,
    #[serde(default)]
    pub skill: SkillSettings,
    #[serde(default)]
    pub skill_host_endpoint: Option<String>,
    pub storage: StorageSettings,
    pub delegation: DelegationSettings,
    pub actions: ActionSettings,
}

impl RelayConfig {
    /// Builder preloaded with defaults only.
    pub fn defaults() -> Result<ConfigBuilder<DefaultState>, RelayConfigError> {
        Ok(config::Config::builder()
            .set_default("port", 3978_i64)?
            .set_default("planner.api_version", "2022-12-01")?
            .set_default("planner.default_model", "gpt-35-turbo")?
            .set_default("planner.prompt_folder", "prompts")?
            .set_default("planner.prompt", "chat")?
            .set_default("moderation.enabled", true)?
            .set_default("moderation.mode", "both")?
            .set_default("storage.backend", "memory")?
            .set_default("delegation.mapping_ttl_secs", DEFAULT_MAPPING_TTL.as_secs() as i64)?
            .set_default("delegation.max_mappings", DEFAULT_MAX_MAPPINGS as i64)?
            .set_default(
                "actions.max_pause_ms",
                crate::actions::DEFAULT_MAX_PAUSE_MS as i64,
            )?)
    }

    /// Loads from file and environment (see module docs for precedence).
    pub fn load() -> Result<Self, RelayConfigError> {
        let config_path =
            std::env::var("SKILLRELAY_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let builder = Self::defaults()?;
        let path = Path::new(&config_path);
        let builder = if path.exists() {
            builder.add_source(config::File::from(path))
        } else {
            builder
        };
        let mut builder =
            builder.add_source(config::Environment::with_prefix("SKILLRELAY").separator("__"));
        for (var, key) in LEGACY_ENV {
            let value = std::env::var(var).ok().filter(|v| !v.trim().is_empty());
            builder = builder.set_override_option(*key, value)?;
        }
        Ok(builder.build()?.try_deserialize()?)
    }

    /// Parses a TOML document on top of the defaults. No environment is read.
    pub fn from_toml(toml: &str) -> Result<Self, RelayConfigError> {
        Ok(Self::defaults()?
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?)
    }

    /// Skill registry from the `skill` section. The host callback endpoint is
    /// mandatory; the skill itself is optional.
    pub fn skill_registry(&self) -> Result<SkillRegistry, RelayConfigError> {
        let host = self
            .skill_host_endpoint
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or(RelayConfigError::Missing("SKILL_HOST_ENDPOINT"))?;
        let host = parse_url("SKILL_HOST_ENDPOINT", host)?;
        let mut registry = SkillRegistry::new(host);
        if let Some(id) = self.skill.id.as_deref().filter(|s| !s.is_empty()) {
            let app_id = self
                .skill
                .app_id
                .clone()
                .ok_or(RelayConfigError::Missing("SKILL_APP_ID"))?;
            let endpoint = self
                .skill
                .endpoint
                .as_deref()
                .ok_or(RelayConfigError::Missing("SKILL_ENDPOINT"))?;
            registry = registry.with_skill(SkillDescriptor {
                id: id.to_string(),
                app_id,
                skill_endpoint: parse_url("SKILL_ENDPOINT", endpoint)?,
            });
        }
        Ok(registry)
    }

    /// Id of the configured skill, used by `CallSkillBots` when the planner names none.
    pub fn default_skill_id(&self) -> Option<&str> {
        self.skill.id.as_deref().filter(|s| !s.is_empty())
    }

    /// Planner endpoint and key. Azure wins when its key and endpoint are both set.
    pub fn planner_backend(&self) -> Result<(PlannerBackend, String), RelayConfigError> {
        let p = &self.planner;
        if let (Some(key), Some(endpoint)) = (non_empty(&p.azure_api_key), non_empty(&p.endpoint)) {
            return Ok((
                PlannerBackend::Azure {
                    endpoint: endpoint.to_string(),
                    api_version: p.api_version.clone(),
                },
                key.to_string(),
            ));
        }
        if let Some(key) = non_empty(&p.openai_api_key) {
            let backend = match non_empty(&p.endpoint) {
                Some(base) => PlannerBackend::OpenAi {
                    base_url: base.to_string(),
                },
                None => PlannerBackend::openai(),
            };
            return Ok((backend, key.to_string()));
        }
        Err(RelayConfigError::Missing(
            "SECRET_AZURE_OPENAI_API_KEY (with endpoint) or SECRET_OPENAI_API_KEY",
        ))
    }

    /// Key for the moderation service, when moderation is on and a key exists.
    pub fn moderation_key(&self) -> Option<&str> {
        if !self.moderation.enabled {
            return None;
        }
        non_empty(&self.planner.openai_api_key)
    }

    pub fn mapping_ttl(&self) -> Duration {
        Duration::from_secs(self.delegation.mapping_ttl_secs)
    }

    pub fn open_storage(&self) -> Result<Arc<dyn Storage>, RelayConfigError> {
        Ok(match self.storage.backend {
            StorageBackend::Memory => Arc::new(MemoryStorage::new()),
            StorageBackend::Sled => Arc::new(SledStorage::open(self.storage.path.as_deref())?),
        })
    }
}

fn non_empty(v: &Option<String>) -> Option<&str> {
    v.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

fn parse_url(key: &'static str, raw: &str) -> Result<Url, RelayConfigError> {
    Url::parse(raw.trim()).map_err(|e| RelayConfigError::InvalidUrl {
        key,
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_bot_conventions() {
        let cfg = RelayConfig::from_toml("").unwrap();
        assert_eq!(cfg.port, 3978);
        assert_eq!(cfg.planner.api_version, "2022-12-01");
        assert_eq!(cfg.planner.default_model, "gpt-35-turbo");
        assert_eq!(cfg.moderation.mode, ModerationMode::Both);
        assert_eq!(cfg.storage.backend, StorageBackend::Memory);
        assert_eq!(cfg.mapping_ttl(), DEFAULT_MAPPING_TTL);
        assert!(matches!(
            cfg.skill_registry(),
            Err(RelayConfigError::Missing("SKILL_HOST_ENDPOINT"))
        ));
    }

    #[test]
    fn skill_section_builds_registry() {
        let cfg = RelayConfig::from_toml(
            r#"
            skill_host_endpoint = "http://localhost:3978/api/skills"
            [skill]
            id = "EchoSkillBot"
            app_id = "echo-app"
            endpoint = "http://localhost:39783/api/messages"
            "#,
        )
        .unwrap();
        let registry = cfg.skill_registry().unwrap();
        assert_eq!(registry.skill_ids(), ["EchoSkillBot"]);
        assert_eq!(registry.allowed_callers(), ["echo-app"]);
        assert_eq!(cfg.default_skill_id(), Some("EchoSkillBot"));
    }

    #[test]
    fn bad_skill_url_is_reported() {
        let cfg = RelayConfig::from_toml(
            r#"
            skill_host_endpoint = "http://localhost:3978/api/skills"
            [skill]
            id = "EchoSkillBot"
            app_id = "echo-app"
            endpoint = "not a url"
            "#,
        )
        .unwrap();
        assert!(matches!(
            cfg.skill_registry(),
            Err(RelayConfigError::InvalidUrl { key: "SKILL_ENDPOINT", .. })
        ));
    }

    #[test]
    fn planner_backend_prefers_azure() {
        let cfg = RelayConfig::from_toml(
            r#"
            [planner]
            azure_api_key = "az"
            openai_api_key = "oa"
            endpoint = "https://res.openai.azure.com"
            "#,
        )
        .unwrap();
        let (backend, key) = cfg.planner_backend().unwrap();
        assert!(matches!(backend, PlannerBackend::Azure { .. }));
        assert_eq!(key, "az");

        let cfg = RelayConfig::from_toml("[planner]\nopenai_api_key = \"oa\"").unwrap();
        let (backend, key) = cfg.planner_backend().unwrap();
        assert_eq!(backend, PlannerBackend::openai());
        assert_eq!(key, "oa");
        assert_eq!(cfg.moderation_key(), Some("oa"));

        assert!(RelayConfig::from_toml("").unwrap().planner_backend().is_err());
    }

    #[test]
    fn sled_backend_opens_at_path() {
        let dir = tempfile::tempdir().unwrap();
        let toml = format!(
            "[storage]\nbackend = \"sled\"\npath = {:?}",
            dir.path().join("db").display().to_string()
        );
        let cfg = RelayConfig::from_toml(&toml).unwrap();
        assert!(cfg.open_storage().unwrap().is_durable());
    }
}
