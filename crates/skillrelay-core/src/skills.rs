//! Skill registry: which remote skill bots this host may delegate to, and the callback
//! endpoint skills use to reply. Immutable after start-up.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use url::Url;

/// Allow-list entry that admits any caller.
pub const ANY_CALLER: &str = "*";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkillDescriptor {
    pub id: String,
    /// App identity the skill authenticates as when it calls back.
    pub app_id: String,
    pub skill_endpoint: Url,
}

#[derive(Debug, Clone)]
pub struct SkillRegistry {
    skills: HashMap<String, SkillDescriptor>,
    host_endpoint: Url,
}

impl SkillRegistry {
    pub fn new(host_endpoint: Url) -> Self {
        Self {
            skills: HashMap::new(),
            host_endpoint,
        }
    }

    pub fn with_skill(mut self, skill: SkillDescriptor) -> Self {
        self.skills.insert(skill.id.clone(), skill);
        self
    }

    pub fn get(&self, skill_id: &str) -> Option<&SkillDescriptor> {
        self.skills.get(skill_id)
    }

    /// Callback endpoint handed to skills as their `serviceUrl`.
    pub fn host_endpoint(&self) -> &Url {
        &self.host_endpoint
    }

    pub fn skill_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.skills.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// App ids allowed to call the skill callback endpoint.
    pub fn allowed_callers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.skills.values().map(|s| s.app_id.clone()).collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// Claims check for the skill callback endpoint: the caller must be a registered
    /// skill, unless a registered app id is the `*` wildcard.
    pub fn is_allowed_caller(&self, app_id: &str) -> bool {
        self.skills
            .values()
            .any(|s| s.app_id == ANY_CALLER || s.app_id == app_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> SkillRegistry {
        SkillRegistry::new(Url::parse("http://localhost:3978/api/skills").unwrap()).with_skill(
            SkillDescriptor {
                id: "EchoSkillBot".into(),
                app_id: "echo-app-id".into(),
                skill_endpoint: Url::parse("http://localhost:39783/api/messages").unwrap(),
            },
        )
    }

    #[test]
    fn resolves_registered_skill() {
        let reg = registry();
        assert_eq!(reg.get("EchoSkillBot").unwrap().app_id, "echo-app-id");
        assert!(reg.get("Missing").is_none());
        assert_eq!(reg.skill_ids(), ["EchoSkillBot"]);
    }

    #[test]
    fn allow_list_is_built_from_skill_app_ids() {
        let reg = registry();
        assert_eq!(reg.allowed_callers(), ["echo-app-id"]);
        assert!(reg.is_allowed_caller("echo-app-id"));
        assert!(!reg.is_allowed_caller("someone-else"));
    }

    #[test]
    fn wildcard_app_id_admits_any_caller() {
        let reg = SkillRegistry::new(Url::parse("http://localhost/api/skills").unwrap())
            .with_skill(SkillDescriptor {
                id: "Any".into(),
                app_id: ANY_CALLER.into(),
                skill_endpoint: Url::parse("http://localhost/api/messages").unwrap(),
            });
        assert!(reg.is_allowed_caller("whoever"));
    }
}
