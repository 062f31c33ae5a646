//! Content moderation boundary. A flagged input skips planning; a flagged output
//! replaces the plan.

use crate::error::{RelayError, RelayResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

const OPENAI_API_BASE: &str = "https://api.openai.com/v1";
const MODERATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Which side of the turn gets reviewed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModerationMode {
    Input,
    Output,
    #[default]
    Both,
}

impl ModerationMode {
    pub fn reviews_input(self) -> bool {
        matches!(self, ModerationMode::Input | ModerationMode::Both)
    }

    pub fn reviews_output(self) -> bool {
        matches!(self, ModerationMode::Output | ModerationMode::Both)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Flagged { categories: Vec<String> },
}

impl Verdict {
    pub fn is_flagged(&self) -> bool {
        matches!(self, Verdict::Flagged { .. })
    }
}

#[async_trait::async_trait]
pub trait Moderator: Send + Sync {
    fn mode(&self) -> ModerationMode;

    async fn review(&self, text: &str) -> RelayResult<Verdict>;
}

#[derive(Serialize)]
struct ModerationRequest<'a> {
    input: &'a str,
}

#[derive(Deserialize)]
struct ModerationResponse {
    #[serde(default)]
    results: Vec<ModerationResult>,
}

#[derive(Deserialize)]
struct ModerationResult {
    flagged: bool,
    #[serde(default)]
    categories: BTreeMap<String, bool>,
}

/// OpenAI moderation endpoint.
pub struct OpenAiModerator {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    mode: ModerationMode,
}

impl OpenAiModerator {
    pub fn new(api_key: impl Into<String>, mode: ModerationMode) -> RelayResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(MODERATION_TIMEOUT)
            .build()
            .map_err(|e| RelayError::Moderation(e.to_string()))?;
        Ok(Self {
            client,
            api_key: api_key.into().trim().to_string(),
            base_url: OPENAI_API_BASE.to_string(),
            mode,
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait::async_trait]
impl Moderator for OpenAiModerator {
    fn mode(&self) -> ModerationMode {
        self.mode
    }

    async fn review(&self, text: &str) -> RelayResult<Verdict> {
        let url = format!("{}/moderations", self.base_url.trim_end_matches('/'));
        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&ModerationRequest { input: text })
            .send()
            .await
            .map_err(|e| RelayError::Moderation(e.to_string()))?;
        let status = res.status();
        if !status.is_success() {
            return Err(RelayError::Moderation(format!("moderation returned {}", status)));
        }
        let body: ModerationResponse = res
            .json()
            .await
            .map_err(|e| RelayError::Moderation(e.to_string()))?;
        Ok(verdict_from(body))
    }
}

fn verdict_from(body: ModerationResponse) -> Verdict {
    let mut categories = Vec::new();
    let mut flagged = false;
    for result in body.results {
        flagged |= result.flagged;
        categories.extend(
            result
                .categories
                .into_iter()
                .filter(|(_, hit)| *hit)
                .map(|(name, _)| name),
        );
    }
    if flagged {
        categories.sort();
        categories.dedup();
        Verdict::Flagged { categories }
    } else {
        Verdict::Pass
    }
}
