//! Channel authentication boundary.
//!
//! Token validation happens in front of this service. The gateway only reads the
//! identity the fronting proxy vouches for, or runs anonymously when no bot app id is
//! configured (local emulator use).

use axum::http::HeaderMap;

/// Header the authenticating proxy sets to the caller's validated app id.
pub const AUTHENTICATED_APP_ID_HEADER: &str = "x-authenticated-app-id";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimsIdentity {
    /// App id of the caller; `None` for anonymous requests.
    pub app_id: Option<String>,
}

impl ClaimsIdentity {
    pub fn anonymous() -> Self {
        Self { app_id: None }
    }

    pub fn is_anonymous(&self) -> bool {
        self.app_id.is_none()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("missing caller identity")]
    MissingIdentity,
}

#[async_trait::async_trait]
pub trait ChannelAuthenticator: Send + Sync {
    async fn authenticate(&self, headers: &HeaderMap) -> Result<ClaimsIdentity, AuthError>;
}

/// Accepts every request as anonymous.
pub struct AnonymousAuthenticator;

#[async_trait::async_trait]
impl ChannelAuthenticator for AnonymousAuthenticator {
    async fn authenticate(&self, _headers: &HeaderMap) -> Result<ClaimsIdentity, AuthError> {
        Ok(ClaimsIdentity::anonymous())
    }
}

/// Trusts [`AUTHENTICATED_APP_ID_HEADER`], rejecting requests without it.
pub struct ProxyHeaderAuthenticator;

#[async_trait::async_trait]
impl ChannelAuthenticator for ProxyHeaderAuthenticator {
    async fn authenticate(&self, headers: &HeaderMap) -> Result<ClaimsIdentity, AuthError> {
        let app_id = headers
            .get(AUTHENTICATED_APP_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or(AuthError::MissingIdentity)?;
        Ok(ClaimsIdentity {
            app_id: Some(app_id.to_string()),
        })
    }
}
