pub mod oauth2;

use crate::error::Result;
use async_trait::async_trait;
use std::fmt;

pub use oauth2::OAuth2Client;

/// Scope granting access to the Power BI REST API
pub const POWERBI_SCOPE: &str = "https://analysis.windows.net/powerbi/api/.default";

/// Bearer credential returned by an [`AuthProvider`]
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken(String);

impl AccessToken {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    pub fn secret(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessToken(<redacted>)")
    }
}

/// Trait for authentication providers that can fetch access tokens
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Fetch an access token valid for `scope`
    async fn get_token(&self, scope: &str) -> Result<AccessToken>;
}
