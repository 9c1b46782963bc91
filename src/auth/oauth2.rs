use crate::config::OAuth2ClientConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::{AccessToken, AuthProvider};

/// Token endpoint response. Azure AD answers with either the token fields or
/// an `error`/`error_description` pair, so everything is optional here.
#[derive(Debug, Clone, Default, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

impl TokenResponse {
    fn failure_reason(&self) -> String {
        self.error_description
            .clone()
            .or_else(|| self.error.clone())
            .unwrap_or_else(|| "Unknown error".to_string())
    }
}

/// Cached token with expiration tracking
#[derive(Debug, Clone)]
struct CachedToken {
    scope: String,
    access_token: AccessToken,
    expires_at: SystemTime,
}

/// Lifetime assumed when the server omits `expires_in`
const DEFAULT_TOKEN_LIFETIME_SECS: u64 = 3600;

/// OAuth2 client credentials provider for Azure AD tenants
pub struct OAuth2Client {
    config: OAuth2ClientConfig,
    http_client: reqwest::Client,
    cached_token: Arc<RwLock<Option<CachedToken>>>,
}

impl OAuth2Client {
    pub fn new(config: OAuth2ClientConfig) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            config,
            http_client,
            cached_token: Arc::new(RwLock::new(None)),
        })
    }

    /// Check if the cached token covers `scope` and is still valid (with 60 second buffer)
    async fn is_token_valid(&self, scope: &str) -> bool {
        if let Some(ref token) = *self.cached_token.read().await {
            if token.scope != scope {
                return false;
            }
            if let Ok(duration) = token.expires_at.duration_since(SystemTime::now()) {
                return duration.as_secs() > 60;
            }
        }
        false
    }

    /// Request a new access token from the tenant's token endpoint
    async fn fetch_new_token(&self, scope: &str) -> Result<CachedToken> {
        let token_url = self.config.token_url();
        debug!("Fetching new OAuth2 token from {}", token_url);

        let mut params = vec![
            ("grant_type", "client_credentials".to_string()),
            ("client_id", self.config.client_id.clone()),
            ("client_secret", self.config.client_secret.clone()),
            ("scope", scope.to_string()),
        ];

        for (key, value) in &self.config.endpoint_params {
            params.push((key.as_str(), value.clone()));
        }

        let response = self
            .http_client
            .post(&token_url)
            .form(&params)
            .send()
            .await
            .map_err(|e| Error::Auth(format!("Failed to request OAuth2 token: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unable to read response body".to_string());

        let token_response: TokenResponse = match serde_json::from_str(&body) {
            Ok(parsed) => parsed,
            Err(_) if !status.is_success() => {
                return Err(Error::Auth(format!(
                    "OAuth2 token request failed with status {}: {}",
                    status, body
                )));
            }
            Err(e) => {
                return Err(Error::Auth(format!(
                    "Failed to parse OAuth2 token response: {}",
                    e
                )));
            }
        };

        if !status.is_success() {
            return Err(Error::Auth(format!(
                "OAuth2 token request failed with status {}: {}",
                status,
                token_response.failure_reason()
            )));
        }

        let access_token = match token_response.access_token.as_deref() {
            Some(token) if !token.trim().is_empty() => AccessToken::new(token),
            _ => {
                return Err(Error::Auth(format!(
                    "Failed to acquire token: {}",
                    token_response.failure_reason()
                )));
            }
        };

        let expires_in = token_response
            .expires_in
            .unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS);

        info!(
            "Access token acquired successfully (type {}, expires in {} seconds)",
            token_response.token_type.as_deref().unwrap_or("Bearer"),
            expires_in
        );

        Ok(CachedToken {
            scope: scope.to_string(),
            access_token,
            expires_at: SystemTime::now() + Duration::from_secs(expires_in),
        })
    }
}

#[async_trait]
impl AuthProvider for OAuth2Client {
    async fn get_token(&self, scope: &str) -> Result<AccessToken> {
        if self.is_token_valid(scope).await {
            debug!("Using cached OAuth2 token");
            let token = self.cached_token.read().await;
            if let Some(ref cached) = *token {
                return Ok(cached.access_token.clone());
            }
        }

        if self.cached_token.read().await.is_some() {
            warn!("Cached token expired or issued for another scope, fetching new token");
        }
        let new_token = self.fetch_new_token(scope).await?;
        let access_token = new_token.access_token.clone();

        let mut cache = self.cached_token.write().await;
        *cache = Some(new_token);

        Ok(access_token)
    }
}
