use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::Duration;
use tracing::{debug, info};

use super::types::{DatasetTarget, RefreshHistory, RefreshRecord, RefreshRequest};
use crate::auth::AccessToken;
use crate::error::{Error, Result};

pub const DEFAULT_API_BASE_URL: &str = "https://api.powerbi.com";

#[async_trait]
pub trait RefreshService: Send + Sync {
    /// Queue a refresh. Returns once the service has accepted it.
    async fn trigger_refresh(&self, token: &AccessToken, request: &RefreshRequest) -> Result<()>;

    /// Most recently started refresh of `target`, if the service lists any
    async fn latest_refresh(
        &self,
        token: &AccessToken,
        target: &DatasetTarget,
    ) -> Result<Option<RefreshRecord>>;
}

/// Power BI REST client for the dataset refresh endpoints
pub struct PowerBiClient {
    base_url: String,
    http_client: reqwest::Client,
}

impl PowerBiClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        Self::with_timeout(base_url, Duration::from_secs(30))
    }

    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http_client,
        })
    }

    fn refreshes_url(&self, target: &DatasetTarget) -> String {
        format!(
            "{}/v1.0/myorg/groups/{}/datasets/{}/refreshes",
            self.base_url, target.workspace_id, target.dataset_id
        )
    }
}

#[async_trait]
impl RefreshService for PowerBiClient {
    async fn trigger_refresh(&self, token: &AccessToken, request: &RefreshRequest) -> Result<()> {
        let url = self.refreshes_url(&request.target);
        debug!("Posting refresh request to {}", url);

        let response = self
            .http_client
            .post(&url)
            .bearer_auth(token.secret())
            .json(request)
            .send()
            .await
            .map_err(|e| Error::Connection(format!("Failed to send refresh request: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unable to read response body".to_string());
        info!("Trigger refresh response: {} - {}", status.as_u16(), body);

        if status != StatusCode::ACCEPTED {
            return Err(Error::Trigger {
                status: status.as_u16(),
                body,
            });
        }

        Ok(())
    }

    async fn latest_refresh(
        &self,
        token: &AccessToken,
        target: &DatasetTarget,
    ) -> Result<Option<RefreshRecord>> {
        let url = format!("{}?$top=1", self.refreshes_url(target));

        let response = self
            .http_client
            .get(&url)
            .bearer_auth(token.secret())
            .send()
            .await
            .map_err(|e| Error::Connection(format!("Failed to fetch refresh status: {}", e)))?;

        let status = response.status();
        if status != StatusCode::OK {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read response body".to_string());
            return Err(Error::StatusCheck {
                status: status.as_u16(),
                body,
            });
        }

        let history: RefreshHistory = response
            .json()
            .await
            .map_err(|e| Error::Parse(format!("Invalid refresh history response: {}", e)))?;

        Ok(history.latest())
    }
}
