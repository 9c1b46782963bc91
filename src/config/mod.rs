use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

use crate::auth::POWERBI_SCOPE;
use crate::coordinator::validate_parameters;
use crate::error::{Error, Result};
use crate::refresh::{DatasetTarget, RefreshObjectRef, DEFAULT_API_BASE_URL};

pub const ENV_CLIENT_ID: &str = "POWERBI_CLIENT_ID";
pub const ENV_CLIENT_SECRET: &str = "POWERBI_CLIENT_SECRET";
pub const ENV_TENANT_ID: &str = "POWERBI_TENANT_ID";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub oauth2client: OAuth2ClientConfig,
    pub powerbi: PowerBiConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub objects: Vec<RefreshObjectRef>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AgentConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

/// Application identity used for the client credentials grant
#[derive(Clone, Deserialize, Serialize)]
pub struct OAuth2ClientConfig {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default)]
    pub tenant_id: String,
    #[serde(default = "default_authority_host")]
    pub authority_host: String,
    #[serde(default)]
    pub endpoint_params: HashMap<String, String>,
}

impl Default for OAuth2ClientConfig {
    fn default() -> Self {
        Self::new("", "", "")
    }
}

impl OAuth2ClientConfig {
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        tenant_id: impl Into<String>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            tenant_id: tenant_id.into(),
            authority_host: default_authority_host(),
            endpoint_params: HashMap::new(),
        }
    }

    pub fn token_url(&self) -> String {
        format!(
            "{}/{}/oauth2/v2.0/token",
            self.authority_host.trim_end_matches('/'),
            self.tenant_id
        )
    }
}

impl fmt::Debug for OAuth2ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuth2ClientConfig")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("tenant_id", &self.tenant_id)
            .field("authority_host", &self.authority_host)
            .field("endpoint_params", &self.endpoint_params.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PowerBiConfig {
    pub workspace_id: String,
    pub dataset_id: String,
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    #[serde(default = "default_scope")]
    pub scope: String,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PollingConfig {
    #[serde(default = "default_poll_interval")]
    pub interval_seconds: u64,
    pub max_wait_seconds: Option<u64>,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_poll_interval(),
            max_wait_seconds: None,
        }
    }
}

impl PollingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    pub fn max_wait(&self) -> Option<Duration> {
        self.max_wait_seconds.map(Duration::from_secs)
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_authority_host() -> String {
    "https://login.microsoftonline.com".to_string()
}

fn default_api_base_url() -> String {
    DEFAULT_API_BASE_URL.to_string()
}

fn default_scope() -> String {
    POWERBI_SCOPE.to_string()
}

fn default_timeout() -> u64 {
    30
}

fn default_poll_interval() -> u64 {
    10
}

impl Config {
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .await
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let mut config: Config = toml::from_str(&contents)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;

        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub async fn load_from_default_locations() -> Result<Self> {
        let locations = vec![
            PathBuf::from("/etc/powerbi-refresh/agent.toml"),
            dirs::config_dir()
                .map(|d| d.join("powerbi-refresh/agent.toml"))
                .unwrap_or_default(),
            dirs::home_dir()
                .map(|d| d.join(".powerbi-refresh/agent.toml"))
                .unwrap_or_default(),
            PathBuf::from("./agent.toml"),
        ];

        for path in locations {
            if path.is_file() {
                tracing::info!("Loading config from: {:?}", path);
                return Self::load(path).await;
            }
        }

        Err(Error::Config(
            "No configuration file found in default locations".to_string(),
        ))
    }

    /// Fill identity fields from the environment so secrets can stay out of the file
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let overrides = [
            (ENV_CLIENT_ID, &mut self.oauth2client.client_id),
            (ENV_CLIENT_SECRET, &mut self.oauth2client.client_secret),
            (ENV_TENANT_ID, &mut self.oauth2client.tenant_id),
        ];

        for (key, field) in overrides {
            if let Some(value) = lookup(key).filter(|v| !v.trim().is_empty()) {
                tracing::debug!("Using {} from environment", key);
                *field = value;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_parameters(&self.oauth2client, &self.target(), &self.objects)?;

        if self.polling.interval_seconds == 0 {
            return Err(Error::Config(
                "polling.interval_seconds must be at least 1".to_string(),
            ));
        }

        if self.polling.max_wait_seconds == Some(0) {
            return Err(Error::Config(
                "polling.max_wait_seconds must be greater than 0".to_string(),
            ));
        }

        if self.powerbi.timeout_seconds == 0 {
            return Err(Error::Config(
                "powerbi.timeout_seconds must be greater than 0".to_string(),
            ));
        }

        for (name, url) in [
            ("oauth2client.authority_host", &self.oauth2client.authority_host),
            ("powerbi.api_base_url", &self.powerbi.api_base_url),
        ] {
            if !(url.starts_with("https://") || url.starts_with("http://")) {
                return Err(Error::Config(format!(
                    "{} must be an http(s) URL, got '{}'",
                    name, url
                )));
            }
        }

        Ok(())
    }

    pub fn target(&self) -> DatasetTarget {
        DatasetTarget::new(&self.powerbi.workspace_id, &self.powerbi.dataset_id)
    }
}
