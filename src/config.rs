//! Configuration management

use std::{path::Path, path::PathBuf, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Environment variable prefix for configuration overrides
pub const ENV_PREFIX: &str = "SSO_BROKER_";

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Token cache directory (default: `~/.aws/sso/cache`)
    pub cache_dir: Option<PathBuf>,
    /// Window before expiry in which a valid token is refreshed in the background
    #[serde(with = "humantime_serde")]
    pub staleness_margin: Duration,
    /// SSO OIDC client configuration
    pub oidc: OidcConfig,
    /// Retry configuration for blocking OIDC calls
    pub retry: RetryConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            cache_dir: None,
            staleness_margin: Duration::from_secs(15 * 60),
            oidc: OidcConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

/// SSO OIDC client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OidcConfig {
    /// Endpoint override; `{region}` is substituted.
    /// Defaults to `https://oidc.{region}.amazonaws.com`.
    pub endpoint_url: Option<String>,
    /// Client name sent with `RegisterClient`
    pub client_name: String,
    /// Per-request HTTP timeout
    #[serde(with = "humantime_serde")]
    pub http_timeout: Duration,
    /// Lower bound on the device-code polling interval the service asks for
    #[serde(with = "humantime_serde")]
    pub poll_interval_floor: Duration,
}

impl Default for OidcConfig {
    fn default() -> Self {
        Self {
            endpoint_url: None,
            client_name: "sso-token-broker".to_string(),
            http_timeout: Duration::from_secs(30),
            poll_interval_floor: Duration::from_secs(1),
        }
    }
}

impl OidcConfig {
    /// Base URL of the OIDC service for `region`
    #[must_use]
    pub fn endpoint_for(&self, region: &str) -> String {
        match &self.endpoint_url {
            Some(url) => url.replace("{region}", region),
            None => format!("https://oidc.{region}.amazonaws.com"),
        }
    }
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Enable retries
    pub enabled: bool,
    /// Maximum attempts, including the first
    pub max_attempts: u32,
    /// Initial backoff
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,
    /// Maximum backoff
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
    /// Backoff multiplier
    pub multiplier: f32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

impl BrokerConfig {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // SSO_BROKER_OIDC__CLIENT_NAME=... style overrides
        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        figment.extract().map_err(|e| Error::Config(e.to_string()))
    }

    /// Resolved token cache directory
    ///
    /// # Errors
    ///
    /// Returns an error if no cache directory is configured and the home
    /// directory cannot be determined.
    pub fn resolved_cache_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.cache_dir {
            return Ok(dir.clone());
        }
        let home = dirs::home_dir()
            .ok_or_else(|| Error::Config("Cannot determine home directory".to_string()))?;
        Ok(home.join(".aws").join("sso").join("cache"))
    }
}
