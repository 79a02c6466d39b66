//! Configuration Types
//!
//! Client settings layered as: built-in defaults, JSON config file,
//! environment overrides, then command line flags (applied by the CLI).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ConfigError;

/// Default XPipe daemon API endpoint
pub const DEFAULT_API_URL: &str = "http://localhost:21721";

/// Environment variable overriding the API URL
pub const API_URL_VAR: &str = "XPCTL_API_URL";

/// Environment variable overriding the config file location
pub const CONFIG_PATH_VAR: &str = "XPCTL_CONFIG";

/// Client name announced during the API handshake
pub const CLIENT_NAME: &str = "xpctl";

/// Contents of the config file. Every field is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConfigFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_timeout_secs: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_timeout_secs: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_backoff_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub close_grace_secs: Option<u64>,
}

impl ConfigFile {
    /// Load from `path`. A missing file yields an empty config.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = match std::fs::read_to_string(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No config file at {}", path.display());
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Io {
                    path: path.display().to_string(),
                    source: e,
                })
            }
        };

        serde_json::from_str(&data).map_err(|e| {
            ConfigError::Invalid(format!("{}: {}", path.display(), e))
        })
    }
}

/// Effective client settings
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// Base URL of the XPipe API
    pub api_url: String,
    /// Per-request timeout (whole round trip)
    pub request_timeout: Duration,
    /// TCP/TLS connect timeout
    pub connect_timeout: Duration,
    /// Pause before the single retry of a network failure
    pub retry_backoff: Duration,
    /// How long teardown waits for the remote to acknowledge a close
    pub close_grace: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            request_timeout: Duration::from_secs(default_request_timeout_secs()),
            connect_timeout: Duration::from_secs(default_connect_timeout_secs()),
            retry_backoff: Duration::from_millis(default_retry_backoff_ms()),
            close_grace: Duration::from_secs(default_close_grace_secs()),
        }
    }
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_connect_timeout_secs() -> u64 {
    5
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_close_grace_secs() -> u64 {
    3
}

impl ClientConfig {
    /// Apply the config file on top of the defaults.
    pub fn from_file(file: &ConfigFile) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(url) = &file.api_url {
            config.set_api_url(url)?;
        }
        if let Some(secs) = file.request_timeout_secs {
            config.request_timeout = positive_secs("request_timeout_secs", secs)?;
        }
        if let Some(secs) = file.connect_timeout_secs {
            config.connect_timeout = positive_secs("connect_timeout_secs", secs)?;
        }
        if let Some(ms) = file.retry_backoff_ms {
            config.retry_backoff = Duration::from_millis(ms);
        }
        if let Some(secs) = file.close_grace_secs {
            config.close_grace = Duration::from_secs(secs);
        }
        Ok(config)
    }

    /// Apply environment overrides through a variable lookup.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(API_URL_VAR).filter(|v| !v.trim().is_empty()) {
            self.set_api_url(&url)?;
        }
        Ok(())
    }

    /// Set the API URL after validating its scheme.
    pub fn set_api_url(&mut self, url: &str) -> Result<(), ConfigError> {
        let url = url.trim().trim_end_matches('/');
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ConfigError::Invalid(format!(
                "api_url must start with http:// or https://, got '{}'",
                url
            )));
        }
        self.api_url = url.to_string();
        Ok(())
    }

    /// WebSocket base URL matching `api_url`.
    pub fn ws_url(&self) -> String {
        if let Some(rest) = self.api_url.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = self.api_url.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            self.api_url.clone()
        }
    }
}

fn positive_secs(field: &str, secs: u64) -> Result<Duration, ConfigError> {
    if secs == 0 {
        return Err(ConfigError::Invalid(format!("{} must be greater than 0", field)));
    }
    Ok(Duration::from_secs(secs))
}

/// Default config file location (`<config dir>/xpctl/config.json`).
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("xpctl").join("config.json"))
}
