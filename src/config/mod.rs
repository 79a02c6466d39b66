//! Configuration Management Module
//!
//! Client settings and API key resolution.
//!
//! Settings layer in this order, later wins: defaults, config file,
//! environment, command line flags.
//!
//! API key sources, first match wins:
//! - `XPCTL_API_KEY`
//! - `XPIPE_API_KEY`, `API_KEY` (deprecated, logged)
//! - `api_key` in the config file

pub mod credential;
pub mod types;

use std::path::Path;

use tracing::debug;

use crate::error::ConfigError;

pub use credential::{resolve_with, Credential, DEPRECATED_KEY_VARS};
pub use types::{
    default_config_path, ClientConfig, ConfigFile, API_URL_VAR, CLIENT_NAME, CONFIG_PATH_VAR,
    DEFAULT_API_URL,
};

/// Everything needed to talk to the daemon
#[derive(Debug, Clone)]
pub struct Settings {
    pub client: ClientConfig,
    pub credential: Credential,
}

/// Load settings through a variable lookup.
///
/// `config_path` of `None` means the default location. Fails before any
/// network activity when no API key is available.
pub fn load_settings<F>(
    config_path: Option<&Path>,
    api_url: Option<&str>,
    lookup: F,
) -> Result<Settings, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let default_path = default_config_path();
    let file = match config_path.or(default_path.as_deref()) {
        Some(path) => {
            debug!("Loading config from {}", path.display());
            ConfigFile::load(path)?
        }
        None => ConfigFile::default(),
    };

    let mut client = ClientConfig::from_file(&file)?;
    client.apply_env(&lookup)?;
    if let Some(url) = api_url {
        client.set_api_url(url)?;
    }

    let credential = resolve_with(&lookup, file.api_key.as_deref())?;
    Ok(Settings { client, credential })
}
