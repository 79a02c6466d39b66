//! API key resolution
//!
//! Lookup order: `XPCTL_API_KEY`, then the deprecated `XPIPE_API_KEY` and
//! `API_KEY`, then the `api_key` field of the config file.

use std::fmt;

use tracing::warn;
use zeroize::Zeroizing;

use crate::error::{ConfigError, API_KEY_VAR};

/// Deprecated variable names still honoured, in lookup order.
pub const DEPRECATED_KEY_VARS: &[&str] = &["XPIPE_API_KEY", "API_KEY"];

/// Resolved API key. Wiped from memory on drop.
#[derive(Clone)]
pub struct Credential(Zeroizing<String>);

impl Credential {
    pub fn new(key: impl Into<String>) -> Self {
        Self(Zeroizing::new(key.into()))
    }

    pub fn expose(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

/// Resolve the key through an arbitrary variable lookup.
pub fn resolve_with<F>(lookup: F, config_key: Option<&str>) -> Result<Credential, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(key) = non_empty(lookup(API_KEY_VAR)) {
        return Ok(Credential::new(key));
    }

    for var in DEPRECATED_KEY_VARS {
        if let Some(key) = non_empty(lookup(var)) {
            warn!(
                "{} is deprecated, set {} instead",
                var, API_KEY_VAR
            );
            return Ok(Credential::new(key));
        }
    }

    non_empty(config_key.map(str::to_string))
        .map(Credential::new)
        .ok_or(ConfigError::MissingKey)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
