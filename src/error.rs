//! Error taxonomy
//!
//! Every component has its own `thiserror` enum; [`XpctlError`] wraps them so
//! the CLI can render a single line and pick an exit code.

use thiserror::Error;

/// Name of the canonical API key environment variable.
pub const API_KEY_VAR: &str = "XPCTL_API_KEY";

/// Local configuration errors. Fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("API key not found: set XPCTL_API_KEY (or add `api_key` to the config file)")]
    MissingKey,

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Failed to read configuration file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors returned by the remote management API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    #[error("XPipe API unreachable: {0}")]
    Unreachable(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Connection in use: {0}")]
    InUse(String),

    #[error("Invalid request: {0}")]
    Invalid(String),

    #[error("Session already closed: {0}")]
    AlreadyClosed(String),

    #[error("Unexpected API response: {0}")]
    Protocol(String),
}

impl RemoteError {
    /// Network-level failures the dispatcher may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Unreachable(_))
    }

    /// `host` is the short name of more than one connection.
    pub fn ambiguous(host: &str, first: &str, second: &str) -> Self {
        Self::Invalid(format!(
            "'{}' is ambiguous ({}, {}, ...); use the full name",
            host, first, second
        ))
    }
}

/// Session registry errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("Session already active for connection {connection_id} (session {session_id})")]
    AlreadyActive {
        connection_id: String,
        session_id: String,
    },
}

/// Errors on a session's lifecycle or stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("Not connected to {0}")]
    NotConnected(String),

    #[error("Session stream already closed: {0}")]
    AlreadyClosed(String),

    #[error("Interrupted")]
    Interrupted,

    #[error("Session stream error: {0}")]
    Stream(String),
}

/// Top-level error surfaced to the CLI.
#[derive(Debug, Error)]
pub enum XpctlError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl XpctlError {
    /// Process exit code for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Config(_) => 2,
            _ => 1,
        }
    }
}

impl serde::Serialize for XpctlError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

pub type Result<T, E = XpctlError> = std::result::Result<T, E>;
