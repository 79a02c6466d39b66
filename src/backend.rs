//! Backend kinds
//!
//! Transport family of a connection. Each kind carries the same capability
//! set; behaviour that differs per backend is selected by matching on the
//! kind, never by a trait object per backend.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Transport/protocol family of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Ssh,
    Docker,
    Kubernetes,
    /// Any other XPipe connection type with a shell (local, WSL, VMs, ...)
    Other,
}

/// What a backend supports on an open session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Accepts in-band window size changes
    pub resize: bool,
    /// Accepts one-shot command execution
    pub exec: bool,
}

impl BackendKind {
    pub fn capabilities(self) -> Capabilities {
        match self {
            Self::Ssh => Capabilities {
                resize: true,
                exec: true,
            },
            Self::Docker => Capabilities {
                resize: true,
                exec: true,
            },
            // kubectl exec resize needs a separate channel the daemon doesn't forward
            Self::Kubernetes => Capabilities {
                resize: false,
                exec: true,
            },
            Self::Other => Capabilities {
                resize: false,
                exec: true,
            },
        }
    }

    pub fn supports_resize(self) -> bool {
        self.capabilities().resize
    }

    /// Classify a raw XPipe store type id, e.g. `ssh`, `customSsh`,
    /// `dockerContainer`, `k8sPod`.
    pub fn from_store_type(type_id: &str) -> Self {
        let lower = type_id.to_ascii_lowercase();
        if lower.contains("ssh") {
            Self::Ssh
        } else if lower.contains("docker") || lower.contains("podman") {
            Self::Docker
        } else if lower.contains("k8s") || lower.contains("kube") {
            Self::Kubernetes
        } else {
            Self::Other
        }
    }

    /// Store type used when adding a connection of this kind.
    pub fn store_type(self) -> &'static str {
        match self {
            Self::Ssh => "ssh",
            Self::Docker => "dockerContainer",
            Self::Kubernetes => "k8sPod",
            Self::Other => "local",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ssh => "ssh",
            Self::Docker => "docker",
            Self::Kubernetes => "kubernetes",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ssh" => Ok(Self::Ssh),
            "docker" => Ok(Self::Docker),
            "kubernetes" | "k8s" => Ok(Self::Kubernetes),
            other => Err(format!(
                "unknown backend kind '{}' (expected ssh, docker or kubernetes)",
                other
            )),
        }
    }
}
