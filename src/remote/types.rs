//! Remote API types
//!
//! Domain types handed to the rest of the crate, plus the XPipe wire
//! request/response shapes (camelCase JSON).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::backend::BackendKind;

/// How to reach a connection's target
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Reference to the credential the daemon uses (identity type, key path, vault entry)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_ref: Option<String>,
}

/// A declared connection (host) on the daemon
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionDescriptor {
    /// XPipe connection UUID
    pub id: String,
    /// Name path joined with `/`
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub category: Vec<String>,
    pub kind: BackendKind,
    /// Raw XPipe store type id
    pub store_type: String,
    #[serde(default)]
    pub params: ConnectionParams,
}

impl ConnectionDescriptor {
    /// Last segment of the name path
    pub fn short_name(&self) -> &str {
        self.name.rsplit('/').next().unwrap_or(&self.name)
    }

    /// `user@address:port` when the parameters are known
    pub fn display_target(&self) -> Option<String> {
        let address = self.params.address.as_deref()?;
        let mut target = match &self.params.user {
            Some(user) => format!("{}@{}", user, address),
            None => address.to_string(),
        };
        if let Some(port) = self.params.port {
            target.push_str(&format!(":{}", port));
        }
        Some(target)
    }

    pub(crate) fn from_info(info: ConnectionInfo) -> Self {
        let kind = BackendKind::from_store_type(&info.store_type);
        let params = params_from_raw(&info.raw_data);
        Self {
            id: info.connection,
            name: info.name.join("/"),
            category: info.category,
            kind,
            store_type: info.store_type,
            params,
        }
    }
}

fn params_from_raw(raw: &Value) -> ConnectionParams {
    let str_field = |keys: &[&str]| {
        keys.iter()
            .find_map(|k| raw.get(*k).and_then(Value::as_str))
            .map(str::to_string)
    };

    let port = raw
        .get("port")
        .and_then(Value::as_u64)
        .and_then(|p| u16::try_from(p).ok());

    let auth_ref = raw.get("identity").and_then(|identity| match identity {
        Value::String(s) => Some(s.clone()),
        Value::Object(obj) => obj.get("type").and_then(Value::as_str).map(str::to_string),
        _ => None,
    });

    ConnectionParams {
        address: str_field(&["host", "address", "containerName", "podName"]),
        port,
        user: str_field(&["user", "username"]),
        auth_ref,
    }
}

/// Input for the add-operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewConnection {
    pub name: String,
    pub kind: BackendKind,
    pub params: ConnectionParams,
    /// Ask the daemon to test the connection before storing it
    pub validate: bool,
}

impl NewConnection {
    /// Store payload the daemon expects under `data`.
    pub fn store_data(&self) -> Value {
        let mut data = json!({ "type": self.kind.store_type() });
        let address_key = match self.kind {
            BackendKind::Docker => "containerName",
            BackendKind::Kubernetes => "podName",
            _ => "host",
        };
        if let Some(address) = &self.params.address {
            data[address_key] = json!(address);
        }
        if let Some(port) = self.params.port {
            data["port"] = json!(port);
        }
        if let Some(user) = &self.params.user {
            data["user"] = json!(user);
        }
        if let Some(identity) = &self.params.auth_ref {
            data["identity"] = json!({ "type": "file", "file": identity });
        }
        data
    }
}

/// A remote shell opened for a connection
#[derive(Debug, Clone)]
pub struct SessionHandle {
    /// Local id of this open
    pub handle_id: String,
    pub connection_id: String,
    pub kind: BackendKind,
    pub shell_dialect: Option<String>,
    pub os_type: Option<String>,
    pub os_name: Option<String>,
    stream_claimed: Arc<AtomicBool>,
}

impl SessionHandle {
    pub fn new(connection_id: impl Into<String>, kind: BackendKind) -> Self {
        Self {
            handle_id: Uuid::new_v4().to_string(),
            connection_id: connection_id.into(),
            kind,
            shell_dialect: None,
            os_type: None,
            os_name: None,
            stream_claimed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Claim the handle's single stream. Returns false if it was already taken.
    pub fn claim_stream(&self) -> bool {
        !self.stream_claimed.swap(true, Ordering::AcqRel)
    }
}

/// Result of a one-shot command
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Wire format
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct HandshakeRequest<'a> {
    pub auth: HandshakeAuth<'a>,
    pub client: HandshakeClient<'a>,
}

#[derive(Debug, Serialize)]
pub(crate) struct HandshakeAuth<'a> {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub key: &'a str,
}

#[derive(Debug, Serialize)]
pub(crate) struct HandshakeClient<'a> {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub name: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct HandshakeResponse {
    pub session_token: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ConnectionQueryRequest<'a> {
    pub category_filter: &'a str,
    pub connection_filter: &'a str,
    pub type_filter: &'a str,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ConnectionQueryResponse {
    #[serde(default)]
    pub found: Vec<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct ConnectionInfoRequest<'a> {
    pub connections: &'a [String],
}

#[derive(Debug, Deserialize)]
pub(crate) struct ConnectionInfoResponse {
    #[serde(default)]
    pub infos: Vec<ConnectionInfo>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ConnectionInfo {
    pub connection: String,
    #[serde(default)]
    pub category: Vec<String>,
    #[serde(default)]
    pub name: Vec<String>,
    #[serde(rename = "type", default)]
    pub store_type: String,
    #[serde(default)]
    pub raw_data: Value,
}

#[derive(Debug, Serialize)]
pub(crate) struct ConnectionAddRequest<'a> {
    pub name: &'a str,
    pub data: Value,
    pub validate: bool,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ConnectionAddResponse {
    pub connection: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct ConnectionRemoveRequest<'a> {
    pub connections: [&'a str; 1],
}

#[derive(Debug, Serialize)]
pub(crate) struct ShellRequest<'a> {
    pub connection: &'a str,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ShellStartResponse {
    #[serde(default)]
    pub shell_dialect: Option<Value>,
    #[serde(default)]
    pub os_type: Option<String>,
    #[serde(default)]
    pub os_name: Option<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct ShellExecRequest<'a> {
    pub connection: &'a str,
    pub command: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ShellExecResponse {
    pub exit_code: i32,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ErrorBody {
    #[serde(default)]
    pub message: Option<String>,
}
