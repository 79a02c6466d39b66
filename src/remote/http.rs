//! XPipe HTTP API client
//!
//! Every call is a JSON `POST` against the daemon. The API key is exchanged
//! once for a session token via `/handshake`; later calls carry
//! `Authorization: Bearer <token>`. A rejected token is dropped and the
//! handshake is repeated once before the call fails with `AuthFailed`.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tracing::{debug, info};

use super::stream::{spawn_websocket_io, SessionStream};
use super::types::*;
use super::RemoteClient;
use crate::config::{ClientConfig, Credential, CLIENT_NAME};
use crate::error::RemoteError;

/// Longest error body echoed back in messages
const MAX_ERROR_BODY: usize = 200;

/// Which call an HTTP status belongs to, for the few codes whose meaning
/// depends on the endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Handshake,
    Query,
    Add,
    Remove,
    ShellStart,
    ShellStop,
    ShellExec,
    Stream,
}

/// Map a non-success HTTP status to the error taxonomy.
pub fn classify_status(status: StatusCode, message: String, call: CallKind) -> RemoteError {
    match status.as_u16() {
        401 | 403 => RemoteError::AuthFailed(message),
        404 | 410 if call == CallKind::ShellStop => RemoteError::AlreadyClosed(message),
        404 => RemoteError::NotFound(message),
        409 if call == CallKind::Remove => RemoteError::InUse(message),
        409 => RemoteError::Conflict(message),
        400 | 422 => RemoteError::Invalid(message),
        408 | 504 => RemoteError::Timeout(message),
        502 | 503 => RemoteError::Unreachable(message),
        _ => RemoteError::Protocol(format!("HTTP {}: {}", status.as_u16(), message)),
    }
}

/// Map a transport-level reqwest failure to the error taxonomy.
pub fn classify_transport(err: &reqwest::Error) -> RemoteError {
    if err.is_timeout() {
        RemoteError::Timeout(err.to_string())
    } else if err.is_connect() || err.is_request() {
        RemoteError::Unreachable(err.to_string())
    } else if err.is_decode() || err.is_body() {
        RemoteError::Protocol(err.to_string())
    } else {
        RemoteError::Unreachable(err.to_string())
    }
}

/// HTTP client for the XPipe daemon API
pub struct XpipeClient {
    http: reqwest::Client,
    config: ClientConfig,
    credential: Credential,
    token: Mutex<Option<String>>,
}

impl XpipeClient {
    pub fn new(config: ClientConfig, credential: Credential) -> Result<Self, RemoteError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .user_agent(format!("{}/{}", CLIENT_NAME, env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| RemoteError::Protocol(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            config,
            credential,
            token: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.api_url, path)
    }

    /// Cached session token, performing the handshake on first use.
    /// Returns the token and whether it was freshly obtained.
    async fn token(&self) -> Result<(String, bool), RemoteError> {
        let mut guard = self.token.lock().await;
        if let Some(token) = guard.as_ref() {
            return Ok((token.clone(), false));
        }
        let token = self.handshake().await?;
        *guard = Some(token.clone());
        Ok((token, true))
    }

    async fn handshake(&self) -> Result<String, RemoteError> {
        debug!("Performing API handshake with {}", self.config.api_url);
        let body = HandshakeRequest {
            auth: HandshakeAuth {
                kind: "ApiKey",
                key: self.credential.expose(),
            },
            client: HandshakeClient {
                kind: "Api",
                name: CLIENT_NAME,
            },
        };

        let response = self
            .http
            .post(self.url("/handshake"))
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_transport(&e))?;

        let text = read_body(response, CallKind::Handshake).await?;
        let parsed: HandshakeResponse = decode(&text)?;
        info!("API handshake complete");
        Ok(parsed.session_token)
    }

    /// Send an authorized request and return the response body.
    async fn send<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
        call: CallKind,
    ) -> Result<String, RemoteError> {
        let (token, fresh) = self.token().await?;
        match self.send_with_token(path, body, call, &token).await {
            Err(RemoteError::AuthFailed(msg)) => {
                *self.token.lock().await = None;
                if fresh {
                    return Err(RemoteError::AuthFailed(msg));
                }
                debug!("Session token rejected, repeating handshake");
                let (token, _) = self.token().await?;
                let result = self.send_with_token(path, body, call, &token).await;
                if matches!(result, Err(RemoteError::AuthFailed(_))) {
                    *self.token.lock().await = None;
                }
                result
            }
            other => other,
        }
    }

    async fn send_with_token<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
        call: CallKind,
        token: &str,
    ) -> Result<String, RemoteError> {
        debug!("POST {}", path);
        let response = self
            .http
            .post(self.url(path))
            .bearer_auth(token)
            .json(body)
            .send()
            .await
            .map_err(|e| classify_transport(&e))?;
        read_body(response, call).await
    }

    async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
        call: CallKind,
    ) -> Result<T, RemoteError> {
        let text = self.send(path, body, call).await?;
        decode(&text)
    }

    async fn info(&self, ids: &[String]) -> Result<Vec<ConnectionDescriptor>, RemoteError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let response: ConnectionInfoResponse = self
            .post(
                "/connection/info",
                &ConnectionInfoRequest { connections: ids },
                CallKind::Query,
            )
            .await?;
        Ok(response
            .infos
            .into_iter()
            .map(ConnectionDescriptor::from_info)
            .collect())
    }
}

async fn read_body(response: reqwest::Response, call: CallKind) -> Result<String, RemoteError> {
    let status = response.status();
    let text = response.text().await.map_err(|e| classify_transport(&e))?;
    if status.is_success() {
        return Ok(text);
    }
    Err(classify_status(status, error_message(&text, status), call))
}

fn error_message(body: &str, status: StatusCode) -> String {
    if let Ok(ErrorBody { message: Some(msg) }) = serde_json::from_str::<ErrorBody>(body) {
        return msg;
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return status
            .canonical_reason()
            .unwrap_or("no response body")
            .to_string();
    }
    trimmed.chars().take(MAX_ERROR_BODY).collect()
}

fn decode<T: DeserializeOwned>(text: &str) -> Result<T, RemoteError> {
    // Some endpoints answer with an empty body on success
    let text = if text.trim().is_empty() { "{}" } else { text };
    serde_json::from_str(text)
        .map_err(|e| RemoteError::Protocol(format!("Failed to decode response: {}", e)))
}

#[async_trait]
impl RemoteClient for XpipeClient {
    async fn list_connections(&self) -> Result<Vec<ConnectionDescriptor>, RemoteError> {
        let query: ConnectionQueryResponse = self
            .post(
                "/connection/query",
                &ConnectionQueryRequest {
                    category_filter: "*",
                    connection_filter: "*",
                    type_filter: "*",
                },
                CallKind::Query,
            )
            .await?;

        let mut connections = self.info(&query.found).await?;
        connections.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        Ok(connections)
    }

    async fn get_connection(&self, id: &str) -> Result<ConnectionDescriptor, RemoteError> {
        let ids = [id.to_string()];
        self.info(&ids)
            .await?
            .into_iter()
            .find(|c| c.id == id)
            .ok_or_else(|| RemoteError::NotFound(format!("connection {}", id)))
    }

    async fn add_connection(&self, new: &NewConnection) -> Result<String, RemoteError> {
        let response: ConnectionAddResponse = self
            .post(
                "/connection/add",
                &ConnectionAddRequest {
                    name: &new.name,
                    data: new.store_data(),
                    validate: new.validate,
                },
                CallKind::Add,
            )
            .await?;
        info!("Added connection {} ({})", new.name, response.connection);
        Ok(response.connection)
    }

    async fn remove_connection(&self, id: &str) -> Result<(), RemoteError> {
        self.send(
            "/connection/remove",
            &ConnectionRemoveRequest { connections: [id] },
            CallKind::Remove,
        )
        .await?;
        info!("Removed connection {}", id);
        Ok(())
    }

    async fn open_session(
        &self,
        connection: &ConnectionDescriptor,
    ) -> Result<SessionHandle, RemoteError> {
        let response: ShellStartResponse = self
            .post(
                "/shell/start",
                &ShellRequest {
                    connection: &connection.id,
                },
                CallKind::ShellStart,
            )
            .await?;

        let mut handle = SessionHandle::new(&connection.id, connection.kind);
        handle.shell_dialect = response.shell_dialect.map(|d| match d {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        });
        handle.os_type = response.os_type;
        handle.os_name = response.os_name;
        Ok(handle)
    }

    async fn close_session(&self, handle: &SessionHandle) -> Result<(), RemoteError> {
        self.send(
            "/shell/stop",
            &ShellRequest {
                connection: &handle.connection_id,
            },
            CallKind::ShellStop,
        )
        .await?;
        Ok(())
    }

    async fn stream_session(&self, handle: &SessionHandle) -> Result<SessionStream, RemoteError> {
        let (token, _) = self.token().await?;
        let url = format!(
            "{}/shell/stream?connection={}",
            self.config.ws_url(),
            handle.connection_id
        );

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| RemoteError::Invalid(format!("Bad stream URL {}: {}", url, e)))?;
        let auth = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|e| RemoteError::Protocol(e.to_string()))?;
        request.headers_mut().insert("Authorization", auth);

        let connect = tokio_tungstenite::connect_async(request);
        let (ws, _) = match tokio::time::timeout(self.config.connect_timeout, connect).await {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => return Err(classify_ws_error(e)),
            Err(_) => {
                return Err(RemoteError::Timeout(format!(
                    "stream open for {} exceeded {:?}",
                    handle.connection_id, self.config.connect_timeout
                )))
            }
        };

        info!("Session stream open for {}", handle.connection_id);
        Ok(spawn_websocket_io(ws, handle.connection_id.clone()))
    }

    async fn exec(&self, handle: &SessionHandle, command: &str) -> Result<ExecOutput, RemoteError> {
        let response: ShellExecResponse = self
            .post(
                "/shell/exec",
                &ShellExecRequest {
                    connection: &handle.connection_id,
                    command,
                },
                CallKind::ShellExec,
            )
            .await?;
        Ok(ExecOutput {
            exit_code: response.exit_code,
            stdout: response.stdout,
            stderr: response.stderr,
        })
    }
}

fn classify_ws_error(err: tokio_tungstenite::tungstenite::Error) -> RemoteError {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match err {
        WsError::Http(response) => {
            let status = StatusCode::from_u16(response.status().as_u16())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            classify_status(status, "stream upgrade rejected".to_string(), CallKind::Stream)
        }
        WsError::Io(e) => RemoteError::Unreachable(e.to_string()),
        WsError::Url(e) => RemoteError::Invalid(e.to_string()),
        other => RemoteError::Protocol(other.to_string()),
    }
}
