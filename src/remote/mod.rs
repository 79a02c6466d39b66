//! Remote management API
//!
//! [`RemoteClient`] is the typed interface the dispatcher talks to;
//! [`XpipeClient`] implements it against the XPipe daemon's HTTP API.

mod http;
mod stream;
mod types;

use async_trait::async_trait;

use crate::error::RemoteError;

pub use http::{classify_status, classify_transport, CallKind, XpipeClient};
pub use stream::{spawn_websocket_io, SessionStream, StreamPeer, STREAM_BUFFER};
pub use types::{ConnectionDescriptor, ConnectionParams, ExecOutput, NewConnection, SessionHandle};

/// Operations against the remote management service.
///
/// Implementations apply their own bounded timeouts and report them as
/// [`RemoteError::Timeout`], distinct from [`RemoteError::Unreachable`].
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// All declared connections, ordered by name.
    async fn list_connections(&self) -> Result<Vec<ConnectionDescriptor>, RemoteError>;

    async fn get_connection(&self, id: &str) -> Result<ConnectionDescriptor, RemoteError>;

    /// Declare a new connection; returns its id.
    async fn add_connection(&self, new: &NewConnection) -> Result<String, RemoteError>;

    async fn remove_connection(&self, id: &str) -> Result<(), RemoteError>;

    /// Start a remote shell for `connection`.
    async fn open_session(
        &self,
        connection: &ConnectionDescriptor,
    ) -> Result<SessionHandle, RemoteError>;

    async fn close_session(&self, handle: &SessionHandle) -> Result<(), RemoteError>;

    /// Open the bidirectional frame stream of a session.
    async fn stream_session(&self, handle: &SessionHandle) -> Result<SessionStream, RemoteError>;

    /// Run one command in the session's shell.
    async fn exec(&self, handle: &SessionHandle, command: &str) -> Result<ExecOutput, RemoteError>;
}
