//! Command Dispatcher
//!
//! Maps user operations onto [`RemoteClient`] calls and [`SessionRegistry`]
//! updates. Connect and disconnect on the same connection are serialized
//! by a per-connection async mutex, so the registry's at-most-one rule is
//! never raced in-process.

mod retry;
mod status;

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bridge::{run_bridge, BridgeOptions, BridgeOutcome, LocalTerminal, DETACH_KEY};
use crate::config::ClientConfig;
use crate::error::{RegistryError, RemoteError, Result, SessionError};
use crate::remote::{ConnectionDescriptor, ExecOutput, NewConnection, RemoteClient};
use crate::session::{Session, SessionRegistry};

pub use retry::{with_retry, with_retry_unsent, RetryPolicy};
pub use status::{format_uptime, render_table, HostStatus, IDLE};

/// `info` result
#[derive(Debug, Clone, Serialize)]
pub struct HostInfo {
    pub connection: ConnectionDescriptor,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<Session>,
}

pub struct Dispatcher {
    client: Arc<dyn RemoteClient>,
    registry: Arc<SessionRegistry>,
    retry: RetryPolicy,
    close_grace: Duration,
    host_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl Dispatcher {
    pub fn new(
        client: Arc<dyn RemoteClient>,
        registry: Arc<SessionRegistry>,
        config: &ClientConfig,
    ) -> Self {
        Self {
            client,
            registry,
            retry: RetryPolicy::from_config(config),
            close_grace: config.close_grace,
            host_locks: DashMap::new(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_close_grace(mut self, close_grace: Duration) -> Self {
        self.close_grace = close_grace;
        self
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Open a session for `host`, or return the one already active.
    pub async fn connect(&self, host: &str) -> Result<Session> {
        if let Some(session) = self.registry.find(host)? {
            if session.is_active() {
                debug!("Reusing session {} for {}", session.id, host);
                return Ok(session);
            }
        }

        let connection = self.resolve(host).await?;
        let lock = self.host_lock(&connection.id);
        let result = {
            let _guard = lock.lock().await;
            self.open_locked(&connection).await
        };
        drop(lock);
        if result.is_err() {
            self.release_host_lock(&connection.id);
        }
        result
    }

    /// Open and register a session. Caller holds the host lock.
    async fn open_locked(&self, connection: &ConnectionDescriptor) -> Result<Session> {
        if let Some(existing) = self.registry.lookup(&connection.id) {
            if existing.is_active() {
                return Ok(existing);
            }
            if !existing.state.is_terminal() {
                return Err(RegistryError::AlreadyActive {
                    connection_id: existing.connection_id,
                    session_id: existing.id,
                }
                .into());
            }
        }

        let handle = with_retry(self.retry, "open session", || {
            self.client.open_session(connection)
        })
        .await?;

        let session = match self.registry.register(connection, handle.clone()) {
            Ok(session) => session,
            Err(conflict) => {
                // Lost a race: keep the registered session, drop ours
                warn!("{}; closing duplicate remote session", conflict);
                if let Err(e) = self.client.close_session(&handle).await {
                    debug!("Closing duplicate session failed: {}", e);
                }
                return self
                    .registry
                    .lookup(&connection.id)
                    .ok_or_else(|| conflict.into());
            }
        };

        let session = self.registry.activate(&connection.id).unwrap_or(session);
        info!("Connected to {} (session {})", connection.name, session.id);
        Ok(session)
    }

    /// Close the session for `host`. Returns `None` when there was none.
    ///
    /// The registry entry is removed even if the remote close fails.
    pub async fn disconnect(&self, host: &str) -> Result<Option<Session>> {
        let connection_id = match self.registry.find(host)? {
            Some(session) => session.connection_id,
            None => {
                debug!("Disconnect {}: no session", host);
                return Ok(None);
            }
        };

        let lock = self.host_lock(&connection_id);
        let removed = {
            let _guard = lock.lock().await;
            self.close_locked(&connection_id).await
        };
        drop(lock);
        self.release_host_lock(&connection_id);
        Ok(removed)
    }

    /// Close and unregister a session. Caller holds the host lock.
    async fn close_locked(&self, connection_id: &str) -> Option<Session> {
        let session = self.registry.lookup(connection_id)?;

        if !session.state.is_terminal() {
            self.registry.begin_closing(connection_id);
            match self.close_remote(&session).await {
                Ok(()) => {
                    self.registry.mark_closed(connection_id, None);
                }
                Err(e) => {
                    warn!("Closing {} failed: {}", session.connection_name, e);
                    self.registry.mark_closed(connection_id, Some(e.to_string()));
                }
            }
        }

        let removed = self.registry.unregister(connection_id);
        info!("Disconnected from {}", session.connection_name);
        removed.or(Some(session))
    }

    /// Declared hosts joined with live sessions.
    pub async fn list(&self) -> Result<Vec<HostStatus>> {
        let connections = with_retry(self.retry, "list connections", || {
            self.client.list_connections()
        })
        .await?;
        let mut sessions = self.registry.list_active();

        let mut rows: Vec<HostStatus> = connections
            .iter()
            .map(|connection| {
                match sessions
                    .iter()
                    .position(|s| s.connection_id == connection.id)
                {
                    Some(index) => HostStatus::with_session(connection, &sessions.remove(index)),
                    None => HostStatus::idle(connection),
                }
            })
            .collect();

        rows.extend(sessions.iter().map(HostStatus::orphan));
        Ok(rows)
    }

    /// Run `command` on the host's active session.
    pub async fn exec(&self, host: &str, command: &str) -> Result<ExecOutput> {
        self.exec_cancellable(host, command, &CancellationToken::new())
            .await
    }

    /// Like [`exec`](Self::exec), aborted when `interrupt` fires.
    ///
    /// An interrupt forces the session closed within the grace period.
    pub async fn exec_cancellable(
        &self,
        host: &str,
        command: &str,
        interrupt: &CancellationToken,
    ) -> Result<ExecOutput> {
        let session = self.active_session(host)?;
        let closing = self
            .registry
            .cancel_token(&session.connection_id)
            .unwrap_or_default();

        debug!("exec on {}: {}", session.connection_name, command);
        let call = with_retry_unsent(self.retry, "exec", || {
            self.client.exec(&session.handle, command)
        });

        tokio::select! {
            result = call => Ok(result?),
            _ = interrupt.cancelled() => {
                info!("exec on {} interrupted", session.connection_name);
                self.disconnect(&session.connection_id).await?;
                Err(SessionError::Interrupted.into())
            }
            _ = closing.cancelled() => {
                Err(SessionError::NotConnected(session.connection_name.clone()).into())
            }
        }
    }

    /// Describe a host and its session, if any.
    pub async fn info(&self, host: &str) -> Result<HostInfo> {
        let connection = self.resolve(host).await?;
        let session = self.registry.lookup(&connection.id);
        Ok(HostInfo {
            connection,
            session,
        })
    }

    /// Declare a new connection. Returns its id.
    pub async fn add(&self, new: &NewConnection) -> Result<String> {
        let id = with_retry_unsent(self.retry, "add connection", || {
            self.client.add_connection(new)
        })
        .await?;
        info!("Added connection {} ({})", new.name, id);
        Ok(id)
    }

    /// Remove a connection. Refused while it has a live session.
    pub async fn remove(&self, host: &str) -> Result<ConnectionDescriptor> {
        self.ensure_unused(host)?;
        let connection = self.resolve(host).await?;
        self.ensure_unused(&connection.id)?;

        with_retry(self.retry, "remove connection", || {
            self.client.remove_connection(&connection.id)
        })
        .await?;
        info!("Removed connection {}", connection.name);
        Ok(connection)
    }

    /// Connect and bridge `terminal` to the session until either side ends.
    pub async fn shell<R, W>(&self, host: &str, terminal: LocalTerminal<R, W>) -> Result<BridgeOutcome>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let session = self.connect(host).await?;
        if !session.handle.claim_stream() {
            return Err(SessionError::AlreadyClosed(session.connection_name).into());
        }

        let stream = match self.client.stream_session(&session.handle).await {
            Ok(stream) => stream,
            Err(e) => {
                self.fail(&session, e.to_string()).await;
                return Err(e.into());
            }
        };

        let options = BridgeOptions {
            supports_resize: session.kind.supports_resize(),
            detach_key: Some(DETACH_KEY),
        };
        let outcome = run_bridge(terminal, stream, options).await;

        match &outcome {
            BridgeOutcome::RemoteClosed { exit_code } => {
                debug!("{} closed by remote, exit {:?}", session.connection_name, exit_code);
                self.registry.mark_closed(&session.connection_id, None);
                if let Err(e) = self.close_remote(&session).await {
                    debug!("Close after remote exit: {}", e);
                }
                self.registry.unregister(&session.connection_id);
                self.release_host_lock(&session.connection_id);
            }
            BridgeOutcome::Interrupted | BridgeOutcome::LocalEof => {
                self.disconnect(&session.connection_id).await?;
            }
            BridgeOutcome::Failed(message) => {
                self.fail(&session, message.clone()).await;
            }
        }
        Ok(outcome)
    }

    /// Resolve `host` to a declared connection: id or full name first,
    /// then unique short name.
    async fn resolve(&self, host: &str) -> Result<ConnectionDescriptor, RemoteError> {
        let connections = with_retry(self.retry, "list connections", || {
            self.client.list_connections()
        })
        .await?;

        if let Some(exact) = connections
            .iter()
            .find(|c| c.id == host || c.name == host)
        {
            return Ok(exact.clone());
        }

        let mut matches = connections.into_iter().filter(|c| c.short_name() == host);
        match (matches.next(), matches.next()) {
            (Some(found), None) => Ok(found),
            (Some(a), Some(b)) => Err(RemoteError::ambiguous(host, &a.name, &b.name)),
            (None, _) => Err(RemoteError::NotFound(format!("no connection named '{}'", host))),
        }
    }

    fn active_session(&self, host: &str) -> Result<Session> {
        self.registry
            .find(host)?
            .filter(Session::is_active)
            .ok_or_else(|| SessionError::NotConnected(host.to_string()).into())
    }

    fn ensure_unused(&self, host: &str) -> Result<(), RemoteError> {
        match self.registry.find(host)? {
            Some(session) if !session.state.is_terminal() => Err(RemoteError::InUse(format!(
                "{} has a live session; disconnect first",
                session.connection_name
            ))),
            _ => Ok(()),
        }
    }

    /// `close_session` bounded by the grace period.
    async fn close_remote(&self, session: &Session) -> Result<(), RemoteError> {
        match tokio::time::timeout(self.close_grace, self.client.close_session(&session.handle)).await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(RemoteError::AlreadyClosed(_))) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(RemoteError::Timeout(format!(
                "close of {} exceeded {:?}",
                session.connection_name, self.close_grace
            ))),
        }
    }

    async fn fail(&self, session: &Session, message: String) {
        warn!("Session {} failed: {}", session.connection_name, message);
        self.registry.mark_failed(&session.connection_id, message);
        if let Err(e) = self.close_remote(session).await {
            debug!("Close after failure: {}", e);
        }
        self.registry.unregister(&session.connection_id);
        self.release_host_lock(&session.connection_id);
    }

    fn host_lock(&self, connection_id: &str) -> Arc<Mutex<()>> {
        self.host_locks
            .entry(connection_id.to_string())
            .or_default()
            .clone()
    }

    /// Drop the host's lock entry unless someone else still holds it.
    fn release_host_lock(&self, connection_id: &str) {
        self.host_locks
            .remove_if(connection_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendKind;
    use crate::remote::{ConnectionParams, SessionHandle, SessionStream};
    use crate::session::SessionState;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeRemote {
        connections: Vec<ConnectionDescriptor>,
        opens: AtomicUsize,
        execs: AtomicUsize,
        removes: AtomicUsize,
    }

    impl FakeRemote {
        fn new(names: &[(&str, &str)]) -> Self {
            Self {
                connections: names
                    .iter()
                    .map(|(id, name)| ConnectionDescriptor {
                        id: id.to_string(),
                        name: name.to_string(),
                        category: Vec::new(),
                        kind: BackendKind::Ssh,
                        store_type: "ssh".to_string(),
                        params: ConnectionParams::default(),
                    })
                    .collect(),
                opens: AtomicUsize::new(0),
                execs: AtomicUsize::new(0),
                removes: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl RemoteClient for FakeRemote {
        async fn list_connections(&self) -> Result<Vec<ConnectionDescriptor>, RemoteError> {
            Ok(self.connections.clone())
        }

        async fn get_connection(&self, id: &str) -> Result<ConnectionDescriptor, RemoteError> {
            self.connections
                .iter()
                .find(|c| c.id == id)
                .cloned()
                .ok_or_else(|| RemoteError::NotFound(id.to_string()))
        }

        async fn add_connection(&self, _new: &NewConnection) -> Result<String, RemoteError> {
            Ok("new-id".to_string())
        }

        async fn remove_connection(&self, _id: &str) -> Result<(), RemoteError> {
            self.removes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn open_session(
            &self,
            connection: &ConnectionDescriptor,
        ) -> Result<SessionHandle, RemoteError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            Ok(SessionHandle::new(connection.id.clone(), connection.kind))
        }

        async fn close_session(&self, _handle: &SessionHandle) -> Result<(), RemoteError> {
            Err(RemoteError::Unreachable("daemon went away".to_string()))
        }

        async fn stream_session(
            &self,
            _handle: &SessionHandle,
        ) -> Result<SessionStream, RemoteError> {
            Err(RemoteError::Protocol("no streams here".to_string()))
        }

        async fn exec(
            &self,
            _handle: &SessionHandle,
            command: &str,
        ) -> Result<ExecOutput, RemoteError> {
            self.execs.fetch_add(1, Ordering::SeqCst);
            if command == "hang" {
                std::future::pending::<()>().await;
            }
            Ok(ExecOutput {
                exit_code: 0,
                stdout: format!("ran {}\n", command),
                stderr: String::new(),
            })
        }
    }

    fn dispatcher(remote: Arc<FakeRemote>) -> Dispatcher {
        Dispatcher::new(remote, Arc::new(SessionRegistry::new()), &ClientConfig::default())
            .with_retry_policy(RetryPolicy::none())
            .with_close_grace(Duration::from_millis(50))
    }

    #[tokio::test]
    async fn test_connect_resolves_short_name() {
        let remote = Arc::new(FakeRemote::new(&[("c1", "prod/db1"), ("c2", "prod/web")]));
        let d = dispatcher(remote.clone());

        let session = d.connect("db1").await.unwrap();
        assert_eq!(session.connection_id, "c1");
        assert_eq!(session.state, SessionState::Active);

        let again = d.connect("prod/db1").await.unwrap();
        assert_eq!(again.id, session.id);
        assert_eq!(remote.opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_ambiguous_short_name() {
        let remote = Arc::new(FakeRemote::new(&[("c1", "prod/db1"), ("c2", "test/db1")]));
        let d = dispatcher(remote);
        let err = d.connect("db1").await.unwrap_err();
        assert!(err.to_string().contains("ambiguous"), "{}", err);
    }

    #[tokio::test]
    async fn test_connected_twins_need_full_name() {
        let remote = Arc::new(FakeRemote::new(&[("c1", "prod/db1"), ("c2", "test/db1")]));
        let d = dispatcher(remote.clone());
        d.connect("prod/db1").await.unwrap();
        d.connect("test/db1").await.unwrap();

        let is_ambiguous = |err: crate::error::XpctlError| {
            matches!(err, crate::error::XpctlError::Remote(RemoteError::Invalid(ref m)) if m.contains("ambiguous"))
        };
        assert!(is_ambiguous(d.connect("db1").await.unwrap_err()));
        assert!(is_ambiguous(d.disconnect("db1").await.unwrap_err()));
        assert!(is_ambiguous(d.exec("db1", "uptime").await.unwrap_err()));
        assert_eq!(d.registry().len(), 2);
        assert_eq!(remote.execs.load(Ordering::SeqCst), 0);

        let closed = d.disconnect("test/db1").await.unwrap().unwrap();
        assert_eq!(closed.connection_id, "c2");
        // With one session left the short name is unique again
        assert_eq!(d.exec("db1", "uptime").await.unwrap().stdout, "ran uptime\n");
    }

    #[tokio::test]
    async fn test_host_locks_released() {
        let remote = Arc::new(FakeRemote::new(&[("c1", "db1"), ("c2", "web")]));
        let d = dispatcher(remote);

        d.connect("db1").await.unwrap();
        d.connect("web").await.unwrap();
        d.disconnect("db1").await.unwrap();
        d.disconnect("web").await.unwrap();
        assert!(d.host_locks.is_empty());

        // Disconnecting an idle host leaves nothing behind either
        d.disconnect("db1").await.unwrap();
        assert!(d.host_locks.is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_unregisters_when_close_fails() {
        let remote = Arc::new(FakeRemote::new(&[("c1", "db1")]));
        let d = dispatcher(remote);

        d.connect("db1").await.unwrap();
        let closed = d.disconnect("db1").await.unwrap().unwrap();
        assert_eq!(closed.state, SessionState::Closed);
        assert!(closed.error.is_some());
        assert!(d.registry().is_empty());
    }

    #[tokio::test]
    async fn test_remove_refused_while_connected() {
        let remote = Arc::new(FakeRemote::new(&[("c1", "db1")]));
        let d = dispatcher(remote.clone());

        d.connect("db1").await.unwrap();
        let err = d.remove("db1").await.unwrap_err();
        assert!(matches!(
            err,
            crate::error::XpctlError::Remote(RemoteError::InUse(_))
        ));
        assert_eq!(remote.removes.load(Ordering::SeqCst), 0);

        d.disconnect("db1").await.unwrap();
        d.remove("db1").await.unwrap();
        assert_eq!(remote.removes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exec_interrupt_forces_close() {
        let remote = Arc::new(FakeRemote::new(&[("c1", "db1")]));
        let d = dispatcher(remote);
        d.connect("db1").await.unwrap();

        let interrupt = CancellationToken::new();
        interrupt.cancel();
        let err = d
            .exec_cancellable("db1", "hang", &interrupt)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            crate::error::XpctlError::Session(SessionError::Interrupted)
        ));
        assert!(d.registry().is_empty());
    }

    #[tokio::test]
    async fn test_shell_stream_failure_clears_session() {
        let remote = Arc::new(FakeRemote::new(&[("c1", "db1")]));
        let d = dispatcher(remote);
        let (_keyboard, input) = tokio::io::duplex(64);
        let (output, _screen) = tokio::io::duplex(64);
        let (_resize_tx, resize) = tokio::sync::mpsc::channel(1);

        let terminal = LocalTerminal {
            input,
            output,
            resize,
            interrupt: CancellationToken::new(),
        };
        let err = d.shell("db1", terminal).await.unwrap_err();
        assert!(matches!(
            err,
            crate::error::XpctlError::Remote(RemoteError::Protocol(_))
        ));
        assert!(d.registry().is_empty());
        assert!(d.host_locks.is_empty());
    }
}
