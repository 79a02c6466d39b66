//! Shared helpers for integration tests.
//!
//! [`MockRemote`] stands in for the XPipe daemon: it counts every call,
//! can be scripted to fail, and hands out the far end of every session
//! stream it opens.

// Not every test binary uses every helper
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{duplex, DuplexStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use xpctl::backend::BackendKind;
use xpctl::bridge::LocalTerminal;
use xpctl::config::ClientConfig;
use xpctl::dispatcher::{Dispatcher, RetryPolicy};
use xpctl::error::RemoteError;
use xpctl::remote::{
    ConnectionDescriptor, ConnectionParams, ExecOutput, NewConnection, RemoteClient,
    SessionHandle, SessionStream, StreamPeer,
};
use xpctl::session::SessionRegistry;

/// Default timeout for async test operations
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Close grace used by test dispatchers
pub const TEST_CLOSE_GRACE: Duration = Duration::from_millis(200);

/// Hosts every standard mock declares
pub const HOSTS: [(&str, &str, BackendKind); 3] = [
    ("c-db1", "prod/db1", BackendKind::Ssh),
    ("c-web", "prod/web", BackendKind::Docker),
    ("c-pod", "k8s/api", BackendKind::Kubernetes),
];

#[derive(Debug, Default)]
pub struct CallCounts {
    pub list: AtomicUsize,
    pub get: AtomicUsize,
    pub add: AtomicUsize,
    pub remove: AtomicUsize,
    pub open: AtomicUsize,
    pub close: AtomicUsize,
    pub stream: AtomicUsize,
    pub exec: AtomicUsize,
}

impl CallCounts {
    pub fn total(&self) -> usize {
        [
            &self.list,
            &self.get,
            &self.add,
            &self.remove,
            &self.open,
            &self.close,
            &self.stream,
            &self.exec,
        ]
        .iter()
        .map(|c| c.load(Ordering::SeqCst))
        .sum()
    }
}

/// Scriptable in-memory remote
pub struct MockRemote {
    connections: Mutex<Vec<ConnectionDescriptor>>,
    open_failures: Mutex<VecDeque<RemoteError>>,
    close_failure: Mutex<Option<RemoteError>>,
    close_delay: Mutex<Option<Duration>>,
    open_delay: Mutex<Option<Duration>>,
    exec_output: Mutex<ExecOutput>,
    /// Open remote shells per connection id
    live: Mutex<HashMap<String, usize>>,
    max_live: AtomicUsize,
    peer_tx: mpsc::UnboundedSender<StreamPeer>,
    peer_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<StreamPeer>>,
    pub calls: CallCounts,
}

impl MockRemote {
    pub fn new(hosts: &[(&str, &str, BackendKind)]) -> Self {
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        Self {
            connections: Mutex::new(hosts.iter().map(|(id, name, kind)| descriptor(id, name, *kind)).collect()),
            open_failures: Mutex::new(VecDeque::new()),
            close_failure: Mutex::new(None),
            close_delay: Mutex::new(None),
            open_delay: Mutex::new(None),
            exec_output: Mutex::new(ExecOutput::default()),
            live: Mutex::new(HashMap::new()),
            max_live: AtomicUsize::new(0),
            peer_tx,
            peer_rx: tokio::sync::Mutex::new(peer_rx),
            calls: CallCounts::default(),
        }
    }

    /// Mock with the three [`HOSTS`]
    pub fn standard() -> Arc<Self> {
        Arc::new(Self::new(&HOSTS))
    }

    /// The next `times` opens fail with `err`.
    pub fn fail_open(&self, err: RemoteError, times: usize) {
        let mut failures = self.open_failures.lock();
        for _ in 0..times {
            failures.push_back(err.clone());
        }
    }

    pub fn fail_close(&self, err: RemoteError) {
        *self.close_failure.lock() = Some(err);
    }

    pub fn delay_close(&self, delay: Duration) {
        *self.close_delay.lock() = Some(delay);
    }

    pub fn delay_open(&self, delay: Duration) {
        *self.open_delay.lock() = Some(delay);
    }

    pub fn set_exec_output(&self, exit_code: i32, stdout: &str, stderr: &str) {
        *self.exec_output.lock() = ExecOutput {
            exit_code,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
        };
    }

    pub fn count(&self, counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    /// Remote shells currently open for `connection_id`
    pub fn live_shells(&self, connection_id: &str) -> usize {
        self.live.lock().get(connection_id).copied().unwrap_or(0)
    }

    /// Highest number of shells ever open at once for a single connection
    pub fn max_live_shells(&self) -> usize {
        self.max_live.load(Ordering::SeqCst)
    }

    /// Far end of the next stream the dispatcher opens.
    pub async fn next_peer(&self) -> StreamPeer {
        let mut rx = self.peer_rx.lock().await;
        tokio::time::timeout(DEFAULT_TIMEOUT, rx.recv())
            .await
            .expect("no stream opened in time")
            .expect("peer channel closed")
    }
}

#[async_trait]
impl RemoteClient for MockRemote {
    async fn list_connections(&self) -> Result<Vec<ConnectionDescriptor>, RemoteError> {
        self.calls.list.fetch_add(1, Ordering::SeqCst);
        let mut connections = self.connections.lock().clone();
        connections.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        Ok(connections)
    }

    async fn get_connection(&self, id: &str) -> Result<ConnectionDescriptor, RemoteError> {
        self.calls.get.fetch_add(1, Ordering::SeqCst);
        self.connections
            .lock()
            .iter()
            .find(|c| c.id == id)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(id.to_string()))
    }

    async fn add_connection(&self, new: &NewConnection) -> Result<String, RemoteError> {
        self.calls.add.fetch_add(1, Ordering::SeqCst);
        let mut connections = self.connections.lock();
        if connections.iter().any(|c| c.name == new.name) {
            return Err(RemoteError::Conflict(format!("{} exists", new.name)));
        }
        let id = format!("c-{}", new.name.replace('/', "-"));
        let mut added = descriptor(&id, &new.name, new.kind);
        added.params = new.params.clone();
        connections.push(added);
        Ok(id)
    }

    async fn remove_connection(&self, id: &str) -> Result<(), RemoteError> {
        self.calls.remove.fetch_add(1, Ordering::SeqCst);
        let mut connections = self.connections.lock();
        let before = connections.len();
        connections.retain(|c| c.id != id);
        if connections.len() == before {
            return Err(RemoteError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn open_session(
        &self,
        connection: &ConnectionDescriptor,
    ) -> Result<SessionHandle, RemoteError> {
        self.calls.open.fetch_add(1, Ordering::SeqCst);
        let delay = *self.open_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let failure = self.open_failures.lock().pop_front();
        if let Some(err) = failure {
            return Err(err);
        }

        let mut live = self.live.lock();
        let count = live.entry(connection.id.clone()).or_insert(0);
        *count += 1;
        self.max_live.fetch_max(*count, Ordering::SeqCst);
        Ok(SessionHandle::new(connection.id.clone(), connection.kind))
    }

    async fn close_session(&self, handle: &SessionHandle) -> Result<(), RemoteError> {
        self.calls.close.fetch_add(1, Ordering::SeqCst);
        let delay = *self.close_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(count) = self.live.lock().get_mut(&handle.connection_id) {
            *count = count.saturating_sub(1);
        }
        let failure = self.close_failure.lock().clone();
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn stream_session(&self, _handle: &SessionHandle) -> Result<SessionStream, RemoteError> {
        self.calls.stream.fetch_add(1, Ordering::SeqCst);
        let (stream, peer) = SessionStream::pair(16);
        self.peer_tx
            .send(peer)
            .map_err(|_| RemoteError::Protocol("test harness gone".to_string()))?;
        Ok(stream)
    }

    async fn exec(&self, _handle: &SessionHandle, _command: &str) -> Result<ExecOutput, RemoteError> {
        self.calls.exec.fetch_add(1, Ordering::SeqCst);
        Ok(self.exec_output.lock().clone())
    }
}

pub fn descriptor(id: &str, name: &str, kind: BackendKind) -> ConnectionDescriptor {
    ConnectionDescriptor {
        id: id.to_string(),
        name: name.to_string(),
        category: Vec::new(),
        kind,
        store_type: kind.store_type().to_string(),
        params: ConnectionParams::default(),
    }
}

/// Dispatcher over `remote` with a fast retry and short close grace.
pub fn dispatcher(remote: Arc<MockRemote>) -> Dispatcher {
    Dispatcher::new(remote, Arc::new(SessionRegistry::new()), &ClientConfig::default())
        .with_retry_policy(RetryPolicy {
            retries: 1,
            backoff: Duration::from_millis(10),
        })
        .with_close_grace(TEST_CLOSE_GRACE)
}

/// In-memory terminal: write to `keyboard`, read from `screen`.
pub struct FakeTerminal {
    pub keyboard: DuplexStream,
    pub screen: DuplexStream,
    pub resize: mpsc::Sender<(u16, u16)>,
    pub interrupt: CancellationToken,
}

pub fn fake_terminal() -> (LocalTerminal<DuplexStream, DuplexStream>, FakeTerminal) {
    let (keyboard, input) = duplex(4096);
    let (output, screen) = duplex(4096);
    let (resize, resize_rx) = mpsc::channel(8);
    let interrupt = CancellationToken::new();
    (
        LocalTerminal {
            input,
            output,
            resize: resize_rx,
            interrupt: interrupt.clone(),
        },
        FakeTerminal {
            keyboard,
            screen,
            resize,
            interrupt,
        },
    )
}
