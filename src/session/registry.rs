//! Session Registry - tracks live remote sessions
//!
//! At most one live (non-terminal) session exists per connection id. All
//! operations go through one `RwLock`; the lock is never held across an
//! `.await`.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::events::SessionEvent;
use super::state::{SessionState, SessionStateMachine, StateTransitionError};
use crate::backend::BackendKind;
use crate::error::{RegistryError, RemoteError};
use crate::remote::{ConnectionDescriptor, SessionHandle};

/// Event channel depth; slow subscribers lose the oldest events
const EVENT_CAPACITY: usize = 64;

/// Snapshot of a registered session
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: String,
    pub connection_id: String,
    pub connection_name: String,
    pub kind: BackendKind,
    pub state: SessionState,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing)]
    pub handle: SessionHandle,
}

impl Session {
    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }

    /// Last segment of the connection name
    pub fn short_name(&self) -> &str {
        self.connection_name
            .rsplit('/')
            .next()
            .unwrap_or(&self.connection_name)
    }
}

struct SessionEntry {
    id: String,
    connection_name: String,
    handle: SessionHandle,
    machine: SessionStateMachine,
    started_at: DateTime<Utc>,
    seq: u64,
    cancel: CancellationToken,
}

impl SessionEntry {
    fn snapshot(&self) -> Session {
        Session {
            id: self.id.clone(),
            connection_id: self.handle.connection_id.clone(),
            connection_name: self.connection_name.clone(),
            kind: self.handle.kind,
            state: self.machine.state(),
            started_at: self.started_at,
            error: self.machine.error().map(str::to_string),
            handle: self.handle.clone(),
        }
    }
}

/// Owned registry of live sessions, shared by `Arc`
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, SessionEntry>>,
    next_seq: AtomicU64,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            sessions: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
            events,
        }
    }

    /// Register a freshly opened session in Connecting state.
    ///
    /// Fails if the connection already has a live session. A leftover entry
    /// in a terminal state is replaced.
    pub fn register(
        &self,
        connection: &ConnectionDescriptor,
        handle: SessionHandle,
    ) -> Result<Session, RegistryError> {
        let session = {
            let mut sessions = self.sessions.write();
            if let Some(existing) = sessions.get(&connection.id) {
                if !existing.machine.is_terminal() {
                    return Err(RegistryError::AlreadyActive {
                        connection_id: connection.id.clone(),
                        session_id: existing.id.clone(),
                    });
                }
            }

            let entry = SessionEntry {
                id: Uuid::new_v4().to_string(),
                connection_name: connection.name.clone(),
                handle,
                machine: SessionStateMachine::new(),
                started_at: Utc::now(),
                seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
                cancel: CancellationToken::new(),
            };
            let session = entry.snapshot();
            sessions.insert(connection.id.clone(), entry);
            session
        };

        info!(
            "Session registered: connection={} session={}",
            session.connection_name, session.id
        );
        self.emit_state(&session, None);
        Ok(session)
    }

    /// Remove the session for a connection. No-op if absent.
    pub fn unregister(&self, connection_id: &str) -> Option<Session> {
        let entry = self.sessions.write().remove(connection_id)?;
        entry.cancel.cancel();
        let session = entry.snapshot();
        info!(
            "Session unregistered: connection={} session={} state={}",
            session.connection_name, session.id, session.state
        );
        let _ = self.events.send(SessionEvent::removed(
            &session.connection_id,
            &session.connection_name,
            &session.id,
            session.state,
        ));
        Some(session)
    }

    pub fn lookup(&self, connection_id: &str) -> Option<Session> {
        self.sessions
            .read()
            .get(connection_id)
            .map(SessionEntry::snapshot)
    }

    /// Find a session by connection id, full name or unique short name
    /// without asking the remote.
    ///
    /// A short name shared by several sessions is rejected rather than
    /// guessed.
    pub fn find(&self, host: &str) -> Result<Option<Session>, RemoteError> {
        if let Some(session) = self.lookup(host) {
            return Ok(Some(session));
        }

        let sessions = self.list_active();
        if let Some(exact) = sessions.iter().find(|s| s.connection_name == host) {
            return Ok(Some(exact.clone()));
        }

        let mut matches = sessions.into_iter().filter(|s| s.short_name() == host);
        match (matches.next(), matches.next()) {
            (Some(a), Some(b)) => Err(RemoteError::ambiguous(
                host,
                &a.connection_name,
                &b.connection_name,
            )),
            (found, _) => Ok(found),
        }
    }

    /// All registered sessions, oldest first.
    pub fn list_active(&self) -> Vec<Session> {
        let sessions = self.sessions.read();
        let mut entries: Vec<&SessionEntry> = sessions.values().collect();
        entries.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.seq.cmp(&b.seq)));
        entries.into_iter().map(SessionEntry::snapshot).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Token cancelled when the session starts closing or is removed.
    pub fn cancel_token(&self, connection_id: &str) -> Option<CancellationToken> {
        self.sessions
            .read()
            .get(connection_id)
            .map(|e| e.cancel.clone())
    }

    /// Connecting -> Active
    pub fn activate(&self, connection_id: &str) -> Option<Session> {
        self.transition(connection_id, None, |m| m.activate())
    }

    /// Connecting/Active -> Closing. Cancels in-flight operations.
    pub fn begin_closing(&self, connection_id: &str) -> Option<Session> {
        let session = self.transition(connection_id, None, |m| m.start_closing())?;
        if let Some(token) = self.cancel_token(connection_id) {
            token.cancel();
        }
        Some(session)
    }

    /// Closing/Active -> Closed, keeping `error` if the close was unclean
    pub fn mark_closed(&self, connection_id: &str, error: Option<String>) -> Option<Session> {
        let message = error.clone();
        self.transition(connection_id, message, move |m| {
            m.close_complete()?;
            if let Some(error) = error {
                m.record_error(error);
            }
            Ok(())
        })
    }

    /// Any live state -> Failed
    pub fn mark_failed(&self, connection_id: &str, error: String) -> Option<Session> {
        let message = Some(error.clone());
        self.transition(connection_id, message, move |m| m.fail(error))
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    fn transition<F>(&self, connection_id: &str, message: Option<String>, f: F) -> Option<Session>
    where
        F: FnOnce(&mut SessionStateMachine) -> Result<(), StateTransitionError>,
    {
        let result = {
            let mut sessions = self.sessions.write();
            let entry = match sessions.get_mut(connection_id) {
                Some(entry) => entry,
                None => {
                    debug!("No session to transition for {}", connection_id);
                    return None;
                }
            };
            f(&mut entry.machine).map(|_| entry.snapshot())
        };

        match result {
            Ok(session) => {
                self.emit_state(&session, message);
                Some(session)
            }
            Err(e) => {
                warn!("Session {}: {}", connection_id, e);
                None
            }
        }
    }

    fn emit_state(&self, session: &Session, message: Option<String>) {
        let _ = self.events.send(SessionEvent::state_changed(
            &session.connection_id,
            &session.connection_name,
            &session.id,
            session.state,
            message,
        ));
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
