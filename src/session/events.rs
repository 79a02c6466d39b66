//! Session Events Module
//!
//! Lifecycle notifications broadcast by the session registry.

use serde::Serialize;

use super::state::SessionState;

/// Event names as constants
pub mod event_names {
    /// Session changed state
    pub const SESSION_STATE_CHANGED: &str = "session:state_changed";
    /// Session removed from the registry
    pub const SESSION_REMOVED: &str = "session:removed";
}

/// Session lifecycle payload
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionEvent {
    pub name: &'static str,
    pub connection_id: String,
    pub connection_name: String,
    pub session_id: String,
    pub state: SessionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl SessionEvent {
    pub fn state_changed(
        connection_id: &str,
        connection_name: &str,
        session_id: &str,
        state: SessionState,
        message: Option<String>,
    ) -> Self {
        Self {
            name: event_names::SESSION_STATE_CHANGED,
            connection_id: connection_id.to_string(),
            connection_name: connection_name.to_string(),
            session_id: session_id.to_string(),
            state,
            message,
        }
    }

    pub fn removed(
        connection_id: &str,
        connection_name: &str,
        session_id: &str,
        state: SessionState,
    ) -> Self {
        Self {
            name: event_names::SESSION_REMOVED,
            connection_id: connection_id.to_string(),
            connection_name: connection_name.to_string(),
            session_id: session_id.to_string(),
            state,
            message: None,
        }
    }
}
