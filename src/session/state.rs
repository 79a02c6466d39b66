//! Session State Machine
//!
//! Valid transitions for a remote session:
//!
//! ```text
//! ┌──────────────┐   stream open   ┌──────────────┐
//! │  Connecting  │ ──────────────► │    Active    │
//! └──────┬───────┘                 └──────┬───────┘
//!        │                                │
//!        │ teardown               teardown│
//!        │        ┌──────────────┐        │
//!        └──────► │   Closing    │ ◄──────┘
//!                 └──────┬───────┘
//!                        │
//!                        ▼
//!                 ┌──────────────┐
//!                 │    Closed    │
//!                 └──────────────┘
//!
//! Any non-terminal state ──(unrecoverable error)──► Failed
//! ```
//!
//! Closed and Failed are terminal.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Session states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Remote shell requested, stream not yet confirmed
    #[default]
    Connecting,
    /// Remote shell confirmed and usable
    Active,
    /// Teardown started (user or remote initiated)
    Closing,
    /// Cleanly closed
    Closed,
    /// Unrecoverable remote error
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::Active => write!(f, "active"),
            Self::Closing => write!(f, "closing"),
            Self::Closed => write!(f, "closed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }
}

/// State machine for session lifecycle management
#[derive(Debug)]
pub struct SessionStateMachine {
    state: SessionState,
    error_message: Option<String>,
    transition_count: u32,
}

impl Default for SessionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStateMachine {
    /// Create a new state machine in Connecting state
    pub fn new() -> Self {
        Self {
            state: SessionState::Connecting,
            error_message: None,
            transition_count: 0,
        }
    }

    /// Get current state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Last recorded error, if any
    pub fn error(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    /// Get total number of state transitions
    pub fn transition_count(&self) -> u32 {
        self.transition_count
    }

    /// Stream confirmed open
    pub fn activate(&mut self) -> Result<(), StateTransitionError> {
        match self.state {
            SessionState::Connecting => {
                self.transition_to(SessionState::Active);
                Ok(())
            }
            _ => Err(StateTransitionError::InvalidTransition {
                from: self.state,
                to: SessionState::Active,
            }),
        }
    }

    /// Start teardown
    pub fn start_closing(&mut self) -> Result<(), StateTransitionError> {
        match self.state {
            SessionState::Connecting | SessionState::Active => {
                self.transition_to(SessionState::Closing);
                Ok(())
            }
            _ => Err(StateTransitionError::InvalidTransition {
                from: self.state,
                to: SessionState::Closing,
            }),
        }
    }

    /// Complete teardown
    pub fn close_complete(&mut self) -> Result<(), StateTransitionError> {
        match self.state {
            SessionState::Closing => {
                self.transition_to(SessionState::Closed);
                Ok(())
            }
            // Remote-initiated close skips Closing
            SessionState::Active => {
                self.transition_to(SessionState::Closed);
                Ok(())
            }
            _ => Err(StateTransitionError::InvalidTransition {
                from: self.state,
                to: SessionState::Closed,
            }),
        }
    }

    /// Mark the session failed (from any non-terminal state)
    pub fn fail(&mut self, error: String) -> Result<(), StateTransitionError> {
        if self.state.is_terminal() {
            return Err(StateTransitionError::InvalidTransition {
                from: self.state,
                to: SessionState::Failed,
            });
        }
        self.transition_to(SessionState::Failed);
        self.error_message = Some(error);
        Ok(())
    }

    /// Remember an error without changing state
    pub fn record_error(&mut self, error: String) {
        self.error_message = Some(error);
    }

    /// Check if session is in a terminal state (closed or failed)
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Check if session is usable for I/O
    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }

    fn transition_to(&mut self, new_state: SessionState) {
        tracing::debug!(
            "Session state transition: {} -> {} (count: {})",
            self.state,
            new_state,
            self.transition_count + 1
        );
        self.state = new_state;
        self.transition_count += 1;
    }
}

/// Error type for invalid state transitions
#[derive(Debug, Clone, thiserror::Error)]
pub enum StateTransitionError {
    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition {
        from: SessionState,
        to: SessionState,
    },
}
