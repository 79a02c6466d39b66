//! xpctl: terminal client for the XPipe connection hub
//!
//! Talks to the XPipe daemon's HTTP API, keeps track of the remote shells
//! this process has opened, and bridges the local terminal to them.

pub mod backend;
pub mod bridge;
pub mod cli;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod picker;
pub mod remote;
pub mod repl;
pub mod session;

pub use error::{Result, XpctlError};
