//! Interactive terminal bridge
//!
//! Connects a local terminal to a remote session stream: binary frames on
//! the wire, a two-task pump in the middle and a raw-mode adapter at the
//! local end.

mod protocol;
mod pump;
mod stdin;
mod terminal;

pub use protocol::{Frame, FrameCodec, MessageType, HEADER_SIZE, MAX_PAYLOAD_SIZE};
pub use pump::{run_bridge, BridgeOptions, BridgeOutcome, LocalTerminal, DETACH_KEY};
pub use stdin::{shared_stdin, SharedStdin};
pub use terminal::{attach_stdio, RawModeGuard, TerminalGuard};
pub(crate) use terminal::stdin_is_tty;
