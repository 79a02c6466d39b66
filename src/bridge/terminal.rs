//! Local terminal adapter
//!
//! Puts the controlling terminal in raw mode and feeds window size changes
//! into the bridge. Raw mode is restored when [`TerminalGuard`] drops,
//! including on error paths.

use crossterm::terminal::{disable_raw_mode, enable_raw_mode, is_raw_mode_enabled};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::pump::LocalTerminal;
use super::stdin::{shared_stdin, SharedStdin};

/// Restores cooked mode on drop
pub struct RawModeGuard(bool);

impl RawModeGuard {
    pub fn new(enable: bool) -> Self {
        if !enable {
            return Self(false);
        }
        match enable_raw_mode() {
            Ok(()) => Self(true),
            Err(e) => {
                warn!("Failed to enable raw mode: {}", e);
                Self(false)
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.0
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if self.0 {
            if let Err(e) = disable_raw_mode() {
                warn!("Failed to restore terminal mode: {}", e);
            }
        }
    }
}

/// Keeps the terminal configured while a bridge runs
pub struct TerminalGuard {
    _raw: RawModeGuard,
    resize_task: JoinHandle<()>,
}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        self.resize_task.abort();
    }
}

/// Attach the process's stdin/stdout to a bridge.
///
/// `raw` is ignored when stdin is not a terminal. Input comes from the
/// shared stdin reader, so it can be dropped without a read left running.
pub fn attach_stdio(
    raw: bool,
    interrupt: CancellationToken,
) -> (LocalTerminal<SharedStdin, tokio::io::Stdout>, TerminalGuard) {
    let already_raw = is_raw_mode_enabled().unwrap_or(false);
    let guard = RawModeGuard::new(raw && !already_raw && stdin_is_tty());

    let (resize_tx, resize) = mpsc::channel(8);
    let resize_task = spawn_resize_watcher(resize_tx);

    (
        LocalTerminal {
            input: shared_stdin(),
            output: tokio::io::stdout(),
            resize,
            interrupt,
        },
        TerminalGuard {
            _raw: guard,
            resize_task,
        },
    )
}

pub(crate) fn stdin_is_tty() -> bool {
    use std::io::IsTerminal;
    std::io::stdin().is_terminal()
}

/// Report the current size, then every change.
fn spawn_resize_watcher(tx: mpsc::Sender<(u16, u16)>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let initial = crossterm::terminal::size().ok();
        if let Some(size) = initial {
            if tx.send(size).await.is_err() {
                return;
            }
        }

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            let mut winch = match signal(SignalKind::window_change()) {
                Ok(s) => s,
                Err(e) => {
                    debug!("SIGWINCH unavailable: {}", e);
                    return;
                }
            };
            while winch.recv().await.is_some() {
                if let Ok(size) = crossterm::terminal::size() {
                    if tx.send(size).await.is_err() {
                        break;
                    }
                }
            }
        }

        #[cfg(not(unix))]
        {
            let mut last = initial;
            let mut ticker = tokio::time::interval(std::time::Duration::from_millis(500));
            loop {
                ticker.tick().await;
                let now = crossterm::terminal::size().ok();
                if now != last {
                    if let Some(size) = now {
                        if tx.send(size).await.is_err() {
                            break;
                        }
                    }
                    last = now;
                }
            }
        }
    })
}
