//! Bidirectional pump between a local terminal and a session stream
//!
//! Two tasks run concurrently:
//! - input:  local bytes / resize events -> outgoing frames
//! - output: incoming frames -> local output
//!
//! Whichever finishes first cancels the other through a shared token; both
//! are joined before [`run_bridge`] returns.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::protocol::Frame;
use crate::remote::SessionStream;

/// `Ctrl-]`, the local detach key
pub const DETACH_KEY: u8 = 0x1d;

const READ_BUFFER: usize = 4096;

/// The local side of a bridge
pub struct LocalTerminal<R, W> {
    pub input: R,
    pub output: W,
    /// Window size changes (cols, rows)
    pub resize: mpsc::Receiver<(u16, u16)>,
    /// Cancelled on a local interrupt signal
    pub interrupt: CancellationToken,
}

#[derive(Debug, Clone, Copy)]
pub struct BridgeOptions {
    /// Forward resize events as in-band frames
    pub supports_resize: bool,
    /// Input byte that detaches like an interrupt
    pub detach_key: Option<u8>,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            supports_resize: true,
            detach_key: Some(DETACH_KEY),
        }
    }
}

/// Why the bridge stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeOutcome {
    /// The remote side closed the stream
    RemoteClosed { exit_code: Option<i32> },
    /// Local interrupt or detach key
    Interrupted,
    /// Local input reached end of file
    LocalEof,
    /// IO or stream failure
    Failed(String),
}

impl BridgeOutcome {
    /// One-line summary for the user.
    pub fn status_line(&self, host: &str) -> String {
        match self {
            Self::RemoteClosed {
                exit_code: Some(code),
            } => format!("Connection to {} closed by remote (exit {})", host, code),
            Self::RemoteClosed { exit_code: None } => {
                format!("Connection to {} closed by remote", host)
            }
            Self::Interrupted => format!("Disconnected from {}", host),
            Self::LocalEof => format!("Input closed, disconnected from {}", host),
            Self::Failed(msg) => format!("Connection to {} failed: {}", host, msg),
        }
    }
}

#[derive(Debug)]
enum InputEnd {
    Interrupted,
    Eof,
    /// Stopped by the other task, or the outgoing channel closed
    Stopped,
    Failed(String),
}

#[derive(Debug)]
enum OutputEnd {
    RemoteClosed(Option<i32>),
    Stopped,
    Failed(String),
}

/// Pump bytes until either direction ends.
pub async fn run_bridge<R, W>(
    terminal: LocalTerminal<R, W>,
    stream: SessionStream,
    options: BridgeOptions,
) -> BridgeOutcome
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let closer = stream.close_token();
    let SessionStream {
        outgoing, incoming, ..
    } = stream;
    let LocalTerminal {
        input,
        output,
        resize,
        interrupt,
    } = terminal;

    let stop = CancellationToken::new();

    let mut input_task = tokio::spawn(pump_input(
        input,
        resize,
        interrupt,
        outgoing.clone(),
        stop.clone(),
        options,
    ));
    let mut output_task = tokio::spawn(pump_output(output, incoming, outgoing, stop.clone()));

    let outcome = tokio::select! {
        first = &mut input_task => {
            stop.cancel();
            let second = output_task.await;
            match first {
                Ok(InputEnd::Interrupted) => BridgeOutcome::Interrupted,
                Ok(InputEnd::Eof) => BridgeOutcome::LocalEof,
                Ok(InputEnd::Failed(e)) => BridgeOutcome::Failed(e),
                // Outgoing side gone: the output task knows why
                Ok(InputEnd::Stopped) => output_outcome(second),
                Err(e) => BridgeOutcome::Failed(format!("input task failed: {}", e)),
            }
        }
        first = &mut output_task => {
            stop.cancel();
            let _ = input_task.await;
            output_outcome(first)
        }
    };

    closer.cancel();
    debug!("Bridge finished: {:?}", outcome);
    outcome
}

fn output_outcome(result: Result<OutputEnd, tokio::task::JoinError>) -> BridgeOutcome {
    match result {
        Ok(OutputEnd::RemoteClosed(exit_code)) => BridgeOutcome::RemoteClosed { exit_code },
        Ok(OutputEnd::Stopped) => BridgeOutcome::RemoteClosed { exit_code: None },
        Ok(OutputEnd::Failed(e)) => BridgeOutcome::Failed(e),
        Err(e) => BridgeOutcome::Failed(format!("output task failed: {}", e)),
    }
}

async fn pump_input<R>(
    mut input: R,
    mut resize: mpsc::Receiver<(u16, u16)>,
    interrupt: CancellationToken,
    outgoing: mpsc::Sender<Frame>,
    stop: CancellationToken,
    options: BridgeOptions,
) -> InputEnd
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_BUFFER];

    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => return InputEnd::Stopped,
            _ = interrupt.cancelled() => return InputEnd::Interrupted,
            Some((cols, rows)) = resize.recv() => {
                if !options.supports_resize {
                    trace!("Resize {}x{} ignored by backend", cols, rows);
                    continue;
                }
                if outgoing.send(Frame::Resize { cols, rows }).await.is_err() {
                    return InputEnd::Stopped;
                }
            }
            read = input.read(&mut buf) => {
                let n = match read {
                    Ok(0) => return InputEnd::Eof,
                    Ok(n) => n,
                    Err(e) => return InputEnd::Failed(format!("local input: {}", e)),
                };
                let chunk = &buf[..n];

                let detach_at = options
                    .detach_key
                    .and_then(|key| chunk.iter().position(|b| *b == key));
                let data = match detach_at {
                    Some(pos) => &chunk[..pos],
                    None => chunk,
                };

                if !data.is_empty()
                    && outgoing
                        .send(Frame::Data(Bytes::copy_from_slice(data)))
                        .await
                        .is_err()
                {
                    return InputEnd::Stopped;
                }
                if detach_at.is_some() {
                    return InputEnd::Interrupted;
                }
            }
        }
    }
}

async fn pump_output<W>(
    mut output: W,
    mut incoming: mpsc::Receiver<Frame>,
    outgoing: mpsc::Sender<Frame>,
    stop: CancellationToken,
) -> OutputEnd
where
    W: AsyncWrite + Unpin,
{
    let mut last_error: Option<String> = None;

    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => return OutputEnd::Stopped,
            frame = incoming.recv() => match frame {
                Some(Frame::Data(data)) => {
                    if let Err(e) = write_all_flush(&mut output, &data).await {
                        return OutputEnd::Failed(format!("local output: {}", e));
                    }
                }
                Some(Frame::Heartbeat(seq)) => {
                    let _ = outgoing.send(Frame::Heartbeat(seq)).await;
                }
                Some(Frame::Error(msg)) => {
                    warn!("Remote stream error: {}", msg);
                    last_error = Some(msg);
                }
                Some(Frame::Exit(code)) => return OutputEnd::RemoteClosed(Some(code)),
                Some(Frame::Resize { .. }) => {}
                None => {
                    return match last_error {
                        Some(e) => OutputEnd::Failed(e),
                        None => OutputEnd::RemoteClosed(None),
                    };
                }
            }
        }
    }
}

async fn write_all_flush<W: AsyncWrite + Unpin>(output: &mut W, data: &[u8]) -> std::io::Result<()> {
    output.write_all(data).await?;
    output.flush().await
}
