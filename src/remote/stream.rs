//! Session stream transport
//!
//! A [`SessionStream`] is the caller's end of a bidirectional frame channel.
//! For the XPipe client the other end is an IO task that owns the WebSocket:
//!
//! ```text
//! ┌──────────────┐  outgoing (mpsc)  ┌──────────┐  binary frames  ┌──────────┐
//! │    Bridge    │ ────────────────▸ │ IO task  │ ──────────────▸ │  XPipe   │
//! │              │ ◂──────────────── │          │ ◂────────────── │  daemon  │
//! └──────────────┘  incoming (mpsc)  └──────────┘                 └──────────┘
//! ```
//!
//! The incoming channel closing means the remote side went away. A stream is
//! single-use: once closed it cannot be reopened.

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bridge::{Frame, FrameCodec};

/// Channel depth between the bridge and the transport
pub const STREAM_BUFFER: usize = 256;

/// Caller's end of an open session stream
pub struct SessionStream {
    pub outgoing: mpsc::Sender<Frame>,
    pub incoming: mpsc::Receiver<Frame>,
    closer: CancellationToken,
}

/// Transport's end of a session stream
pub struct StreamPeer {
    /// Frames delivered to the caller
    pub to_local: mpsc::Sender<Frame>,
    /// Frames sent by the caller
    pub from_local: mpsc::Receiver<Frame>,
    /// Cancelled when the caller closes the stream
    pub closed: CancellationToken,
}

impl SessionStream {
    /// Create a connected stream/peer pair.
    pub fn pair(buffer: usize) -> (SessionStream, StreamPeer) {
        let (out_tx, out_rx) = mpsc::channel(buffer);
        let (in_tx, in_rx) = mpsc::channel(buffer);
        let closer = CancellationToken::new();
        (
            SessionStream {
                outgoing: out_tx,
                incoming: in_rx,
                closer: closer.clone(),
            },
            StreamPeer {
                to_local: in_tx,
                from_local: out_rx,
                closed: closer,
            },
        )
    }

    /// Token cancelled when the stream is closed from the local side.
    pub fn close_token(&self) -> CancellationToken {
        self.closer.clone()
    }

    /// Ask the transport to close the stream.
    pub fn close(&self) {
        self.closer.cancel();
    }
}

/// Spawn the IO task that moves frames between a WebSocket and a
/// [`SessionStream`].
pub fn spawn_websocket_io<S>(mut ws: WebSocketStream<S>, label: String) -> SessionStream
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (stream, mut peer) = SessionStream::pair(STREAM_BUFFER);

    tokio::spawn(async move {
        let mut codec = FrameCodec::new();

        'io: loop {
            tokio::select! {
                _ = peer.closed.cancelled() => {
                    debug!("[session-stream] {}: local close", label);
                    let _ = ws.send(Message::Close(None)).await;
                    break;
                }
                outgoing = peer.from_local.recv() => {
                    match outgoing {
                        Some(frame) => {
                            if let Err(e) = ws.send(Message::Binary(frame.encode().to_vec())).await {
                                warn!("[session-stream] {}: write failed: {}", label, e);
                                break;
                            }
                        }
                        None => {
                            let _ = ws.send(Message::Close(None)).await;
                            break;
                        }
                    }
                }
                msg = ws.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            codec.feed(&data);
                            loop {
                                match codec.decode_next() {
                                    Ok(Some(frame)) => {
                                        if peer.to_local.send(frame).await.is_err() {
                                            break 'io;
                                        }
                                    }
                                    Ok(None) => break,
                                    Err(e) => {
                                        warn!("[session-stream] {}: bad frame: {}", label, e);
                                        let _ = peer.to_local.send(Frame::Error(e.to_string())).await;
                                        break 'io;
                                    }
                                }
                            }
                            if codec.is_overflow() {
                                warn!("[session-stream] {}: frame buffer overflow", label);
                                break;
                            }
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            let _ = ws.send(Message::Pong(payload)).await;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            info!("[session-stream] {}: closed by remote", label);
                            break;
                        }
                        Some(Ok(_)) => {
                            // Text and pong messages carry nothing for the bridge
                        }
                        Some(Err(e)) => {
                            warn!("[session-stream] {}: read failed: {}", label, e);
                            let _ = peer.to_local.send(Frame::Error(e.to_string())).await;
                            break;
                        }
                    }
                }
            }
        }

        // Dropping `peer.to_local` here signals remote closure to the caller
        debug!("[session-stream] {}: IO task ended", label);
    });

    stream
}
