//! Process-wide stdin
//!
//! A single thread owns the blocking read of stdin and forwards chunks over
//! a channel. The console, the bridge and the host picker all read through
//! [`SharedStdin`], so dropping a pending read leaves nothing behind that
//! could eat the next keystroke or keep the runtime alive at exit.

use std::io::{self, Read};
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::mpsc;
use tracing::{debug, warn};

const READ_CHUNK: usize = 4096;
const CHANNEL_DEPTH: usize = 64;

static STDIN: OnceLock<SharedStdin> = OnceLock::new();

/// Handle to the process's stdin. Clones share one buffer.
#[derive(Clone)]
pub struct SharedStdin {
    inner: Arc<Mutex<Inner>>,
}

struct Inner {
    rx: mpsc::Receiver<Bytes>,
    /// Rest of a chunk a previous read could not take
    pending: Bytes,
}

/// The process's stdin, starting the reader thread on first use.
pub fn shared_stdin() -> SharedStdin {
    STDIN.get_or_init(|| SharedStdin::spawn(io::stdin())).clone()
}

impl SharedStdin {
    /// Read `source` on a dedicated thread.
    pub fn spawn<R: Read + Send + 'static>(source: R) -> Self {
        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
        let spawned = std::thread::Builder::new()
            .name("xpctl-stdin".to_string())
            .spawn(move || read_loop(source, tx));
        if let Err(e) = spawned {
            // The sender went down with the closure, so readers see EOF
            warn!("Failed to start stdin reader: {}", e);
        }
        Self::from_channel(rx)
    }

    /// Reader over chunks produced elsewhere.
    pub fn from_channel(rx: mpsc::Receiver<Bytes>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                rx,
                pending: Bytes::new(),
            })),
        }
    }
}

fn read_loop<R: Read>(mut source: R, tx: mpsc::Sender<Bytes>) {
    let mut buf = [0u8; READ_CHUNK];
    loop {
        match source.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if tx.blocking_send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!("stdin read failed: {}", e);
                break;
            }
        }
    }
    debug!("stdin reader finished");
}

impl AsyncRead for SharedStdin {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut inner = self.inner.lock();
        if inner.pending.is_empty() {
            match inner.rx.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => inner.pending = chunk,
                // EOF
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }

        let n = inner.pending.len().min(buf.remaining());
        let chunk = inner.pending.split_to(n);
        buf.put_slice(&chunk);
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_abandoned_read_keeps_next_input() {
        let (tx, rx) = mpsc::channel(4);
        let stdin = SharedStdin::from_channel(rx);

        let mut first = stdin.clone();
        let mut buf = [0u8; 16];
        let timed_out = tokio::time::timeout(Duration::from_millis(50), first.read(&mut buf)).await;
        assert!(timed_out.is_err());

        tx.send(Bytes::from_static(b"quit\n")).await.unwrap();
        let mut second = stdin.clone();
        let n = second.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"quit\n");
    }

    #[tokio::test]
    async fn test_partial_reads_drain_pending() {
        let (tx, rx) = mpsc::channel(4);
        let mut stdin = SharedStdin::from_channel(rx);
        tx.send(Bytes::from_static(b"abcdef")).await.unwrap();
        drop(tx);

        let mut small = [0u8; 4];
        let n = stdin.read(&mut small).await.unwrap();
        assert_eq!(&small[..n], b"abcd");

        let mut rest = Vec::new();
        stdin.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"ef");
    }

    #[tokio::test]
    async fn test_thread_reader_hits_eof() {
        let mut stdin = SharedStdin::spawn(io::Cursor::new(b"ls -la\n".to_vec()));
        let mut out = String::new();
        stdin.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "ls -la\n");
    }
}
