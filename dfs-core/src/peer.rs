//! Peer handle: one live connection, switching between control and stream mode.
//!
//! The read loop owns the read half while decoding control frames. On a
//! `Stream` frame it parks and hands the read half to whoever calls
//! [`Peer::open_stream`]; [`PeerStream::close_stream`] gives it back and
//! control decoding resumes. A `PeerStream` dropped without closing means the
//! stream was not fully consumed, so the connection is torn down instead. So
//! is a stream nobody claims within the handoff timeout: its bytes cannot be
//! skipped without knowing their length.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, warn};

use crate::protocol::FrameKind;
use crate::transport::Rpc;
use crate::wire;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// How long a read loop waits for someone to claim an inbound stream.
pub const DEFAULT_HANDOFF_TIMEOUT: Duration = Duration::from_secs(30);

/// The reader sits in a shared slot so the read loop can take it back if the
/// handoff is never claimed.
type ReaderSlot = Arc<StdMutex<Option<BoxedReader>>>;

struct StreamHandoff {
    slot: ReaderSlot,
    resume: oneshot::Sender<BoxedReader>,
}

fn take_reader(slot: &ReaderSlot) -> Option<BoxedReader> {
    slot.lock().unwrap_or_else(|e| e.into_inner()).take()
}

/// One live connection. Shared between the registry and in-flight operations.
pub struct Peer {
    remote_addr: String,
    outbound: bool,
    writer: Mutex<BoxedWriter>,
    streams: Mutex<mpsc::Receiver<StreamHandoff>>,
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("remote_addr", &self.remote_addr)
            .field("outbound", &self.outbound)
            .finish()
    }
}

impl Peer {
    /// Wrap a connection's halves. The returned [`ReadLoop`] must be run for
    /// control frames and streams to be delivered.
    pub fn new<R, W>(
        remote_addr: impl Into<String>,
        outbound: bool,
        reader: R,
        writer: W,
    ) -> (Arc<Peer>, ReadLoop)
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let remote_addr = remote_addr.into();
        let (stream_tx, stream_rx) = mpsc::channel(1);
        let peer = Arc::new(Peer {
            remote_addr: remote_addr.clone(),
            outbound,
            writer: Mutex::new(Box::new(writer)),
            streams: Mutex::new(stream_rx),
        });
        let read_loop = ReadLoop {
            remote_addr,
            reader: Box::new(reader),
            stream_tx,
            handoff_timeout: DEFAULT_HANDOFF_TIMEOUT,
        };
        (peer, read_loop)
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    /// True when this side dialed the connection.
    pub fn is_outbound(&self) -> bool {
        self.outbound
    }

    /// Write one complete unit (e.g. a control frame).
    pub async fn send(&self, bytes: &[u8]) -> io::Result<()> {
        let mut w = self.writer.lock().await;
        w.write_all(bytes).await?;
        w.flush().await
    }

    /// Write a header followed by the whole body as one unit. Returns body bytes copied.
    pub async fn send_stream<R>(&self, header: &[u8], body: &mut R) -> io::Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut w = self.writer.lock().await;
        w.write_all(header).await?;
        let n = tokio::io::copy(body, &mut *w).await?;
        w.flush().await?;
        Ok(n)
    }

    /// Close the write side; the remote read loop sees end of stream.
    pub async fn shutdown(&self) -> io::Result<()> {
        self.writer.lock().await.shutdown().await
    }

    /// Wait for the next inbound stream on this connection.
    ///
    /// Cancel-safe: dropping the future before it resolves leaves the handoff queued.
    pub async fn open_stream(&self) -> io::Result<PeerStream> {
        let mut streams = self.streams.lock().await;
        loop {
            let Some(h) = streams.recv().await else {
                return Err(io::Error::new(
                    io::ErrorKind::ConnectionAborted,
                    format!("connection to {} closed", self.remote_addr),
                ));
            };
            // An empty slot is a handoff the read loop already reclaimed.
            if let Some(reader) = take_reader(&h.slot) {
                return Ok(PeerStream {
                    remote_addr: self.remote_addr.clone(),
                    reader: Some(reader),
                    resume: Some(h.resume),
                });
            }
        }
    }
}

/// Raw byte access to a connection that is in stream mode.
pub struct PeerStream {
    remote_addr: String,
    reader: Option<BoxedReader>,
    resume: Option<oneshot::Sender<BoxedReader>>,
}

impl PeerStream {
    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    /// Stream fully consumed: resume control-frame decoding on the connection.
    pub fn close_stream(mut self) {
        if let (Some(reader), Some(resume)) = (self.reader.take(), self.resume.take()) {
            let _ = resume.send(reader);
        }
    }
}

impl Drop for PeerStream {
    fn drop(&mut self) {
        if self.reader.is_some() {
            warn!(peer = %self.remote_addr, "stream dropped before close, tearing down connection");
        }
    }
}

impl AsyncRead for PeerStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.reader.as_mut() {
            Some(r) => Pin::new(r).poll_read(cx, buf),
            None => Poll::Ready(Ok(())),
        }
    }
}

/// Per-connection read loop. Forwards control bodies as [`Rpc`]s and hands
/// streams to [`Peer::open_stream`].
pub struct ReadLoop {
    remote_addr: String,
    reader: BoxedReader,
    stream_tx: mpsc::Sender<StreamHandoff>,
    handoff_timeout: Duration,
}

impl ReadLoop {
    /// Bound the wait for an inbound stream to be claimed by [`Peer::open_stream`].
    pub fn with_handoff_timeout(mut self, timeout: Duration) -> Self {
        self.handoff_timeout = timeout;
        self
    }

    /// Run until the connection closes, a frame is malformed, or `rpc_tx` is dropped.
    pub async fn run(self, rpc_tx: mpsc::Sender<Rpc>) {
        let ReadLoop {
            remote_addr,
            mut reader,
            stream_tx,
            handoff_timeout,
        } = self;
        loop {
            let kind = match reader.read_u8().await {
                Ok(b) => b,
                Err(e) => {
                    debug!(peer = %remote_addr, error = %e, "connection read ended");
                    break;
                }
            };
            match FrameKind::try_from(kind) {
                Ok(FrameKind::Control) => {
                    let payload = match wire::read_control_body(&mut reader).await {
                        Ok(p) => p,
                        Err(e) => {
                            warn!(peer = %remote_addr, error = %e, "bad control frame");
                            break;
                        }
                    };
                    let rpc = Rpc {
                        from: remote_addr.clone(),
                        payload,
                    };
                    if rpc_tx.send(rpc).await.is_err() {
                        break;
                    }
                }
                Ok(FrameKind::Stream) => {
                    debug!(peer = %remote_addr, "incoming stream, waiting for consumer");
                    let (resume, mut resumed) = oneshot::channel();
                    let slot: ReaderSlot = Arc::new(StdMutex::new(Some(reader)));
                    let handoff = StreamHandoff {
                        slot: slot.clone(),
                        resume,
                    };
                    if stream_tx.send(handoff).await.is_err() {
                        break;
                    }
                    let claimed = tokio::time::timeout(handoff_timeout, &mut resumed).await;
                    let resumed = match claimed {
                        Ok(r) => r,
                        Err(_) => {
                            if take_reader(&slot).is_some() {
                                warn!(
                                    peer = %remote_addr,
                                    timeout = ?handoff_timeout,
                                    "stream never claimed, dropping connection"
                                );
                                break;
                            }
                            // Claimed; the consumer bounds its own read.
                            resumed.await
                        }
                    };
                    match resumed {
                        Ok(r) => {
                            reader = r;
                            debug!(peer = %remote_addr, "stream closed, resuming read loop");
                        }
                        Err(_) => break,
                    }
                }
                Err(other) => {
                    warn!(
                        peer = %remote_addr,
                        error = %wire::FrameDecodeError::UnknownKind(other),
                        "dropping connection"
                    );
                    break;
                }
            }
        }
    }
}
