//! Transport abstraction: listens, dials, and delivers control frames from all peers
//! to a single consumer.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::peer::Peer;

/// Control-channel frame received from a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rpc {
    /// Remote address of the connection the frame arrived on.
    pub from: String,
    /// Envelope body, still encoded.
    pub payload: Vec<u8>,
}

/// Notified by the transport as connections come and go.
pub trait PeerHandler: Send + Sync + 'static {
    /// A connection was accepted or dialed. An error closes the connection.
    fn on_peer(&self, peer: Arc<Peer>) -> Result<(), TransportError>;

    /// The connection's read loop ended.
    fn on_peer_closed(&self, _peer: &Arc<Peer>) {}
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Listen address; the bound address once listening.
    fn addr(&self) -> String;

    /// Bind and start accepting in the background. `handler` also receives dialed peers.
    async fn listen_and_accept(&self, handler: Arc<dyn PeerHandler>) -> Result<(), TransportError>;

    /// Connect to `addr`; the peer is handed to the handler before this returns.
    async fn dial(&self, addr: &str) -> Result<(), TransportError>;

    /// Take the receiver of control frames. Only the first call returns `Some`.
    fn consume(&self) -> Option<mpsc::Receiver<Rpc>>;

    /// Stop accepting and tear down connection tasks.
    async fn close(&self) -> Result<(), TransportError>;
}

/// Transport failures (bind, dial, handshake).
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unsupported protocol version {got} (expected {expected})")]
    VersionMismatch { expected: u8, got: u8 },
    #[error("transport is not listening")]
    NotListening,
    #[error("transport already listening")]
    AlreadyListening,
    #[error("control channel already consumed")]
    AlreadyConsumed,
    #[error("peer rejected: {0}")]
    Rejected(String),
}
