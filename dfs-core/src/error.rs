//! Errors surfaced by the file server.
//!
//! | Variant | Policy |
//! |---------|--------|
//! | `Store` | local I/O, surfaced to the caller, no retry |
//! | `Encode` / `Decode` | malformed control frame, logged and dropped by the control loop |
//! | `PeerNotFound` | message from an unregistered sender, logged and dropped |
//! | `PeerSend` | fan-out write failed, remaining peers skipped, no rollback |
//! | `StreamTimeout` / `ShortStream` | a peer stopped streaming, connection torn down |

use std::time::Duration;

use thiserror::Error;

use crate::store::StoreError;
use crate::transport::TransportError;
use crate::wire::{FrameDecodeError, FrameEncodeError};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("encode error: {0}")]
    Encode(#[from] FrameEncodeError),

    #[error("decode error: {0}")]
    Decode(#[from] FrameDecodeError),

    #[error("failed to read input: {0}")]
    Input(#[source] std::io::Error),

    #[error("peer ({0}) could not be found in the peer list")]
    PeerNotFound(String),

    #[error("write to peer {addr} failed: {source}")]
    PeerSend {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("stream from peer {addr} failed: {source}")]
    PeerStream {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("peer {addr} did not stream within {timeout:?}")]
    StreamTimeout { addr: String, timeout: Duration },

    #[error("peer {addr} streamed {got} of {expected} bytes")]
    ShortStream { addr: String, expected: u64, got: u64 },

    #[error("need to serve file ({key}) but it does not exist on disk")]
    FileNotServed { key: String },

    #[error("invalid state: expected {expected}, got {actual}")]
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },
}
