//! Replicated peer-to-peer file store.
//!
//! A node persists writes under its namespace and replicates them to every
//! connected peer; reads that miss locally are fetched from the network.
//! Control envelopes and raw file streams share one connection, told apart by a
//! leading frame-kind byte.

pub mod error;
pub mod peer;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod store;
pub mod tcp;
pub mod transport;
pub mod wire;

pub use error::{Error, Result};
pub use peer::{Peer, PeerStream, ReadLoop, DEFAULT_HANDOFF_TIMEOUT};
pub use protocol::{Envelope, FrameKind, PROTOCOL_VERSION};
pub use registry::PeerRegistry;
pub use server::{FileServer, FileServerOpts, ServerState, DEFAULT_NAMESPACE};
pub use store::{
    cas_path_transform, plain_path_transform, PathKey, PathTransformFunc, Store, StoreError,
    StoreOpts,
};
pub use tcp::{TcpTransport, TcpTransportOpts};
pub use transport::{PeerHandler, Rpc, Transport, TransportError};
pub use wire::{decode_envelope, encode_envelope, FrameDecodeError, FrameEncodeError};
