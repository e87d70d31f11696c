//! Wire protocol: control envelopes and the frame-kind byte.

use serde::{Deserialize, Serialize};

/// Current protocol version. Exchanged in the connection handshake.
pub const PROTOCOL_VERSION: u8 = 1;

/// Control-channel message. Encoding is bincode; framing lives in the wire module.
///
/// The variant tag is part of the encoding, so a decoder recovers the payload
/// kind without hints and rejects tags it does not know.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Envelope {
    /// Sender stored `key` under `namespace`; exactly `size` stream bytes follow.
    StoreFile {
        namespace: String,
        key: String,
        size: u64,
    },
    /// Sender wants `key` under `namespace`; holders answer with a sized stream.
    GetFile { namespace: String, key: String },
}

impl Envelope {
    pub fn namespace(&self) -> &str {
        match self {
            Envelope::StoreFile { namespace, .. } | Envelope::GetFile { namespace, .. } => {
                namespace
            }
        }
    }

    pub fn key(&self) -> &str {
        match self {
            Envelope::StoreFile { key, .. } | Envelope::GetFile { key, .. } => key,
        }
    }
}

/// One byte written before every logically distinct unit on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// A length-prefixed envelope follows.
    Control = 0x01,
    /// Raw file bytes follow; the length is agreed out of band.
    Stream = 0x02,
}

impl FrameKind {
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for FrameKind {
    type Error = u8;

    fn try_from(b: u8) -> Result<Self, Self::Error> {
        match b {
            0x01 => Ok(FrameKind::Control),
            0x02 => Ok(FrameKind::Stream),
            other => Err(other),
        }
    }
}
