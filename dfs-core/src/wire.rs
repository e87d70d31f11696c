//! Framing: every unit on a connection starts with a frame-kind byte.
//!
//! Control: kind byte + 4 bytes LE length + bincode envelope.
//! Stream: kind byte, then raw bytes (sized either by the preceding envelope or
//! by an 8 byte LE prefix for fetch responses).

use bincode::Options;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::protocol::{Envelope, FrameKind};

pub const LEN_SIZE: usize = 4;
pub const STREAM_SIZE_LEN: usize = 8;
pub const MAX_ENVELOPE_LEN: u32 = 1024 * 1024; // 1 MiB

fn codec() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .reject_trailing_bytes()
}

/// Serialize an envelope body (no kind byte, no length prefix).
pub fn encode_envelope(msg: &Envelope) -> Result<Vec<u8>, FrameEncodeError> {
    let body = codec().serialize(msg).map_err(FrameEncodeError::Encode)?;
    if body.len() > MAX_ENVELOPE_LEN as usize {
        return Err(FrameEncodeError::TooLarge(body.len()));
    }
    Ok(body)
}

/// Decode an envelope body as delivered by the transport.
pub fn decode_envelope(body: &[u8]) -> Result<Envelope, FrameDecodeError> {
    if body.len() > MAX_ENVELOPE_LEN as usize {
        return Err(FrameDecodeError::TooLarge(body.len()));
    }
    codec()
        .with_limit(u64::from(MAX_ENVELOPE_LEN))
        .deserialize(body)
        .map_err(FrameDecodeError::Decode)
}

/// Full control frame for an already-encoded body: kind byte, LE length, body.
pub fn control_frame(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + LEN_SIZE + body.len());
    out.push(FrameKind::Control.as_byte());
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(body);
    out
}

/// Header for a replication stream; the size was announced in `StoreFile`.
pub fn stream_header() -> [u8; 1] {
    [FrameKind::Stream.as_byte()]
}

/// Header for a fetch response: kind byte then the file size.
pub fn sized_stream_header(size: u64) -> [u8; 1 + STREAM_SIZE_LEN] {
    let mut out = [0u8; 1 + STREAM_SIZE_LEN];
    out[0] = FrameKind::Stream.as_byte();
    out[1..].copy_from_slice(&size.to_le_bytes());
    out
}

/// Read one control body (length prefix + bytes) after the kind byte was consumed.
pub async fn read_control_body<R>(reader: &mut R) -> Result<Vec<u8>, FrameDecodeError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut len_buf = [0u8; LEN_SIZE];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf);
    if len > MAX_ENVELOPE_LEN {
        return Err(FrameDecodeError::TooLarge(len as usize));
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

/// Error encoding an envelope (bincode or size limit).
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[source] bincode::Error),
    #[error("envelope too large ({0} bytes)")]
    TooLarge(usize),
}

/// Error reading or decoding a frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("envelope too large ({0} bytes)")]
    TooLarge(usize),
    #[error("unknown frame kind 0x{0:02x}")]
    UnknownKind(u8),
    #[error("decode error: {0}")]
    Decode(#[source] bincode::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_file(size: u64) -> Envelope {
        Envelope::StoreFile {
            namespace: "1234".into(),
            key: "pictures/cat.png".into(),
            size,
        }
    }

    #[test]
    fn roundtrip_boundary_sizes() {
        for size in [0u64, 1, 5 * 1024 * 1024 * 1024, u64::MAX] {
            let msg = store_file(size);
            let body = encode_envelope(&msg).unwrap();
            assert_eq!(decode_envelope(&body).unwrap(), msg);
        }
    }

    #[test]
    fn roundtrip_get_file() {
        let msg = Envelope::GetFile {
            namespace: String::new(),
            key: "k".into(),
        };
        let body = encode_envelope(&msg).unwrap();
        assert_eq!(decode_envelope(&body).unwrap(), msg);
    }

    #[test]
    fn encoding_is_deterministic() {
        let a = encode_envelope(&store_file(42)).unwrap();
        let b = encode_envelope(&store_file(42)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn unknown_tag_rejected() {
        let mut body = encode_envelope(&store_file(1)).unwrap();
        // fixint encoding: variant index is the leading u32.
        body[..4].copy_from_slice(&7u32.to_le_bytes());
        assert!(matches!(
            decode_envelope(&body),
            Err(FrameDecodeError::Decode(_))
        ));
    }

    #[test]
    fn truncated_and_trailing_rejected() {
        let body = encode_envelope(&store_file(9)).unwrap();
        assert!(decode_envelope(&body[..body.len() - 1]).is_err());
        let mut long = body.clone();
        long.push(0);
        assert!(decode_envelope(&long).is_err());
        assert!(decode_envelope(&[]).is_err());
    }

    #[test]
    fn oversized_envelope_rejected() {
        let msg = Envelope::GetFile {
            namespace: "ns".into(),
            key: "x".repeat(MAX_ENVELOPE_LEN as usize + 1),
        };
        assert!(matches!(
            encode_envelope(&msg),
            Err(FrameEncodeError::TooLarge(_))
        ));
    }

    #[test]
    fn control_frame_layout() {
        let body = encode_envelope(&store_file(3)).unwrap();
        let frame = control_frame(&body);
        assert_eq!(frame[0], FrameKind::Control.as_byte());
        let len = u32::from_le_bytes([frame[1], frame[2], frame[3], frame[4]]) as usize;
        assert_eq!(len, body.len());
        assert_eq!(&frame[1 + LEN_SIZE..], &body[..]);
    }

    #[test]
    fn stream_headers() {
        assert_eq!(stream_header(), [0x02]);
        let h = sized_stream_header(0x0102);
        assert_eq!(h[0], 0x02);
        assert_eq!(u64::from_le_bytes(h[1..].try_into().unwrap()), 0x0102);
    }

    #[tokio::test]
    async fn read_control_body_after_kind() {
        let body = encode_envelope(&store_file(77)).unwrap();
        let frame = control_frame(&body);
        let mut rest = &frame[1..];
        let read = read_control_body(&mut rest).await.unwrap();
        assert_eq!(decode_envelope(&read).unwrap(), store_file(77));
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn read_control_body_rejects_huge_length() {
        let mut bytes: &[u8] = &(MAX_ENVELOPE_LEN + 1).to_le_bytes();
        assert!(matches!(
            read_control_body(&mut bytes).await,
            Err(FrameDecodeError::TooLarge(_))
        ));
    }
}
