//! Frame codec for the wire protocol
//!
//! Every message travels as a 36-byte header followed by its payload:
//!
//! | Offset | Size | Field                                      |
//! |--------|------|--------------------------------------------|
//! | 0      | 4    | magic                                      |
//! | 4      | 4    | chain id                                   |
//! | 8      | 3    | reserved                                   |
//! | 11     | 1    | protocol version                           |
//! | 12     | 12   | message name, NUL terminated               |
//! | 24     | 4    | payload length                             |
//! | 28     | 4    | payload CRC-32                             |
//! | 32     | 4    | header CRC-32 over bytes 0..32             |
//!
//! Integers are big-endian. A header whose magic, chain id or version does
//! not match the local node is rejected before any payload byte is read.

use crate::network::message::{MessageKind, MAGIC, MAX_MESSAGE_SIZE};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Size of the checksummed part of the header
pub const HEADER_BODY_LEN: usize = 32;

/// Size of the full header including its checksum
pub const HEADER_LEN: usize = 36;

/// Longest message name that still leaves room for the NUL terminator
pub const MAX_NAME_LEN: usize = 11;

const NAME_FIELD_LEN: usize = 12;

/// Frame encoding/decoding errors
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("Protocol mismatch: {field} expected {expected}, got {actual}")]
    ProtocolMismatch {
        field: &'static str,
        expected: String,
        actual: String,
    },
    #[error("Header checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    HeaderChecksum { expected: u32, actual: u32 },
    #[error("Payload checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    PayloadChecksum { expected: u32, actual: u32 },
    #[error("Message too large: {0} bytes (max: {1})")]
    MessageTooLarge(usize, usize),
    #[error("Message name too long: {0:?} (max: {MAX_NAME_LEN} bytes)")]
    NameTooLong(String),
    #[error("Invalid message name in header")]
    InvalidName,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl FrameError {
    pub fn is_protocol_mismatch(&self) -> bool {
        matches!(self, FrameError::ProtocolMismatch { .. })
    }
}

/// A single decoded message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub name: String,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(name: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            payload: payload.into(),
        }
    }

    /// Build a frame for a known message kind
    pub fn from_kind(kind: MessageKind, payload: impl Into<Bytes>) -> Self {
        Self::new(kind.name(), payload)
    }

    pub fn kind(&self) -> Option<MessageKind> {
        MessageKind::from_name(&self.name)
    }
}

/// Raw header fields sliced out of the first 36 bytes of a frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    pub magic: [u8; 4],
    pub chain_id: u32,
    pub version: u8,
    name: [u8; NAME_FIELD_LEN],
    pub payload_len: u32,
    pub payload_checksum: u32,
    pub header_checksum: u32,
    computed_checksum: u32,
}

impl FrameHeader {
    fn parse(buf: &[u8]) -> Self {
        let u32_at =
            |at: usize| u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);

        let mut magic = [0u8; 4];
        magic.copy_from_slice(&buf[0..4]);
        let mut name = [0u8; NAME_FIELD_LEN];
        name.copy_from_slice(&buf[12..24]);

        Self {
            magic,
            chain_id: u32_at(4),
            version: buf[11],
            name,
            payload_len: u32_at(24),
            payload_checksum: u32_at(28),
            header_checksum: u32_at(32),
            computed_checksum: crc32fast::hash(&buf[..HEADER_BODY_LEN]),
        }
    }

    /// Message name up to its NUL terminator
    pub fn name(&self) -> Result<&str, FrameError> {
        let end = self
            .name
            .iter()
            .position(|b| *b == 0)
            .ok_or(FrameError::InvalidName)?;
        std::str::from_utf8(&self.name[..end]).map_err(|_| FrameError::InvalidName)
    }
}

/// Write the header and payload of one frame into `dst`
fn write_frame(
    chain_id: u32,
    version: u8,
    name: &str,
    payload: &[u8],
    dst: &mut BytesMut,
) -> Result<(), FrameError> {
    if name.len() > MAX_NAME_LEN {
        return Err(FrameError::NameTooLong(name.to_string()));
    }
    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(FrameError::MessageTooLarge(payload.len(), MAX_MESSAGE_SIZE));
    }

    let mut header = [0u8; HEADER_BODY_LEN];
    header[0..4].copy_from_slice(&MAGIC);
    header[4..8].copy_from_slice(&chain_id.to_be_bytes());
    // 8..11 reserved
    header[11] = version;
    header[12..12 + name.len()].copy_from_slice(name.as_bytes());
    header[24..28].copy_from_slice(&(payload.len() as u32).to_be_bytes());
    header[28..32].copy_from_slice(&crc32fast::hash(payload).to_be_bytes());

    dst.reserve(HEADER_LEN + payload.len());
    dst.put_slice(&header);
    dst.put_u32(crc32fast::hash(&header));
    dst.put_slice(payload);

    Ok(())
}

/// Build a complete frame as bytes
pub fn build_frame(
    chain_id: u32,
    version: u8,
    name: &str,
    payload: &[u8],
) -> Result<Vec<u8>, FrameError> {
    let mut buf = BytesMut::new();
    write_frame(chain_id, version, name, payload, &mut buf)?;
    Ok(buf.to_vec())
}

/// Parse one complete frame from a byte slice, validating it against the
/// given chain id and version. Returns the frame and the bytes consumed.
pub fn parse_frame(
    chain_id: u32,
    version: u8,
    data: &[u8],
) -> Result<(Frame, usize), FrameError> {
    let mut codec = FrameCodec::new(chain_id, version);
    let mut buf = BytesMut::from(data);
    match codec.decode(&mut buf)? {
        Some(frame) => Ok((frame, data.len() - buf.len())),
        None => Err(FrameError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "truncated frame",
        ))),
    }
}

/// Codec validating frames against the local chain id and protocol version
#[derive(Debug)]
pub struct FrameCodec {
    chain_id: u32,
    version: u8,
    /// Header of the frame whose payload is still being received
    current: Option<(String, FrameHeader)>,
}

impl FrameCodec {
    pub fn new(chain_id: u32, version: u8) -> Self {
        Self {
            chain_id,
            version,
            current: None,
        }
    }

    fn validate(&self, header: &FrameHeader) -> Result<String, FrameError> {
        if header.magic != MAGIC {
            return Err(FrameError::ProtocolMismatch {
                field: "magic",
                expected: hex::encode(MAGIC),
                actual: hex::encode(header.magic),
            });
        }
        if header.chain_id != self.chain_id {
            return Err(FrameError::ProtocolMismatch {
                field: "chain id",
                expected: self.chain_id.to_string(),
                actual: header.chain_id.to_string(),
            });
        }
        if header.version != self.version {
            return Err(FrameError::ProtocolMismatch {
                field: "version",
                expected: self.version.to_string(),
                actual: header.version.to_string(),
            });
        }
        if header.header_checksum != header.computed_checksum {
            return Err(FrameError::HeaderChecksum {
                expected: header.header_checksum,
                actual: header.computed_checksum,
            });
        }

        let name = header.name()?.to_string();

        let len = header.payload_len as usize;
        if len > MAX_MESSAGE_SIZE {
            return Err(FrameError::MessageTooLarge(len, MAX_MESSAGE_SIZE));
        }

        Ok(name)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if self.current.is_none() {
            if src.len() < HEADER_LEN {
                return Ok(None);
            }

            let header = FrameHeader::parse(&src[..HEADER_LEN]);
            let name = self.validate(&header)?;
            src.advance(HEADER_LEN);
            self.current = Some((name, header));
        }

        let len = match &self.current {
            Some((_, header)) => header.payload_len as usize,
            None => return Ok(None),
        };

        if src.len() < len {
            src.reserve(len - src.len());
            return Ok(None);
        }

        let payload = src.split_to(len).freeze();
        let (name, header) = match self.current.take() {
            Some(current) => current,
            None => return Ok(None),
        };

        let actual = crc32fast::hash(&payload);
        if actual != header.payload_checksum {
            return Err(FrameError::PayloadChecksum {
                expected: header.payload_checksum,
                actual,
            });
        }

        Ok(Some(Frame { name, payload }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        write_frame(self.chain_id, self.version, &item.name, &item.payload, dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHAIN: u32 = 7;
    const VERSION: u8 = 1;

    #[test]
    fn test_roundtrip() {
        let cases: [(&str, &[u8]); 4] = [
            ("hello", &b"hello"[..]),
            ("ok", &b"ok"[..]),
            ("newblock", &[0u8, 1, 2, 255][..]),
            ("abcdefghijk", &b""[..]),
        ];
        for (name, payload) in cases {
            let bytes = build_frame(CHAIN, VERSION, name, payload).unwrap();
            assert_eq!(bytes.len(), HEADER_LEN + payload.len());

            let (frame, consumed) = parse_frame(CHAIN, VERSION, &bytes).unwrap();
            assert_eq!(consumed, bytes.len());
            assert_eq!(frame.name, name);
            assert_eq!(&frame.payload[..], payload);
        }
    }

    #[test]
    fn test_header_layout() {
        let bytes = build_frame(0x0102_0304, 9, "bye", b"xyz").unwrap();
        assert_eq!(&bytes[0..4], &MAGIC);
        assert_eq!(&bytes[4..8], &[1, 2, 3, 4]);
        assert_eq!(&bytes[8..11], &[0, 0, 0]);
        assert_eq!(bytes[11], 9);
        assert_eq!(&bytes[12..16], b"bye\0");
        assert_eq!(&bytes[24..28], &3u32.to_be_bytes());
        assert_eq!(&bytes[28..32], &crc32fast::hash(b"xyz").to_be_bytes());
        assert_eq!(&bytes[32..36], &crc32fast::hash(&bytes[..32]).to_be_bytes());
    }

    #[test]
    fn test_name_too_long() {
        let result = build_frame(CHAIN, VERSION, "abcdefghijkl", b"");
        assert!(matches!(result, Err(FrameError::NameTooLong(_))));
    }

    #[test]
    fn test_payload_corruption_detected() {
        let bytes = build_frame(CHAIN, VERSION, "newblock", b"some block bytes").unwrap();
        for i in HEADER_LEN..bytes.len() {
            let mut corrupted = bytes.clone();
            corrupted[i] ^= 0x01;
            let result = parse_frame(CHAIN, VERSION, &corrupted);
            assert!(
                matches!(result, Err(FrameError::PayloadChecksum { .. })),
                "byte {} not detected",
                i
            );
        }
    }

    #[test]
    fn test_identity_corruption_is_protocol_mismatch() {
        let bytes = build_frame(CHAIN, VERSION, "hello", b"hello").unwrap();
        for i in (0..8).chain(std::iter::once(11)) {
            let mut corrupted = bytes.clone();
            corrupted[i] ^= 0x80;
            let err = parse_frame(CHAIN, VERSION, &corrupted).unwrap_err();
            assert!(err.is_protocol_mismatch(), "byte {}: {}", i, err);
        }
    }

    #[test]
    fn test_header_corruption_detected() {
        let bytes = build_frame(CHAIN, VERSION, "hello", b"hello").unwrap();
        for i in (8..11).chain(12..32) {
            let mut corrupted = bytes.clone();
            corrupted[i] ^= 0x04;
            let err = parse_frame(CHAIN, VERSION, &corrupted).unwrap_err();
            assert!(
                matches!(err, FrameError::HeaderChecksum { .. }),
                "byte {}: {}",
                i,
                err
            );
        }
    }

    #[test]
    fn test_mismatch_rejected_before_payload() {
        let bytes = build_frame(9, VERSION, "hello", b"hello").unwrap();
        let mut codec = FrameCodec::new(CHAIN, VERSION);
        let mut buf = BytesMut::from(&bytes[..HEADER_LEN]);

        let err = codec.decode(&mut buf).unwrap_err();
        assert!(err.is_protocol_mismatch());
    }

    #[test]
    fn test_partial_frames() {
        let bytes = build_frame(CHAIN, VERSION, "syncroute", b"syncroute").unwrap();
        let mut codec = FrameCodec::new(CHAIN, VERSION);

        let mut buf = BytesMut::from(&bytes[..20]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&bytes[20..HEADER_LEN + 3]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&bytes[HEADER_LEN + 3..]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.kind(), Some(MessageKind::SyncRoute));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_multiple_frames() {
        let mut codec = FrameCodec::new(CHAIN, VERSION);
        let mut buf = BytesMut::new();
        codec.encode(Frame::from_kind(MessageKind::Hello, "hello"), &mut buf).unwrap();
        codec.encode(Frame::from_kind(MessageKind::Ok, "ok"), &mut buf).unwrap();

        let first = codec.decode(&mut buf).unwrap().unwrap();
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.kind(), Some(MessageKind::Hello));
        assert_eq!(second, Frame::new("ok", "ok"));
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_oversized_length_rejected() {
        let mut bytes = build_frame(CHAIN, VERSION, "newblock", b"").unwrap();
        bytes[24..28].copy_from_slice(&((MAX_MESSAGE_SIZE + 1) as u32).to_be_bytes());
        let checksum = crc32fast::hash(&bytes[..32]);
        bytes[32..36].copy_from_slice(&checksum.to_be_bytes());

        let err = parse_frame(CHAIN, VERSION, &bytes).unwrap_err();
        assert!(matches!(err, FrameError::MessageTooLarge(..)));
    }
}
