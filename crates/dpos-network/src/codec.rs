//! Frame codec for peer sessions.
//!
//! ```text
//! +----------+----------+----------+----------+----------+
//! |  Magic   |   Kind   |   Code   |  Length  | Checksum |
//! | 4 bytes  | 1 byte   | 1 byte   | 4 bytes  | 4 bytes  |
//! +----------+----------+----------+----------+----------+
//! |                   Payload (Length bytes)              |
//! +-------------------------------------------------------+
//! ```
//!
//! - Magic: first 4 bytes of BLAKE2b-256(nethash)
//! - Kind: request, reply or error
//! - Code: procedure index for requests and replies, error kind for errors
//! - Length: payload length (big-endian)
//! - Checksum: first 4 bytes of BLAKE2b-256(payload)

use crate::error::{NetworkError, NetworkResult, TransportErrorKind};
use crate::message::Rpc;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use dpos_chain::blake2b_256;
use tokio_util::codec::{Decoder, Encoder};

/// Header size: magic (4) + kind (1) + code (1) + length (4) + checksum (4).
const HEADER_SIZE: usize = 14;

/// Maximum frame payload.
pub const MAX_FRAME_SIZE: usize = 32 * 1024 * 1024;

/// Frame direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Request = 0,
    Reply = 1,
    Error = 2,
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Request { rpc: Rpc, payload: Bytes },
    Reply { rpc: Rpc, payload: Bytes },
    Error { kind: TransportErrorKind, message: String },
}

fn rpc_code(rpc: Rpc) -> u8 {
    Rpc::ALL.iter().position(|r| *r == rpc).unwrap_or(0) as u8
}

fn rpc_from_code(code: u8) -> NetworkResult<Rpc> {
    Rpc::ALL
        .get(code as usize)
        .copied()
        .ok_or_else(|| NetworkError::InvalidMessage(format!("unknown procedure code {}", code)))
}

fn error_kind_code(kind: TransportErrorKind) -> u8 {
    match kind {
        TransportErrorKind::Validation => 0,
        TransportErrorKind::Generic => 1,
        TransportErrorKind::Timeout => 2,
        TransportErrorKind::Other => 3,
    }
}

fn error_kind_from_code(code: u8) -> TransportErrorKind {
    match code {
        0 => TransportErrorKind::Validation,
        1 => TransportErrorKind::Generic,
        2 => TransportErrorKind::Timeout,
        _ => TransportErrorKind::Other,
    }
}

/// Session frame codec.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    magic: [u8; 4],
    max_size: usize,
}

impl FrameCodec {
    /// Codec for the network identified by `nethash`.
    pub fn for_nethash(nethash: &str) -> Self {
        let hash = blake2b_256(nethash.as_bytes());
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&hash[..4]);
        Self {
            magic,
            max_size: MAX_FRAME_SIZE,
        }
    }

    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    fn checksum(payload: &[u8]) -> [u8; 4] {
        let hash = blake2b_256(payload);
        let mut checksum = [0u8; 4];
        checksum.copy_from_slice(&hash[..4]);
        checksum
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = NetworkError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        if src[0..4] != self.magic {
            return Err(NetworkError::InvalidMessage("Invalid magic".to_string()));
        }

        let kind = src[4];
        let code = src[5];
        let length = u32::from_be_bytes([src[6], src[7], src[8], src[9]]) as usize;
        let checksum: [u8; 4] = [src[10], src[11], src[12], src[13]];

        if length > self.max_size {
            return Err(NetworkError::MessageTooLarge {
                size: length,
                max: self.max_size,
            });
        }

        let total_size = HEADER_SIZE + length;
        if src.len() < total_size {
            src.reserve(total_size - src.len());
            return Ok(None);
        }

        src.advance(HEADER_SIZE);
        let payload = src.split_to(length).freeze();

        if Self::checksum(&payload) != checksum {
            return Err(NetworkError::InvalidMessage("Checksum mismatch".to_string()));
        }

        let frame = match kind {
            k if k == FrameKind::Request as u8 => Frame::Request {
                rpc: rpc_from_code(code)?,
                payload,
            },
            k if k == FrameKind::Reply as u8 => Frame::Reply {
                rpc: rpc_from_code(code)?,
                payload,
            },
            k if k == FrameKind::Error as u8 => Frame::Error {
                kind: error_kind_from_code(code),
                message: String::from_utf8_lossy(&payload).into_owned(),
            },
            other => {
                return Err(NetworkError::InvalidMessage(format!(
                    "unknown frame kind {}",
                    other
                )))
            }
        };
        Ok(Some(frame))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = NetworkError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let (kind, code, payload) = match item {
            Frame::Request { rpc, payload } => (FrameKind::Request, rpc_code(rpc), payload),
            Frame::Reply { rpc, payload } => (FrameKind::Reply, rpc_code(rpc), payload),
            Frame::Error { kind, message } => {
                (FrameKind::Error, error_kind_code(kind), Bytes::from(message))
            }
        };

        if payload.len() > self.max_size {
            return Err(NetworkError::MessageTooLarge {
                size: payload.len(),
                max: self.max_size,
            });
        }

        dst.reserve(HEADER_SIZE + payload.len());
        dst.put_slice(&self.magic);
        dst.put_u8(kind as u8);
        dst.put_u8(code);
        dst.put_u32(payload.len() as u32);
        dst.put_slice(&Self::checksum(&payload));
        dst.put_slice(&payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> FrameCodec {
        FrameCodec::for_nethash("devnet")
    }

    #[test]
    fn test_partial_frame_waits() {
        let mut buf = BytesMut::new();
        codec()
            .encode(
                Frame::Request {
                    rpc: Rpc::GetStatus,
                    payload: Bytes::from_static(b"{}"),
                },
                &mut buf,
            )
            .unwrap();

        let mut partial = buf.split_to(buf.len() - 1);
        assert!(codec().decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn test_error_frame() {
        let mut buf = BytesMut::new();
        codec()
            .encode(
                Frame::Error {
                    kind: TransportErrorKind::Validation,
                    message: "bad request".into(),
                },
                &mut buf,
            )
            .unwrap();
        let frame = codec().decode(&mut buf).unwrap().unwrap();
        assert_eq!(
            frame,
            Frame::Error {
                kind: TransportErrorKind::Validation,
                message: "bad request".into()
            }
        );
    }

    #[test]
    fn test_other_network_rejected() {
        let mut buf = BytesMut::new();
        FrameCodec::for_nethash("mainnet")
            .encode(
                Frame::Reply {
                    rpc: Rpc::GetPeers,
                    payload: Bytes::from_static(b"[]"),
                },
                &mut buf,
            )
            .unwrap();
        assert!(codec().decode(&mut buf).is_err());
    }

    #[test]
    fn test_corrupted_payload() {
        let mut buf = BytesMut::new();
        codec()
            .encode(
                Frame::Reply {
                    rpc: Rpc::GetPeers,
                    payload: Bytes::from_static(b"[1,2,3]"),
                },
                &mut buf,
            )
            .unwrap();
        let last = buf.len() - 1;
        buf[last] ^= 0xff;
        assert!(matches!(
            codec().decode(&mut buf),
            Err(NetworkError::InvalidMessage(_))
        ));
    }

    #[test]
    fn test_oversized_frame() {
        let mut small = codec().with_max_size(4);
        let mut buf = BytesMut::new();
        assert!(small
            .encode(
                Frame::Reply {
                    rpc: Rpc::GetPeers,
                    payload: Bytes::from_static(b"[1,2,3]"),
                },
                &mut buf,
            )
            .is_err());
    }
}
