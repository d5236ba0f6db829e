//! Frame codec (§4.1, §8).
//!
//! A frame is a fixed 16-byte header followed by a variable payload, total
//! length ≤ 64 KiB. The codec is stateless per frame: framing errors are
//! always connection-fatal, never call-scoped (that distinction belongs to
//! `assembler`/`connection`).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::FrameError;

/// Total frame size (header + payload) must never exceed this.
pub const MAX_FRAME_SIZE: usize = 65_535;

/// Size of the fixed frame header, in bytes.
pub const HEADER_SIZE: usize = 16;

/// Frame type tags (§3).
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FrameType {
    InitReq = 0x01,
    InitRes = 0x02,
    CallReq = 0x03,
    CallRes = 0x04,
    CallReqContinue = 0x13,
    CallResContinue = 0x14,
    Cancel = 0xC0,
    Claim = 0xC1,
    PingReq = 0xD0,
    PingRes = 0xD1,
    Error = 0xFF,
}

impl FrameType {
    pub fn from_u8(val: u8) -> Option<Self> {
        Some(match val {
            0x01 => FrameType::InitReq,
            0x02 => FrameType::InitRes,
            0x03 => FrameType::CallReq,
            0x04 => FrameType::CallRes,
            0x13 => FrameType::CallReqContinue,
            0x14 => FrameType::CallResContinue,
            0xC0 => FrameType::Cancel,
            0xC1 => FrameType::Claim,
            0xD0 => FrameType::PingReq,
            0xD1 => FrameType::PingRes,
            0xFF => FrameType::Error,
            _ => return None,
        })
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Whether this type carries a logical-message continuation (shares an
    /// id with a preceding `call req`/`call res`).
    pub fn is_continuation(self) -> bool {
        matches!(self, FrameType::CallReqContinue | FrameType::CallResContinue)
    }
}

/// A single on-wire frame: 16-byte header plus payload.
///
/// Invariant: `16 <= size(frame) <= 65535` where `size` is `HEADER_SIZE +
/// payload.len()`. Construction through [`Frame::new`] enforces this.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub id: u32,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(frame_type: FrameType, id: u32, payload: Bytes) -> Result<Self, FrameError> {
        let total = HEADER_SIZE + payload.len();
        if total > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge { size: total as u32 });
        }
        Ok(Frame { frame_type, id, payload })
    }

    /// Total encoded size of this frame, including the header.
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Encode this frame's header + payload into `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        let size = self.encoded_len() as u16;
        buf.put_u16(size);
        buf.put_u8(self.frame_type.as_u8());
        buf.put_u8(0); // reserved
        buf.put_u32(self.id);
        buf.put_bytes(0, 8); // reserved
        buf.put_slice(&self.payload);
    }

    /// Decode a frame from a buffer that holds exactly one frame's bytes
    /// (header + payload, as already delimited by the caller via `size`).
    pub fn decode(mut buf: Bytes) -> Result<Self, FrameError> {
        if buf.len() < HEADER_SIZE {
            return Err(FrameError::TooSmall { size: buf.len() as u16 });
        }
        let size = buf.get_u16();
        if (size as usize) < HEADER_SIZE {
            return Err(FrameError::TooSmall { size });
        }
        let frame_type_byte = buf.get_u8();
        let frame_type = FrameType::from_u8(frame_type_byte)
            .ok_or(FrameError::UnknownType(frame_type_byte))?;
        let _reserved = buf.get_u8();
        let id = buf.get_u32();
        buf.advance(8); // reserved
        if buf.len() != size as usize - HEADER_SIZE {
            return Err(FrameError::Truncated);
        }
        Ok(Frame { frame_type, id, payload: buf })
    }

    /// Write this frame to an async writer, length-delimited per §4.1.
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, w: &mut W) -> Result<(), FrameError> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf);
        w.write_all(&buf).await.map_err(FrameError::from)?;
        Ok(())
    }

    /// Read one frame from an async reader.
    ///
    /// Returns `Err(FrameError::Truncated)` only if bytes were read before
    /// EOF; a clean EOF at a frame boundary is reported by the caller via
    /// the `Ok`/`Err` of the initial length read (see `read_size_prefix`).
    pub async fn read_from<R: AsyncRead + Unpin>(r: &mut R) -> Result<Self, FrameError> {
        let mut size_buf = [0u8; 2];
        r.read_exact(&mut size_buf).await.map_err(FrameError::from)?;
        let size = u16::from_be_bytes(size_buf);
        if (size as usize) < HEADER_SIZE {
            return Err(FrameError::TooSmall { size });
        }
        let rest_len = size as usize - 2;
        let mut rest = BytesMut::zeroed(rest_len);
        r.read_exact(&mut rest).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                FrameError::Truncated
            } else {
                FrameError::Io(e)
            }
        })?;

        let mut full = BytesMut::with_capacity(2 + rest_len);
        full.put_u16(size);
        full.extend_from_slice(&rest);
        Frame::decode(full.freeze())
    }

    /// Like [`Frame::read_from`] but distinguishes a clean EOF (peer closed
    /// between frames) from a truncated frame (peer closed mid-frame).
    /// Returns `Ok(None)` on clean EOF.
    pub async fn try_read_from<R: AsyncRead + Unpin>(
        r: &mut R,
    ) -> Result<Option<Self>, FrameError> {
        let mut size_buf = [0u8; 2];
        match r.read_exact(&mut size_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(FrameError::Io(e)),
        }
        let size = u16::from_be_bytes(size_buf);
        if (size as usize) < HEADER_SIZE {
            return Err(FrameError::TooSmall { size });
        }
        let rest_len = size as usize - 2;
        let mut rest = BytesMut::zeroed(rest_len);
        r.read_exact(&mut rest).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                FrameError::Truncated
            } else {
                FrameError::Io(e)
            }
        })?;

        let mut full = BytesMut::with_capacity(2 + rest_len);
        full.put_u16(size);
        full.extend_from_slice(&rest);
        Ok(Some(Frame::decode(full.freeze())?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_type_roundtrip() {
        let types = [
            FrameType::InitReq,
            FrameType::InitRes,
            FrameType::CallReq,
            FrameType::CallRes,
            FrameType::CallReqContinue,
            FrameType::CallResContinue,
            FrameType::Cancel,
            FrameType::Claim,
            FrameType::PingReq,
            FrameType::PingRes,
            FrameType::Error,
        ];
        for t in types {
            assert_eq!(FrameType::from_u8(t.as_u8()), Some(t));
        }
    }

    #[test]
    fn encode_decode_identity() {
        let frame = Frame::new(FrameType::CallReq, 7, Bytes::from_static(b"hello")).unwrap();
        let mut buf = BytesMut::new();
        frame.encode(&mut buf);
        assert_eq!(buf.len(), HEADER_SIZE + 5);
        let decoded = Frame::decode(buf.freeze()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn empty_payload_roundtrip() {
        let frame = Frame::new(FrameType::PingReq, 1, Bytes::new()).unwrap();
        let mut buf = BytesMut::new();
        frame.encode(&mut buf);
        assert_eq!(buf.len(), HEADER_SIZE);
        assert_eq!(Frame::decode(buf.freeze()).unwrap(), frame);
    }

    #[test]
    fn rejects_oversized_payload() {
        let payload = vec![0u8; MAX_FRAME_SIZE]; // + header would overflow
        let err = Frame::new(FrameType::CallReq, 1, Bytes::from(payload)).unwrap_err();
        assert!(matches!(err, FrameError::TooLarge { .. }));
    }

    #[test]
    fn decode_rejects_undersized_size_field() {
        let mut buf = BytesMut::new();
        buf.put_u16(10); // below HEADER_SIZE
        buf.put_bytes(0, 8);
        let err = Frame::decode(buf.freeze()).unwrap_err();
        assert!(matches!(err, FrameError::TooSmall { .. }));
    }

    #[test]
    fn decode_rejects_unknown_type() {
        let mut buf = BytesMut::new();
        buf.put_u16(HEADER_SIZE as u16);
        buf.put_u8(0x42);
        buf.put_bytes(0, 13);
        let err = Frame::decode(buf.freeze()).unwrap_err();
        assert!(matches!(err, FrameError::UnknownType(0x42)));
    }

    #[test]
    fn decode_rejects_truncated_payload() {
        let mut buf = BytesMut::new();
        buf.put_u16(HEADER_SIZE as u16 + 5); // claims 5 payload bytes
        buf.put_u8(FrameType::CallReq.as_u8());
        buf.put_u8(0);
        buf.put_u32(1);
        buf.put_bytes(0, 8);
        // no payload bytes appended
        let err = Frame::decode(buf.freeze()).unwrap_err();
        assert!(matches!(err, FrameError::Truncated));
    }

    #[tokio::test]
    async fn write_then_read_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let frame = Frame::new(FrameType::CallRes, 42, Bytes::from_static(b"payload")).unwrap();
        frame.write_to(&mut a).await.unwrap();
        let read = Frame::read_from(&mut b).await.unwrap();
        assert_eq!(read, frame);
    }

    #[tokio::test]
    async fn try_read_distinguishes_clean_eof() {
        let (a, mut b) = tokio::io::duplex(4096);
        drop(a);
        let read = Frame::try_read_from(&mut b).await.unwrap();
        assert!(read.is_none());
    }
}
