//! Logical call messages (§3) and their encoding into the flat byte blob
//! that the assembler (§4.3) fragments across frames.
//!
//! A `call req`/`call res` frame's payload is `flags(u8)` followed by a
//! slice of this blob; `flags` is the only field repeated on every
//! continuation frame (it carries that frame's "more fragments" bit). The
//! rest of the head (ttl, tracing, service, headers, checksum) appears
//! exactly once, at the start of the blob, landing in the first frame.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::checksum::ChecksumType;
use crate::error::AssemblyError;

/// Bit 0 of the per-frame flags byte: more fragments follow for this id.
pub const FLAG_MORE_FRAGMENTS: u8 = 0x01;

/// Maximum arg1 (endpoint name) size: 16 KiB (§3).
pub const MAX_ARG1_SIZE: usize = 16 * 1024;

/// Maximum service name length in bytes (§3: `str<=255`).
pub const MAX_SERVICE_NAME_LEN: usize = 255;

/// 25-byte tracing block carried on every call req/res head.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Tracing {
    pub trace_id: u64,
    pub span_id: u64,
    pub parent_id: u64,
    pub flags: u8,
}

impl Tracing {
    pub const ENCODED_LEN: usize = 25;

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64(self.span_id);
        buf.put_u64(self.parent_id);
        buf.put_u64(self.trace_id);
        buf.put_u8(self.flags);
    }

    pub fn decode(buf: &mut Bytes) -> Result<Self, AssemblyError> {
        if buf.len() < Self::ENCODED_LEN {
            return Err(AssemblyError::ArgLengthMismatch);
        }
        let span_id = buf.get_u64();
        let parent_id = buf.get_u64();
        let trace_id = buf.get_u64();
        let flags = buf.get_u8();
        Ok(Tracing { trace_id, span_id, parent_id, flags })
    }
}

pub(crate) fn encode_header_list(buf: &mut BytesMut, headers: &[(String, String)]) {
    buf.put_u8(headers.len().min(u8::MAX as usize) as u8);
    for (k, v) in headers.iter().take(u8::MAX as usize) {
        buf.put_u16(k.len() as u16);
        buf.put_slice(k.as_bytes());
        buf.put_u16(v.len() as u16);
        buf.put_slice(v.as_bytes());
    }
}

pub(crate) fn decode_header_list(buf: &mut Bytes) -> Result<Vec<(String, String)>, AssemblyError> {
    if buf.is_empty() {
        return Err(AssemblyError::ArgLengthMismatch);
    }
    let nh = buf.get_u8();
    let mut headers = Vec::with_capacity(nh as usize);
    for _ in 0..nh {
        let k = decode_str16(buf)?;
        let v = decode_str16(buf)?;
        headers.push((k, v));
    }
    Ok(headers)
}

fn decode_str16(buf: &mut Bytes) -> Result<String, AssemblyError> {
    if buf.len() < 2 {
        return Err(AssemblyError::ArgLengthMismatch);
    }
    let len = buf.get_u16() as usize;
    if buf.len() < len {
        return Err(AssemblyError::ArgLengthMismatch);
    }
    let bytes = buf.split_to(len);
    String::from_utf8(bytes.to_vec()).map_err(|_| AssemblyError::InvalidUtf8)
}

fn encode_arg(buf: &mut BytesMut, arg: &[u8]) {
    buf.put_u16(arg.len() as u16);
    buf.put_slice(arg);
}

fn decode_arg(buf: &mut Bytes) -> Result<Bytes, AssemblyError> {
    if buf.len() < 2 {
        return Err(AssemblyError::ArgLengthMismatch);
    }
    let len = buf.get_u16() as usize;
    if buf.len() < len {
        return Err(AssemblyError::ArgLengthMismatch);
    }
    Ok(buf.split_to(len))
}

/// The three opaque argument slices every call carries: endpoint, app
/// headers, and body (§1, §3). The transport never interprets these.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CallArgs {
    pub arg1: Bytes,
    pub arg2: Bytes,
    pub arg3: Bytes,
}

/// Non-arg fields of a `call req` logical message (§3).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallRequestHead {
    pub ttl_ms: u32,
    pub tracing: Tracing,
    pub service: String,
    pub headers: Vec<(String, String)>,
    pub checksum_type: ChecksumType,
}

impl CallRequestHead {
    /// Encode head + args into the flat blob that the assembler fragments.
    pub fn encode_with_args(&self, args: &CallArgs) -> Result<Bytes, AssemblyError> {
        if self.service.len() > MAX_SERVICE_NAME_LEN {
            return Err(AssemblyError::ArgLengthMismatch);
        }
        if args.arg1.len() > MAX_ARG1_SIZE {
            return Err(AssemblyError::ArgLengthMismatch);
        }
        let mut buf = BytesMut::new();
        buf.put_u32(self.ttl_ms);
        self.tracing.encode(&mut buf);
        buf.put_u8(self.service.len() as u8);
        buf.put_slice(self.service.as_bytes());
        encode_header_list(&mut buf, &self.headers);
        buf.put_u8(self.checksum_type.as_u8());
        let csum = self.checksum_type.compute(&args.arg1, &args.arg2, &args.arg3);
        if self.checksum_type.value_len() > 0 {
            buf.put_u32(csum);
        }
        encode_arg(&mut buf, &args.arg1);
        encode_arg(&mut buf, &args.arg2);
        encode_arg(&mut buf, &args.arg3);
        Ok(buf.freeze())
    }

    /// Decode head + args from a fully reassembled blob, verifying the
    /// checksum. Returns `AssemblyError::ChecksumMismatch` on mismatch,
    /// never a connection-fatal error (§4.3).
    pub fn decode(mut buf: Bytes) -> Result<(Self, CallArgs), AssemblyError> {
        if buf.len() < 4 {
            return Err(AssemblyError::ArgLengthMismatch);
        }
        let ttl_ms = buf.get_u32();
        let tracing = Tracing::decode(&mut buf)?;
        if buf.is_empty() {
            return Err(AssemblyError::ArgLengthMismatch);
        }
        let service_len = buf.get_u8() as usize;
        if buf.len() < service_len {
            return Err(AssemblyError::ArgLengthMismatch);
        }
        let service = String::from_utf8(buf.split_to(service_len).to_vec())
            .map_err(|_| AssemblyError::InvalidUtf8)?;
        let headers = decode_header_list(&mut buf)?;
        if buf.is_empty() {
            return Err(AssemblyError::ArgLengthMismatch);
        }
        let csumtype_byte = buf.get_u8();
        let checksum_type =
            ChecksumType::from_u8(csumtype_byte).ok_or(AssemblyError::ArgLengthMismatch)?;
        let csum = if checksum_type.value_len() > 0 {
            if buf.len() < 4 {
                return Err(AssemblyError::ArgLengthMismatch);
            }
            buf.get_u32()
        } else {
            0
        };
        let arg1 = decode_arg(&mut buf)?;
        let arg2 = decode_arg(&mut buf)?;
        let arg3 = decode_arg(&mut buf)?;
        if !buf.is_empty() {
            return Err(AssemblyError::ArgLengthMismatch);
        }
        if !checksum_type.verify(&arg1, &arg2, &arg3, csum) {
            return Err(AssemblyError::ChecksumMismatch);
        }
        Ok((
            CallRequestHead { ttl_ms, tracing, service, headers, checksum_type },
            CallArgs { arg1, arg2, arg3 },
        ))
    }
}

/// Application-visible outcome of a `call res` (§3, §4.8): `Ok` carries a
/// successful handler result, `ApplicationError` carries a handler-raised
/// error still delivered via the normal response envelope (code=0x01).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResponseCode {
    Ok = 0x00,
    ApplicationError = 0x01,
}

impl ResponseCode {
    pub fn from_u8(val: u8) -> Option<Self> {
        match val {
            0x00 => Some(ResponseCode::Ok),
            0x01 => Some(ResponseCode::ApplicationError),
            _ => None,
        }
    }
}

/// Non-arg fields of a `call res` logical message (§3).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallResponseHead {
    pub code: ResponseCode,
    pub tracing: Tracing,
    pub headers: Vec<(String, String)>,
    pub checksum_type: ChecksumType,
}

impl CallResponseHead {
    pub fn encode_with_args(&self, args: &CallArgs) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(self.code as u8);
        self.tracing.encode(&mut buf);
        encode_header_list(&mut buf, &self.headers);
        buf.put_u8(self.checksum_type.as_u8());
        let csum = self.checksum_type.compute(&args.arg1, &args.arg2, &args.arg3);
        if self.checksum_type.value_len() > 0 {
            buf.put_u32(csum);
        }
        encode_arg(&mut buf, &args.arg1);
        encode_arg(&mut buf, &args.arg2);
        encode_arg(&mut buf, &args.arg3);
        buf.freeze()
    }

    pub fn decode(mut buf: Bytes) -> Result<(Self, CallArgs), AssemblyError> {
        if buf.is_empty() {
            return Err(AssemblyError::ArgLengthMismatch);
        }
        let code_byte = buf.get_u8();
        let code = ResponseCode::from_u8(code_byte).ok_or(AssemblyError::ArgLengthMismatch)?;
        let tracing = Tracing::decode(&mut buf)?;
        let headers = decode_header_list(&mut buf)?;
        if buf.is_empty() {
            return Err(AssemblyError::ArgLengthMismatch);
        }
        let csumtype_byte = buf.get_u8();
        let checksum_type =
            ChecksumType::from_u8(csumtype_byte).ok_or(AssemblyError::ArgLengthMismatch)?;
        let csum = if checksum_type.value_len() > 0 {
            if buf.len() < 4 {
                return Err(AssemblyError::ArgLengthMismatch);
            }
            buf.get_u32()
        } else {
            0
        };
        let arg1 = decode_arg(&mut buf)?;
        let arg2 = decode_arg(&mut buf)?;
        let arg3 = decode_arg(&mut buf)?;
        if !buf.is_empty() {
            return Err(AssemblyError::ArgLengthMismatch);
        }
        if !checksum_type.verify(&arg1, &arg2, &arg3, csum) {
            return Err(AssemblyError::ChecksumMismatch);
        }
        Ok((
            CallResponseHead { code, tracing, headers, checksum_type },
            CallArgs { arg1, arg2, arg3 },
        ))
    }
}
