//! `raw` scheme: identity pass-through (§6.3).
//!
//! Mirrors the teacher's `RawCodec` (`src/codec.rs`): headers and body are
//! already bytes, so (de)serialization never fails.

use bytes::Bytes;

use super::Scheme;

/// Identity scheme: both headers and body are opaque `Bytes`, passed
/// through unchanged. Useful for proxies and for testing the transport
/// without a real serialization format in the loop.
pub struct RawScheme;

impl Scheme for RawScheme {
    type Headers = Bytes;
    type Body = Bytes;

    const NAME: &'static str = "raw";

    fn serialize_headers(headers: &Bytes) -> Result<Bytes, Box<dyn std::error::Error + Send + Sync>> {
        Ok(headers.clone())
    }

    fn deserialize_headers(buf: Bytes) -> Result<Bytes, Box<dyn std::error::Error + Send + Sync>> {
        Ok(buf)
    }

    fn serialize_body(body: &Bytes) -> Result<Bytes, Box<dyn std::error::Error + Send + Sync>> {
        Ok(body.clone())
    }

    fn deserialize_body(buf: Bytes) -> Result<Bytes, Box<dyn std::error::Error + Send + Sync>> {
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_scheme_is_identity() {
        let body = Bytes::from_static(b"hello");
        let encoded = RawScheme::serialize_body(&body).unwrap();
        assert_eq!(encoded, body);
        let decoded = RawScheme::deserialize_body(encoded).unwrap();
        assert_eq!(decoded, body);
    }
}
