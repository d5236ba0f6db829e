//! Pluggable arg serialization contract (§6.3, §9 design notes).
//!
//! The core transport never interprets `arg2`/`arg3`; a [`Scheme`] is the
//! narrow interface that turns typed headers/bodies into the opaque bytes
//! the wire actually carries, and back. This mirrors the teacher's `Codec`
//! trait (`src/codec.rs`), generalized from "one fixed wire encoding" to
//! "headers and body each have their own (de)serialize pair".

pub mod json;
pub mod raw;

use bytes::Bytes;

/// A named, pluggable arg serializer/deserializer (§6.3).
///
/// `Headers` and `Body` are the scheme's typed representations of arg2 and
/// arg3 respectively; `raw` uses `Bytes` for both, `json` uses
/// `serde_json::Value` by default but works with any `Serialize +
/// DeserializeOwned` type via [`json::JsonScheme`].
pub trait Scheme {
    type Headers;
    type Body;

    /// Scheme name as it appears in the `as` transport header (§4.2's
    /// `encode_header_list`/`decode_header_list` carry this alongside
    /// other call headers).
    const NAME: &'static str;

    fn serialize_headers(headers: &Self::Headers) -> Result<Bytes, Box<dyn std::error::Error + Send + Sync>>;
    fn deserialize_headers(buf: Bytes) -> Result<Self::Headers, Box<dyn std::error::Error + Send + Sync>>;
    fn serialize_body(body: &Self::Body) -> Result<Bytes, Box<dyn std::error::Error + Send + Sync>>;
    fn deserialize_body(buf: Bytes) -> Result<Self::Body, Box<dyn std::error::Error + Send + Sync>>;
}
