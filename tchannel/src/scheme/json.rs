//! `json` scheme: `serde_json`-backed headers/body (§6.3).
//!
//! Generalizes the teacher's `JsonCodec` (`src/codec.rs`) from "one fixed
//! message encoding" to "pick the header and body types per call site":
//! `JsonScheme<H, B>` works with any `H`/`B` that are `Serialize +
//! DeserializeOwned`.

use std::marker::PhantomData;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::Scheme;

/// JSON scheme parameterized by header and body types. Most callers use
/// `JsonScheme<serde_json::Value, serde_json::Value>` for untyped access,
/// or their own request/response structs.
pub struct JsonScheme<H, B>(PhantomData<(H, B)>);

impl<H, B> Scheme for JsonScheme<H, B>
where
    H: Serialize + DeserializeOwned,
    B: Serialize + DeserializeOwned,
{
    type Headers = H;
    type Body = B;

    const NAME: &'static str = "json";

    fn serialize_headers(headers: &H) -> Result<Bytes, Box<dyn std::error::Error + Send + Sync>> {
        Ok(Bytes::from(serde_json::to_vec(headers)?))
    }

    fn deserialize_headers(buf: Bytes) -> Result<H, Box<dyn std::error::Error + Send + Sync>> {
        Ok(serde_json::from_slice(&buf)?)
    }

    fn serialize_body(body: &B) -> Result<Bytes, Box<dyn std::error::Error + Send + Sync>> {
        Ok(Bytes::from(serde_json::to_vec(body)?))
    }

    fn deserialize_body(buf: Bytes) -> Result<B, Box<dyn std::error::Error + Send + Sync>> {
        Ok(serde_json::from_slice(&buf)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::collections::BTreeMap;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
    struct Body {
        greeting: String,
    }

    #[test]
    fn json_scheme_roundtrip() {
        type S = JsonScheme<BTreeMap<String, String>, Body>;
        let mut headers = BTreeMap::new();
        headers.insert("cn".to_string(), "caller".to_string());
        let body = Body { greeting: "hello".to_string() };

        let h_bytes = S::serialize_headers(&headers).unwrap();
        let b_bytes = S::serialize_body(&body).unwrap();
        assert_eq!(S::deserialize_headers(h_bytes).unwrap(), headers);
        assert_eq!(S::deserialize_body(b_bytes).unwrap(), body);
    }

    #[test]
    fn json_scheme_rejects_malformed_body() {
        type S = JsonScheme<BTreeMap<String, String>, Body>;
        let err = S::deserialize_body(Bytes::from_static(b"not json")).unwrap_err();
        assert!(err.to_string().len() > 0);
    }
}
