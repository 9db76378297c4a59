//! Compact string form for signal payloads stored in the document store.
//!
//! JSON, gzip, then base64. Decompression is bounded to guard against
//! compression bombs.

use crate::error::CodecError;
use base64::{engine::general_purpose, Engine as _};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{Read, Write};

pub const DEFAULT_MAX_DECOMPRESSED: u64 = 256 * 1024;

pub fn encode_payload<T: Serialize>(value: &T) -> Result<String, CodecError> {
    let json = serde_json::to_vec(value)?;

    let mut gz = GzEncoder::new(Vec::new(), Compression::fast());
    gz.write_all(&json)?;
    let compressed = gz.finish()?;

    Ok(general_purpose::STANDARD.encode(compressed))
}

pub fn decode_payload<T: DeserializeOwned>(encoded: &str, limit: u64) -> Result<T, CodecError> {
    let compressed = general_purpose::STANDARD.decode(encoded.trim())?;

    // one byte past the limit tells truncation apart from an exact fit
    let mut json = Vec::new();
    GzDecoder::new(&compressed[..])
        .take(limit.saturating_add(1))
        .read_to_end(&mut json)?;
    if json.len() as u64 > limit {
        return Err(CodecError::TooLarge(limit));
    }

    Ok(serde_json::from_slice(&json)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::types::{IceCandidate, SessionDescription};

    #[test]
    fn session_description_survives_encoding() {
        let desc = SessionDescription::offer("v=0\r\no=- 1 2 IN IP4 127.0.0.1\r\n".repeat(20));
        let encoded = encode_payload(&desc).unwrap();
        assert!(encoded.len() < desc.sdp.len());

        let decoded: SessionDescription =
            decode_payload(&encoded, DEFAULT_MAX_DECOMPRESSED).unwrap();
        assert_eq!(decoded, desc);
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let desc = SessionDescription::answer("a".repeat(4096));
        let encoded = encode_payload(&desc).unwrap();
        let err = decode_payload::<SessionDescription>(&encoded, 1024).unwrap_err();
        assert!(matches!(err, CodecError::TooLarge(1024)));
    }

    #[test]
    fn unbounded_limit_still_decodes() {
        let desc = SessionDescription::offer("v=0");
        let encoded = encode_payload(&desc).unwrap();
        let decoded: SessionDescription = decode_payload(&encoded, u64::MAX).unwrap();
        assert_eq!(decoded, desc);
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(
            decode_payload::<IceCandidate>("not base64 at all!", DEFAULT_MAX_DECOMPRESSED),
            Err(CodecError::Base64(_))
        ));

        let not_gzip = general_purpose::STANDARD.encode(b"plain bytes");
        assert!(matches!(
            decode_payload::<IceCandidate>(&not_gzip, DEFAULT_MAX_DECOMPRESSED),
            Err(CodecError::Io(_))
        ));
    }
}
