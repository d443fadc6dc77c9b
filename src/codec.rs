//! Body transfer encoding: identity and base64 (spec.md §2 "Codec").
//!
//! The canonical JSON envelope (spec.md §6) carries `body` as either a raw
//! string or a base64-wrapped one, selected by `properties.body_encoding`.
//! This module is the only place that knows how to go back and forth.

use crate::config::BodyEncoding;

/// Encode a message body for inclusion in the wire envelope.
///
/// Returns the encoded text and the `content_encoding` value that should
/// accompany it (spec.md §3: "content_encoding ... set accordingly").
pub fn encode_body(body: &[u8], encoding: BodyEncoding, existing_content_encoding: Option<&str>) -> (String, Option<String>) {
    match encoding {
        BodyEncoding::Raw => (
            String::from_utf8_lossy(body).into_owned(),
            existing_content_encoding.map(str::to_owned),
        ),
        BodyEncoding::Base64 => (base64::encode(body), Some("base64".to_owned())),
    }
}

/// Decode a wire-envelope body back into raw bytes, given the
/// `content_encoding` recorded alongside it.
pub fn decode_body(text: &str, content_encoding: Option<&str>) -> Vec<u8> {
    match content_encoding {
        Some(enc) if enc.eq_ignore_ascii_case("base64") => {
            base64::decode(text).unwrap_or_else(|_| text.as_bytes().to_vec())
        }
        _ => text.as_bytes().to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base64_round_trips_arbitrary_bytes() {
        let body = vec![0u8, 1, 2, 250, 251, 252, 253, 254, 255];
        let (encoded, enc) = encode_body(&body, BodyEncoding::Base64, None);
        assert_eq!(enc.as_deref(), Some("base64"));
        assert_eq!(decode_body(&encoded, enc.as_deref()), body);
    }

    #[test]
    fn raw_round_trips_text() {
        let body = b"hello world".to_vec();
        let (encoded, enc) = encode_body(&body, BodyEncoding::Raw, None);
        assert_eq!(enc, None);
        assert_eq!(decode_body(&encoded, enc.as_deref()), body);
    }
}
