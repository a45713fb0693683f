//! Obfuscation codec for wire payloads.
//!
//! Every parameter value and every JSON response body is ROT13-rotated and
//! then Base64-encoded. The rotation only touches ASCII letters, so decoding
//! is unambiguous: Base64 first, then rotate back.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

/// Rotate ASCII letters by 13 positions, leaving everything else alone.
pub fn rot13(input: &str) -> String {
    input
        .chars()
        .map(|c| match c {
            'a'..='z' => (b'a' + (c as u8 - b'a' + 13) % 26) as char,
            'A'..='Z' => (b'A' + (c as u8 - b'A' + 13) % 26) as char,
            _ => c,
        })
        .collect()
}

/// Encode a payload: ROT13 first, then standard Base64.
///
/// Empty input stays empty so absent parameters round-trip unchanged.
pub fn encode(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }
    BASE64.encode(rot13(text))
}

/// Decode a payload: Base64 first, then ROT13.
///
/// Whitespace is stripped before decoding. Input that is not valid Base64
/// (or not UTF-8 underneath) is returned as-is so plain-text callers keep
/// working.
pub fn decode(encoded: &str) -> String {
    if encoded.is_empty() {
        return String::new();
    }

    let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
    match BASE64.decode(compact.as_bytes()) {
        Ok(bytes) => match String::from_utf8(bytes) {
            Ok(text) => rot13(&text),
            Err(_) => encoded.to_string(),
        },
        Err(_) => encoded.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vector() {
        // "hello" -> rot13 "uryyb" -> base64
        assert_eq!(encode("hello"), "dXJ5eWI=");
        assert_eq!(decode("dXJ5eWI="), "hello");
    }

    #[test]
    fn round_trips_arbitrary_text() {
        for text in ["", "a", "Hello, World!", "{\"k\":\"v\"}", "åäö /+#"] {
            assert_eq!(decode(&encode(text)), text);
        }
    }

    #[test]
    fn empty_round_trips_to_empty() {
        assert_eq!(encode(""), "");
        assert_eq!(decode(""), "");
    }

    #[test]
    fn decode_tolerates_whitespace() {
        assert_eq!(decode("dXJ5\neWI=\n"), "hello");
        assert_eq!(decode("  dXJ5eWI=  "), "hello");
    }

    #[test]
    fn decode_falls_back_to_plain_text() {
        // Not Base64 at all: hand the value back untouched.
        assert_eq!(decode("not base64!!"), "not base64!!");
    }

    #[test]
    fn rot13_is_an_involution() {
        assert_eq!(rot13(&rot13("Mixed CASE with 123 digits")), "Mixed CASE with 123 digits");
    }
}
