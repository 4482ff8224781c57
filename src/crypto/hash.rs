//! Deterministic hashing for provenance idempotency keys
//!
//! Payloads are canonicalized with RFC 8785 (JCS) through
//! `serde_json_canonicalizer`, so the same logical payload hashes the same
//! regardless of key order or number formatting. Every preimage starts with
//! a domain prefix and length-prefixes its string fields.

use sha2::{Digest, Sha256};

/// 32-byte SHA-256 hash
pub type Hash256 = [u8; 32];

/// Domain prefix for provenance idempotency keys
pub const DOMAIN_PROVENANCE: &[u8] = b"TRACERX_PROVENANCE_V1";

/// Encode a string as `U32_BE(len) || UTF8_bytes`
pub fn encode_string(s: &str) -> Vec<u8> {
    let utf8_bytes = s.as_bytes();
    let mut result = Vec::with_capacity(4 + utf8_bytes.len());
    result.extend_from_slice(&(utf8_bytes.len() as u32).to_be_bytes());
    result.extend_from_slice(utf8_bytes);
    result
}

/// Canonical JSON text per RFC 8785.
pub fn canonicalize_json(value: &serde_json::Value) -> Result<String, serde_json::Error> {
    let bytes = serde_json_canonicalizer::to_vec(value)?;
    String::from_utf8(bytes).map_err(<serde_json::Error as serde::ser::Error>::custom)
}

pub fn sha256(data: &[u8]) -> Hash256 {
    Sha256::digest(data).into()
}

/// `hex(SHA256(DOMAIN || str(subject) || str(event_type) || JCS(payload)))`
pub fn idempotency_key(
    subject_key: &str,
    event_type: &str,
    payload: &serde_json::Value,
) -> Result<String, serde_json::Error> {
    let canonical = canonicalize_json(payload)?;

    let mut hasher = Sha256::new();
    hasher.update(DOMAIN_PROVENANCE);
    hasher.update(encode_string(subject_key));
    hasher.update(encode_string(event_type));
    hasher.update(canonical.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_encode_string() {
        assert_eq!(encode_string("ab"), vec![0, 0, 0, 2, b'a', b'b']);
    }

    #[test]
    fn test_canonical_key_order() {
        let a = json!({"b": 1, "a": {"d": true, "c": null}});
        let b = json!({"a": {"c": null, "d": true}, "b": 1});
        assert_eq!(canonicalize_json(&a).unwrap(), canonicalize_json(&b).unwrap());
        assert_eq!(
            canonicalize_json(&a).unwrap(),
            r#"{"a":{"c":null,"d":true},"b":1}"#
        );
    }

    #[test]
    fn test_key_ignores_payload_key_order() {
        let a = json!({"batchId": "B1", "tokenId": "T1"});
        let b = json!({"tokenId": "T1", "batchId": "B1"});
        assert_eq!(
            idempotency_key("batch/B1", "BatchUploaded", &a).unwrap(),
            idempotency_key("batch/B1", "BatchUploaded", &b).unwrap()
        );
    }

    #[test]
    fn test_length_prefix_prevents_ambiguity() {
        let payload = json!({});
        assert_ne!(
            idempotency_key("ab", "c", &payload).unwrap(),
            idempotency_key("a", "bc", &payload).unwrap()
        );
    }
}
