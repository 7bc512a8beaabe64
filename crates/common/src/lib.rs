//! sentinel_common
//!
//! Canonical JSON serialization + hashing + signature primitives.
//! This exists to guarantee determinism for:
//! - request/response HMAC signatures
//! - action intent digests
//! - audit chain hashing
//! - incident fingerprints and vt correlation tokens
//!
//! IMPORTANT: Do not "pretty print". Signatures and digests must be computed
//! over canonical bytes (keys sorted, no whitespace, UTF-8).

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum CanonError {
    #[error("failed to serialize json: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum SignError {
    #[error("canonical json error: {0}")]
    Canon(#[from] CanonError),
    #[error("bad signature")]
    BadSignature,
    #[error("bad key material: {0}")]
    BadKey(String),
    #[error("bad encoding: {0}")]
    BadEncoding(String),
}

/// Serialize to canonical JSON bytes:
/// - stable key ordering (we enforce sorting via Value roundtrip)
/// - no whitespace
/// - UTF-8
pub fn canonical_json_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, CanonError> {
    let v = serde_json::to_value(value)?;
    let sorted = sort_json_value(v);
    Ok(serde_json::to_vec(&sorted)?)
}

/// Canonical JSON as a String (what gets pushed onto queues and stored as
/// canonical records).
pub fn canonical_json_string<T: Serialize>(value: &T) -> Result<String, CanonError> {
    let bytes = canonical_json_bytes(value)?;
    // canonical bytes are valid UTF-8 by construction
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Bare lowercase hex SHA-256 of raw bytes.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Return "sha256:<hex>" of raw bytes. Used where the stored form carries the
/// algorithm tag (action digests).
pub fn sha256_tagged(bytes: &[u8]) -> String {
    format!("sha256:{}", sha256_hex(bytes))
}

/// "sha256:<hex>" of canonical JSON bytes.
pub fn sha256_canonical_json<T: Serialize>(value: &T) -> Result<String, CanonError> {
    let bytes = canonical_json_bytes(value)?;
    Ok(sha256_tagged(&bytes))
}

fn sort_json_value(v: serde_json::Value) -> serde_json::Value {
    use serde_json::Value;
    match v {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut out = serde_json::Map::new();
            for (k, v) in entries {
                out.insert(k, sort_json_value(v));
            }
            Value::Object(out)
        }
        Value::Array(arr) => Value::Array(arr.into_iter().map(sort_json_value).collect()),
        other => other,
    }
}

// ----------------------------
// HMAC-SHA256 (shared-secret signatures)
// ----------------------------

fn hmac_instance(secret: &str) -> Result<HmacSha256, SignError> {
    HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| SignError::BadKey(e.to_string()))
}

/// Hex HMAC-SHA256 over raw bytes.
pub fn hmac_sha256_hex(secret: &str, message: &[u8]) -> Result<String, SignError> {
    let mut mac = hmac_instance(secret)?;
    mac.update(message);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Hex HMAC-SHA256 over the canonical JSON form of `payload`.
pub fn sign_canonical<T: Serialize>(secret: &str, payload: &T) -> Result<String, SignError> {
    let bytes = canonical_json_bytes(payload)?;
    hmac_sha256_hex(secret, &bytes)
}

/// Constant-time verification of a hex HMAC signature over canonical JSON.
/// Fails with `BadSignature` when the computed and provided values differ.
pub fn verify_canonical<T: Serialize>(
    secret: &str,
    payload: &T,
    sig_hex: &str,
) -> Result<(), SignError> {
    let bytes = canonical_json_bytes(payload)?;
    let provided =
        hex::decode(sig_hex.trim()).map_err(|_| SignError::BadSignature)?;
    let mut mac = hmac_instance(secret)?;
    mac.update(&bytes);
    mac.verify_slice(&provided).map_err(|_| SignError::BadSignature)
}

// ----------------------------
// Ed25519 (agent identity signatures, base64 key material)
// ----------------------------

fn decode_key_32(b64: &str) -> Result<[u8; 32], SignError> {
    let raw = BASE64
        .decode(b64.trim())
        .map_err(|e| SignError::BadEncoding(format!("not base64: {e}")))?;
    raw.as_slice()
        .try_into()
        .map_err(|_| SignError::BadKey(format!("expected 32 bytes, got {}", raw.len())))
}

/// Base64 Ed25519 signature over the canonical JSON form of `payload`.
pub fn ed25519_sign<T: Serialize>(payload: &T, priv_b64: &str) -> Result<String, SignError> {
    let bytes = canonical_json_bytes(payload)?;
    let sk = SigningKey::from_bytes(&decode_key_32(priv_b64)?);
    let sig = sk.sign(&bytes);
    Ok(BASE64.encode(sig.to_bytes()))
}

/// Verify a base64 Ed25519 signature over canonical JSON.
pub fn ed25519_verify<T: Serialize>(
    payload: &T,
    pub_b64: &str,
    sig_b64: &str,
) -> Result<(), SignError> {
    let bytes = canonical_json_bytes(payload)?;
    let vk = VerifyingKey::from_bytes(&decode_key_32(pub_b64)?)
        .map_err(|e| SignError::BadKey(e.to_string()))?;
    let raw = BASE64
        .decode(sig_b64.trim())
        .map_err(|_| SignError::BadSignature)?;
    let sig_bytes: [u8; 64] = raw
        .as_slice()
        .try_into()
        .map_err(|_| SignError::BadSignature)?;
    let sig = Signature::from_bytes(&sig_bytes);
    vk.verify(&bytes, &sig).map_err(|_| SignError::BadSignature)
}

/// Stable agent id derived from the base64 public key string.
pub fn agent_id_from_pub(pub_b64: &str) -> String {
    let h = sha256_hex(pub_b64.as_bytes());
    format!("agent_{}", &h[..16])
}

// ----------------------------
// Variable timestamp (vt)
// ----------------------------

/// 16-hex-char per-request correlation token. Not time-based; it is a stable
/// keyed fingerprint of (agent, client timestamp, command).
pub fn variable_timestamp(agent_id: &str, timestamp: &str, command: &str, salt: &str) -> String {
    let raw = format!("{agent_id}|{timestamp}|{command}|{salt}");
    let h = sha256_hex(raw.as_bytes());
    h[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;

    #[derive(Serialize)]
    struct Obj {
        b: u32,
        a: u32,
    }

    #[test]
    fn canonical_hash_is_stable() {
        let x = Obj { b: 2, a: 1 };
        let y = Obj { a: 1, b: 2 };
        let hx = sha256_canonical_json(&x).unwrap();
        let hy = sha256_canonical_json(&y).unwrap();
        assert_eq!(hx, hy);
    }

    #[test]
    fn canonical_string_has_no_whitespace() {
        let s = canonical_json_string(&serde_json::json!({"b": 1, "a": [1, 2]})).unwrap();
        assert_eq!(s, r#"{"a":[1,2],"b":1}"#);
    }

    #[test]
    fn hmac_roundtrip_and_tamper() {
        let payload = serde_json::json!({"agent_id": "a1", "command": "ls"});
        let sig = sign_canonical("secret", &payload).unwrap();
        verify_canonical("secret", &payload, &sig).unwrap();

        let tampered = serde_json::json!({"agent_id": "a1", "command": "rm"});
        assert!(matches!(
            verify_canonical("secret", &tampered, &sig),
            Err(SignError::BadSignature)
        ));
        assert!(matches!(
            verify_canonical("other", &payload, &sig),
            Err(SignError::BadSignature)
        ));
    }

    #[test]
    fn hmac_rejects_non_hex() {
        let payload = serde_json::json!({"a": 1});
        assert!(matches!(
            verify_canonical("secret", &payload, "zz-not-hex"),
            Err(SignError::BadSignature)
        ));
    }

    #[test]
    fn ed25519_roundtrip() {
        let sk = SigningKey::from_bytes(&[7u8; 32]);
        let priv_b64 = BASE64.encode(sk.to_bytes());
        let pub_b64 = BASE64.encode(sk.verifying_key().to_bytes());

        let payload = serde_json::json!({"agent_id": "a1", "ts_unix": "123"});
        let sig = ed25519_sign(&payload, &priv_b64).unwrap();
        ed25519_verify(&payload, &pub_b64, &sig).unwrap();

        let other = serde_json::json!({"agent_id": "a2", "ts_unix": "123"});
        assert!(ed25519_verify(&other, &pub_b64, &sig).is_err());
    }

    #[test]
    fn agent_id_shape() {
        let id = agent_id_from_pub("c29tZS1wdWIta2V5");
        assert!(id.starts_with("agent_"));
        assert_eq!(id.len(), "agent_".len() + 16);
    }

    #[test]
    fn vt_is_16_hex_and_keyed() {
        let a = variable_timestamp("a1", "123", "ls", "salt");
        let b = variable_timestamp("a1", "123", "ls", "other-salt");
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }
}
