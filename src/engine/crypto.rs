// Cojoin Engine — Security Primitives
//
// Random tokens, signed cookie values, constant-time comparison and the
// AES-256-GCM payload packing used by the form relay.

use crate::atoms::error::{EngineError, EngineResult};
use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::Engine as _;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

// ═════════════════════════════════════════════════════════════════════════════
// Randomness
// ═════════════════════════════════════════════════════════════════════════════

pub fn random_bytes<const N: usize>() -> EngineResult<[u8; N]> {
    let mut buf = [0u8; N];
    getrandom::getrandom(&mut buf).map_err(|e| EngineError::Other(format!("OS RNG unavailable: {}", e)))?;
    Ok(buf)
}

/// `bytes` random bytes, hex encoded.
pub fn random_hex(bytes: usize) -> EngineResult<String> {
    let mut buf = vec![0u8; bytes];
    getrandom::getrandom(&mut buf).map_err(|e| EngineError::Other(format!("OS RNG unavailable: {}", e)))?;
    Ok(to_hex(&buf))
}

/// Fresh 128-bit nonce. Falls back to a v4 UUID if the OS RNG refuses.
pub fn fresh_nonce() -> String {
    random_hex(16).unwrap_or_else(|_| uuid::Uuid::new_v4().simple().to_string())
}

pub fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

// ═════════════════════════════════════════════════════════════════════════════
// Comparison / Signing
// ═════════════════════════════════════════════════════════════════════════════

/// Constant-time equality; length mismatch returns false without early exit on content.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    a.len() == b.len() && bool::from(a.as_bytes().ct_eq(b.as_bytes()))
}

fn mac_for(secret: &[u8], value: &str) -> EngineResult<String> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret)
        .map_err(|_| EngineError::Config("session secret unusable as HMAC key".into()))?;
    mac.update(value.as_bytes());
    let tag = mac.finalize().into_bytes();
    Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(tag))
}

/// `value.signature`, suitable for a cookie.
pub fn sign(secret: &[u8], value: &str) -> EngineResult<String> {
    Ok(format!("{}.{}", value, mac_for(secret, value)?))
}

/// Return the inner value when the signature checks out.
pub fn unsign(secret: &[u8], signed: &str) -> Option<String> {
    let (value, sig) = signed.rsplit_once('.')?;
    let expected = mac_for(secret, value).ok()?;
    constant_time_eq(&expected, sig).then(|| value.to_string())
}

// ═════════════════════════════════════════════════════════════════════════════
// Encrypt / Decrypt
// ═════════════════════════════════════════════════════════════════════════════

/// Decode a relay key given as 64 hex chars or base64 of 32 bytes.
pub fn parse_key(material: &str) -> EngineResult<[u8; 32]> {
    let material = material.trim();
    let bytes = if material.len() == 64 && material.chars().all(|c| c.is_ascii_hexdigit()) {
        (0..32)
            .map(|i| u8::from_str_radix(&material[i * 2..i * 2 + 2], 16))
            .collect::<Result<Vec<u8>, _>>()
            .map_err(|e| EngineError::Config(format!("relay key: {}", e)))?
    } else {
        base64::engine::general_purpose::STANDARD
            .decode(material)
            .map_err(|e| EngineError::Config(format!("relay key: {}", e)))?
    };
    bytes
        .try_into()
        .map_err(|_| EngineError::Config("relay key must be 32 bytes".into()))
}

/// AES-256-GCM. Returns base64(nonce || ciphertext+tag).
pub fn encrypt_payload(plaintext: &[u8], key: &[u8; 32]) -> EngineResult<String> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|_| EngineError::Other("AES key must be 32 bytes".into()))?;
    let nonce_bytes = random_bytes::<12>()?;
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| EngineError::Other(format!("AES-256-GCM encryption failed: {}", e)))?;

    // Pack: nonce (12) || ciphertext+tag
    let mut packed = Vec::with_capacity(12 + ciphertext.len());
    packed.extend_from_slice(&nonce_bytes);
    packed.extend_from_slice(&ciphertext);
    Ok(base64::engine::general_purpose::STANDARD.encode(&packed))
}

pub fn decrypt_payload(encoded: &str, key: &[u8; 32]) -> EngineResult<Vec<u8>> {
    let packed = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| EngineError::Other(format!("Base64 decode failed: {}", e)))?;
    if packed.len() < 12 + 16 {
        return Err(EngineError::Other("Ciphertext too short".into()));
    }
    let (nonce_bytes, ciphertext) = packed.split_at(12);
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|_| EngineError::Other("Invalid key length".into()))?;
    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| EngineError::Other("Decryption failed — wrong key or corrupted data".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nonces_are_hex_and_distinct() {
        let a = fresh_nonce();
        let b = fresh_nonce();
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn signed_values_reject_tampering() {
        let secret = b"test-secret";
        let signed = sign(secret, "abc123").unwrap();
        assert_eq!(unsign(secret, &signed).as_deref(), Some("abc123"));
        assert!(unsign(secret, &signed.replace("abc", "abd")).is_none());
        assert!(unsign(b"other", &signed).is_none());
        assert!(unsign(secret, "no-signature").is_none());
    }

    #[test]
    fn payload_encryption_packs_nonce_first() {
        let key = [0x42u8; 32];
        let enc = encrypt_payload(b"{\"name\":\"Ana\"}", &key).unwrap();
        assert_eq!(decrypt_payload(&enc, &key).unwrap(), b"{\"name\":\"Ana\"}");
        assert!(decrypt_payload(&enc, &[0u8; 32]).is_err());
    }

    #[test]
    fn key_material_accepts_hex_and_base64() {
        let hex = "42".repeat(32);
        assert_eq!(parse_key(&hex).unwrap(), [0x42u8; 32]);
        let b64 = base64::engine::general_purpose::STANDARD.encode([7u8; 32]);
        assert_eq!(parse_key(&b64).unwrap(), [7u8; 32]);
        assert!(parse_key("short").is_err());
    }

    #[test]
    fn constant_time_eq_basics() {
        assert!(constant_time_eq("tok", "tok"));
        assert!(!constant_time_eq("tok", "tak"));
        assert!(!constant_time_eq("tok", "token"));
    }
}
