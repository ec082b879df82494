// Crypto primitives: AEAD with per-context derived keys, HMAC, password
// hashing, random tokens.
//
// Key derivation is HMAC-SHA256(master, context) where the context is
// typically a delivery id, so compromising one context's key exposes
// nothing about any other context.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use argon2::password_hash::rand_core::OsRng as SaltRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("invalid_format")]
    InvalidFormat,
    #[error("auth_failed")]
    AuthFailed,
    #[error("crypto internal error: {0}")]
    Internal(String),
}

pub struct CryptoService {
    master_key: Vec<u8>,
}

impl CryptoService {
    pub fn new(master_key: &str) -> Self {
        Self {
            master_key: master_key.as_bytes().to_vec(),
        }
    }

    fn context_key(&self, context: &str) -> [u8; 32] {
        hmac_sha256(&self.master_key, context.as_bytes())
    }

    /// AEAD-encrypt `plaintext` under the key derived for `context`.
    /// Wire form: `base64(nonce) ":" base64(tag) ":" base64(body)`.
    pub fn encrypt(&self, plaintext: &[u8], context: &str) -> Result<String, CryptoError> {
        let key = self.context_key(context);
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| CryptoError::Internal(e.to_string()))?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        // aes-gcm appends the 16-byte tag to the ciphertext body.
        let sealed = cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| CryptoError::Internal("encryption failed".into()))?;
        let split_at = sealed.len() - TAG_LEN;
        let (body, tag) = sealed.split_at(split_at);

        Ok(format!(
            "{}:{}:{}",
            BASE64.encode(nonce_bytes),
            BASE64.encode(tag),
            BASE64.encode(body)
        ))
    }

    /// Reverses `encrypt`. `invalid_format` for anything that is not three
    /// base64 segments of plausible lengths; `auth_failed` on tag mismatch,
    /// which includes decrypting under the wrong context.
    pub fn decrypt(&self, wire: &str, context: &str) -> Result<Vec<u8>, CryptoError> {
        let segments: Vec<&str> = wire.split(':').collect();
        if segments.len() != 3 {
            return Err(CryptoError::InvalidFormat);
        }
        let nonce_bytes = BASE64
            .decode(segments[0])
            .map_err(|_| CryptoError::InvalidFormat)?;
        let tag = BASE64
            .decode(segments[1])
            .map_err(|_| CryptoError::InvalidFormat)?;
        let body = BASE64
            .decode(segments[2])
            .map_err(|_| CryptoError::InvalidFormat)?;
        if nonce_bytes.len() != NONCE_LEN || tag.len() != TAG_LEN {
            return Err(CryptoError::InvalidFormat);
        }

        let key = self.context_key(context);
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| CryptoError::Internal(e.to_string()))?;

        let mut sealed = body;
        sealed.extend_from_slice(&tag);
        cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), sealed.as_ref())
            .map_err(|_| CryptoError::AuthFailed)
    }
}

pub fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// `n` bytes of OS entropy, hex-encoded.
pub fn random_token(n: usize) -> String {
    hex::encode(random_bytes(n))
}

pub fn random_bytes(n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    OsRng.fill_bytes(&mut buf);
    buf
}

/// Timing-safe equality. Length mismatch short-circuits, which leaks only
/// the length — the contents are always compared in constant time.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// Argon2id with the crate's hardened defaults (19 MiB, t=2, p=1).
pub fn hash_password(password: &str) -> Result<String, CryptoError> {
    let salt = SaltString::generate(&mut SaltRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| CryptoError::Internal(e.to_string()))
}

pub fn verify_password(password: &str, stored: &str) -> bool {
    match PasswordHash::new(stored) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> CryptoService {
        CryptoService::new("unit-test-master-key-0123456789abcdef")
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let c = service();
        let wire = c.encrypt(b"recipient phone +254700000001", "delivery-1").unwrap();
        let plain = c.decrypt(&wire, "delivery-1").unwrap();
        assert_eq!(plain, b"recipient phone +254700000001");
    }

    #[test]
    fn test_wire_form_is_three_base64_segments() {
        let c = service();
        let wire = c.encrypt(b"x", "ctx").unwrap();
        let parts: Vec<&str> = wire.split(':').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(BASE64.decode(parts[0]).unwrap().len(), NONCE_LEN);
        assert_eq!(BASE64.decode(parts[1]).unwrap().len(), TAG_LEN);
    }

    #[test]
    fn test_wrong_context_fails_auth() {
        let c = service();
        let wire = c.encrypt(b"payload", "delivery-1").unwrap();
        let err = c.decrypt(&wire, "delivery-2").unwrap_err();
        assert!(matches!(err, CryptoError::AuthFailed));
    }

    #[test]
    fn test_tampered_body_fails_auth() {
        let c = service();
        let wire = c.encrypt(b"payload-payload-payload", "ctx").unwrap();
        let mut parts: Vec<String> = wire.split(':').map(String::from).collect();
        let mut body = BASE64.decode(&parts[2]).unwrap();
        body[0] ^= 0x01;
        parts[2] = BASE64.encode(body);
        let err = c.decrypt(&parts.join(":"), "ctx").unwrap_err();
        assert!(matches!(err, CryptoError::AuthFailed));
    }

    #[test]
    fn test_malformed_wire_is_invalid_format() {
        let c = service();
        for wire in ["", "abc", "a:b", "not base64!:QUJD:QUJD", "a:b:c:d"] {
            let err = c.decrypt(wire, "ctx").unwrap_err();
            assert!(
                matches!(err, CryptoError::InvalidFormat),
                "expected invalid_format for {wire:?}"
            );
        }
    }

    #[test]
    fn test_distinct_contexts_derive_distinct_keys() {
        let c = service();
        assert_ne!(c.context_key("delivery-1"), c.context_key("delivery-2"));
    }

    #[test]
    fn test_random_token_length_and_hex() {
        let t = random_token(16);
        assert_eq!(t.len(), 32);
        assert!(t.chars().all(|ch| ch.is_ascii_hexdigit()));
        assert_ne!(random_token(16), random_token(16));
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
    }

    #[test]
    fn test_password_hash_roundtrip() {
        let hash = hash_password("correct horse battery").unwrap();
        assert!(verify_password("correct horse battery", &hash));
        assert!(!verify_password("wrong", &hash));
        assert!(!verify_password("correct horse battery", "garbage"));
    }
}
