//! Token envelope (component A). Encrypts/decrypts per-user Marketplace API
//! tokens at rest. The rest of the service depends only on `Arc<dyn
//! TokenCipher>`, an external-collaborator trait-object seam used the same
//! way elsewhere for other pluggable backends.
//!
//! Grounded on the source's Fernet-based `EncryptionManager`
//! (`app/core/crypto.py`), reimplemented with AES-256-GCM since this crate's
//! stack has no Fernet equivalent; the envelope-cipher *contract* (encrypt
//! plaintext -> opaque bytes, decrypt opaque bytes -> plaintext, one key
//! read from configuration) is unchanged.

use aes_gcm::aead::{Aead, KeyInit, OsRng, rand_core::RngCore};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::error::SyncError;

pub trait TokenCipher: Send + Sync {
    fn encrypt(&self, plaintext: &str) -> Result<String, SyncError>;
    fn decrypt(&self, ciphertext: &str) -> Result<String, SyncError>;
}

/// AES-256-GCM envelope. Ciphertext is `base64(nonce || tag || bytes)`.
pub struct AesGcmCipher {
    cipher: Aes256Gcm,
}

impl AesGcmCipher {
    /// `key` must be 32 raw bytes, typically sourced from a base64-encoded
    /// `TOKEN_ENVELOPE_KEY` environment variable by the caller.
    pub fn new(key: &[u8; 32]) -> Self {
        let key = Key::<Aes256Gcm>::from_slice(key);
        Self {
            cipher: Aes256Gcm::new(key),
        }
    }

    pub fn from_env() -> Result<Self, SyncError> {
        let key_b64 = std::env::var("TOKEN_ENVELOPE_KEY").map_err(|_| SyncError::Configuration {
            setting: "TOKEN_ENVELOPE_KEY".into(),
            detail: "not set".into(),
        })?;
        let raw = BASE64
            .decode(key_b64.trim())
            .map_err(|e| SyncError::Configuration {
                setting: "TOKEN_ENVELOPE_KEY".into(),
                detail: format!("invalid base64: {e}"),
            })?;
        let key: [u8; 32] = raw.try_into().map_err(|_| SyncError::Configuration {
            setting: "TOKEN_ENVELOPE_KEY".into(),
            detail: "key must decode to exactly 32 bytes".into(),
        })?;
        Ok(Self::new(&key))
    }
}

impl TokenCipher for AesGcmCipher {
    fn encrypt(&self, plaintext: &str) -> Result<String, SyncError> {
        let mut nonce_bytes = [0u8; 12];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let mut out = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| SyncError::Configuration {
                setting: "token_envelope".into(),
                detail: format!("encrypt failed: {e}"),
            })?;

        let mut buf = nonce_bytes.to_vec();
        buf.append(&mut out);
        Ok(BASE64.encode(buf))
    }

    fn decrypt(&self, ciphertext: &str) -> Result<String, SyncError> {
        let raw = BASE64
            .decode(ciphertext)
            .map_err(|e| SyncError::Configuration {
                setting: "token_envelope".into(),
                detail: format!("invalid base64 ciphertext: {e}"),
            })?;
        if raw.len() < 12 {
            return Err(SyncError::Configuration {
                setting: "token_envelope".into(),
                detail: "ciphertext too short".into(),
            });
        }
        let (nonce_bytes, body) = raw.split_at(12);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext =
            self.cipher
                .decrypt(nonce, body)
                .map_err(|e| SyncError::Configuration {
                    setting: "token_envelope".into(),
                    detail: format!("decrypt failed: {e}"),
                })?;

        String::from_utf8(plaintext).map_err(|e| SyncError::Configuration {
            setting: "token_envelope".into(),
            detail: format!("decrypted token not valid utf-8: {e}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cipher() -> AesGcmCipher {
        AesGcmCipher::new(&[7u8; 32])
    }

    #[test]
    fn round_trips_plaintext() {
        let c = test_cipher();
        let enc = c.encrypt("super-secret-token").unwrap();
        assert_ne!(enc, "super-secret-token");
        let dec = c.decrypt(&enc).unwrap();
        assert_eq!(dec, "super-secret-token");
    }

    #[test]
    fn two_encryptions_of_same_plaintext_differ() {
        let c = test_cipher();
        let a = c.encrypt("token").unwrap();
        let b = c.encrypt("token").unwrap();
        assert_ne!(a, b, "nonces must be freshly random per call");
    }

    #[test]
    fn rejects_truncated_ciphertext() {
        let c = test_cipher();
        assert!(c.decrypt(&base64::engine::general_purpose::STANDARD.encode(b"x")).is_err());
    }

    #[test]
    fn rejects_tampered_ciphertext() {
        let c = test_cipher();
        let mut enc = c.encrypt("token").unwrap();
        enc.push('A');
        assert!(c.decrypt(&enc).is_err());
    }
}
