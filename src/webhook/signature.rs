//! Webhook signature validation (§6, §4.H). Grounded on
//! `app/core/webhook_validator.py`'s `validate_webhook_signature`: base64
//! decode the `Signature` header, recompute HMAC-SHA-256 over the raw
//! body, compare in constant time.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Returns `true` only if `signature_header` is valid base64 decoding to an
/// HMAC-SHA-256 tag matching `body` under `shared_secret`. Any malformed
/// input (bad base64, wrong secret length) is a validation failure, not a
/// panic.
pub fn validate_signature(body: &[u8], signature_header: &str, shared_secret: &str) -> bool {
    let Ok(signature_bytes) = BASE64.decode(signature_header.trim()) else {
        return false;
    };

    let Ok(mut mac) = HmacSha256::new_from_slice(shared_secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    let expected = mac.finalize().into_bytes();

    if expected.len() != signature_bytes.len() {
        return false;
    }
    expected.as_slice().ct_eq(&signature_bytes).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(body: &[u8], secret: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        BASE64.encode(mac.finalize().into_bytes())
    }

    #[test]
    fn accepts_valid_signature() {
        let body = br#"{"id":"X","cause":"order.create"}"#;
        let sig = sign(body, "shared-secret");
        assert!(validate_signature(body, &sig, "shared-secret"));
    }

    #[test]
    fn rejects_wrong_secret() {
        let body = br#"{"id":"X","cause":"order.create"}"#;
        let sig = sign(body, "wrong-secret");
        assert!(!validate_signature(body, &sig, "shared-secret"));
    }

    #[test]
    fn rejects_malformed_base64() {
        let body = b"{}";
        assert!(!validate_signature(body, "not-valid-base64!!", "secret"));
    }

    #[test]
    fn rejects_tampered_body() {
        let body = br#"{"id":"X"}"#;
        let sig = sign(body, "shared-secret");
        let tampered = br#"{"id":"Y"}"#;
        assert!(!validate_signature(tampered, &sig, "shared-secret"));
    }
}
