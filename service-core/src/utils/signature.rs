use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Hex HMAC-SHA256 of a raw request body.
pub fn sign_payload(secret: &str, body: &[u8]) -> Result<String, anyhow::Error> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| anyhow::anyhow!("Invalid key length: {}", e))?;
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Verify a hex HMAC-SHA256 body signature using constant-time comparison.
///
/// An optional `sha256=` prefix on the signature is accepted.
pub fn verify_payload_signature(
    secret: &str,
    body: &[u8],
    signature: &str,
) -> Result<bool, anyhow::Error> {
    let expected_signature = sign_payload(secret, body)?;
    let provided = signature.trim();
    let provided = provided.strip_prefix("sha256=").unwrap_or(provided);

    let expected_bytes = expected_signature.as_bytes();
    let signature_bytes = provided.as_bytes();

    if expected_bytes.len() != signature_bytes.len() {
        return Ok(false);
    }

    Ok(expected_bytes.ct_eq(signature_bytes).into())
}

/// Hex SHA-256 digest, used to key payloads that carry no identifier of their own.
pub fn payload_digest(body: &[u8]) -> String {
    hex::encode(Sha256::digest(body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_generation_and_verification() {
        let secret = "whsec_test";
        let body = br#"{"id":"evt_1"}"#;

        let signature = sign_payload(secret, body).unwrap();
        assert_eq!(signature.len(), 64);

        assert!(verify_payload_signature(secret, body, &signature).unwrap());
        assert!(verify_payload_signature(secret, body, &format!("sha256={}", signature)).unwrap());
    }

    #[test]
    fn test_invalid_signature() {
        let secret = "whsec_test";
        let body = br#"{"id":"evt_1"}"#;

        let signature = sign_payload(secret, body).unwrap();
        let flipped = if signature.starts_with('a') { "b" } else { "a" };
        let invalid_signature = format!("{}{}", flipped, &signature[1..]);

        assert!(!verify_payload_signature(secret, body, &invalid_signature).unwrap());
        assert!(!verify_payload_signature(secret, body, "short").unwrap());
    }

    #[test]
    fn test_tampered_body() {
        let secret = "whsec_test";
        let signature = sign_payload(secret, br#"{"amount":"10.00"}"#).unwrap();

        let is_valid =
            verify_payload_signature(secret, br#"{"amount":"1000.00"}"#, &signature).unwrap();
        assert!(!is_valid);
    }

    #[test]
    fn test_digest_is_stable() {
        assert_eq!(payload_digest(b"abc"), payload_digest(b"abc"));
        assert_ne!(payload_digest(b"abc"), payload_digest(b"abd"));
    }
}
