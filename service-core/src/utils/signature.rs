use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Hex-encoded HMAC-SHA256 of `payload` under `secret`.
pub fn hmac_sha256_hex(secret: &str, payload: &str) -> Result<String, anyhow::Error> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| anyhow::anyhow!("Invalid key length: {}", e))?;
    mac.update(payload.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time string equality. Length differences return early.
pub fn constant_time_eq(expected: &str, provided: &str) -> bool {
    let expected = expected.as_bytes();
    let provided = provided.as_bytes();

    if expected.len() != provided.len() {
        return false;
    }

    expected.ct_eq(provided).into()
}

/// Generate a request signature.
///
/// Format: HMAC-SHA256(method|path|timestamp|nonce|body_hash, secret)
pub fn generate_signature(
    secret: &str,
    method: &str,
    path: &str,
    timestamp: i64,
    nonce: &str,
    body: &str,
) -> Result<String, anyhow::Error> {
    let body_hash = hex::encode(Sha256::digest(body.as_bytes()));
    let payload = format!("{}|{}|{}|{}|{}", method, path, timestamp, nonce, body_hash);
    hmac_sha256_hex(secret, &payload)
}

/// Verify a request signature using constant-time comparison.
pub fn verify_signature(
    secret: &str,
    method: &str,
    path: &str,
    timestamp: i64,
    nonce: &str,
    body: &str,
    signature: &str,
) -> Result<bool, anyhow::Error> {
    let expected_signature = generate_signature(secret, method, path, timestamp, nonce, body)?;
    Ok(constant_time_eq(&expected_signature, signature))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "bff_signing_secret";
    const PATH: &str = "/premium/checkout";
    const BODY: &str = r#"{"plan":"monthly","provider":"paypal"}"#;

    #[test]
    fn signature_round_trip() {
        let signature = generate_signature(SECRET, "POST", PATH, 1678886400, "n-1", BODY).unwrap();
        assert_eq!(signature.len(), 64);
        assert!(verify_signature(SECRET, "POST", PATH, 1678886400, "n-1", BODY, &signature).unwrap());
    }

    #[test]
    fn tampered_body_is_rejected() {
        let signature = generate_signature(SECRET, "POST", PATH, 1678886400, "n-1", BODY).unwrap();
        let tampered = r#"{"plan":"annual","provider":"paypal"}"#;
        assert!(!verify_signature(SECRET, "POST", PATH, 1678886400, "n-1", tampered, &signature).unwrap());
    }

    #[test]
    fn different_nonce_is_rejected() {
        let signature = generate_signature(SECRET, "POST", PATH, 1678886400, "n-1", BODY).unwrap();
        assert!(!verify_signature(SECRET, "POST", PATH, 1678886400, "n-2", BODY, &signature).unwrap());
    }

    #[test]
    fn constant_time_eq_handles_length_mismatch() {
        assert!(constant_time_eq("abc", "abc"));
        assert!(!constant_time_eq("abc", "abcd"));
        assert!(!constant_time_eq("abc", "abd"));
    }
}
