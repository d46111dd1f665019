//! Webhook signing and verification.
//!
//! The signature is `HMAC_SHA256(secret, timestamp || body)` as lowercase
//! hex. Verification is constant-time and rejects timestamps more than
//! five minutes away from the local clock.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

pub const SIGNATURE_HEADER: &str = "X-FLOWCATALYST-SIGNATURE";
pub const TIMESTAMP_HEADER: &str = "X-FLOWCATALYST-TIMESTAMP";
pub const CORRELATION_HEADER: &str = "X-Correlation-ID";
pub const CAUSATION_HEADER: &str = "X-Causation-ID";

/// Accepted clock skew between signer and verifier.
pub const MAX_TIMESTAMP_SKEW_SECS: i64 = 300;

type HmacSha256 = Hmac<Sha256>;

/// Sign `timestamp || payload` and return lowercase hex.
pub fn sign(payload: &str, secret: &str, timestamp: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(timestamp.as_bytes());
    mac.update(payload.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Sign with a fresh ISO-8601 timestamp (millisecond precision).
pub fn sign_now(payload: &str, secret: &str) -> (String, String) {
    let timestamp = Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string();
    let signature = sign(payload, secret, &timestamp);
    (signature, timestamp)
}

/// Verify a received signature. The timestamp may be ISO-8601 or epoch
/// milliseconds; it must fall within [`MAX_TIMESTAMP_SKEW_SECS`] of now.
pub fn verify(payload: &str, secret: &str, timestamp: &str, signature: &str) -> bool {
    let Some(ts) = parse_timestamp(timestamp) else {
        return false;
    };

    let skew = (Utc::now() - ts).num_seconds().abs();
    if skew > MAX_TIMESTAMP_SKEW_SECS {
        return false;
    }

    let expected = sign(payload, secret, timestamp);

    let Ok(provided_bytes) = hex::decode(signature) else {
        return false;
    };
    let expected_bytes = hex::decode(&expected).expect("sign() emits valid hex");

    provided_bytes.ct_eq(&expected_bytes).into()
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(millis) = raw.parse::<i64>() {
        return DateTime::from_timestamp_millis(millis);
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_deterministic_lowercase_hex() {
        let payload = r#"{"test":true}"#;
        let signature = sign(payload, "my-secret", "1704067200000");

        assert_eq!(signature.len(), 64);
        assert!(signature.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));

        // Recompute independently over the concatenated input
        let mut mac = HmacSha256::new_from_slice(b"my-secret").unwrap();
        mac.update(format!("1704067200000{payload}").as_bytes());
        assert_eq!(signature, hex::encode(mac.finalize().into_bytes()));
    }

    #[test]
    fn round_trip_verifies() {
        let payload = r#"{"orderId":"o-17"}"#;
        let (signature, timestamp) = sign_now(payload, "hook-secret");
        assert!(verify(payload, "hook-secret", &timestamp, &signature));
    }

    #[test]
    fn tampered_payload_fails() {
        let (signature, timestamp) = sign_now("body-a", "hook-secret");
        assert!(!verify("body-b", "hook-secret", &timestamp, &signature));
    }

    #[test]
    fn wrong_secret_fails() {
        let (signature, timestamp) = sign_now("body", "secret-a");
        assert!(!verify("body", "secret-b", &timestamp, &signature));
    }

    #[test]
    fn stale_timestamp_fails_even_with_valid_signature() {
        let payload = "body";
        let old = (Utc::now() - chrono::Duration::minutes(6)).timestamp_millis().to_string();
        let signature = sign(payload, "hook-secret", &old);
        assert!(!verify(payload, "hook-secret", &old, &signature));
    }

    #[test]
    fn timestamp_within_window_passes() {
        let payload = "body";
        let recent = (Utc::now() - chrono::Duration::minutes(4)).timestamp_millis().to_string();
        let signature = sign(payload, "hook-secret", &recent);
        assert!(verify(payload, "hook-secret", &recent, &signature));
    }

    #[test]
    fn malformed_signature_fails_cleanly() {
        let (_, timestamp) = sign_now("body", "hook-secret");
        assert!(!verify("body", "hook-secret", &timestamp, "not-hex!"));
        assert!(!verify("body", "hook-secret", "not-a-timestamp", "00"));
    }
}
