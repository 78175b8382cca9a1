use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

pub const TIMESTAMP_HEADER: &str = "telnyx-timestamp";
pub const SIGNATURE_HEADER: &str = "telnyx-signature";

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("missing webhook header `{0}`")]
    MissingHeader(&'static str),
    #[error("webhook timestamp `{0}` is not unix seconds")]
    InvalidTimestamp(String),
    #[error("webhook timestamp is outside the allowed skew")]
    Expired,
    #[error("webhook signature mismatch")]
    Mismatch,
}

/// HMAC-SHA256 over `"<timestamp>.<raw body>"`, hex encoded.
#[derive(Clone, Debug)]
pub struct WebhookVerifier {
    secret: SecretString,
    max_skew_secs: i64,
}

impl WebhookVerifier {
    pub fn new(secret: SecretString, max_skew_secs: u64) -> Self {
        Self { secret, max_skew_secs: i64::try_from(max_skew_secs).unwrap_or(i64::MAX) }
    }

    fn mac(&self, timestamp: &str, body: &[u8]) -> HmacSha256 {
        // HMAC accepts keys of any length.
        let mut mac = HmacSha256::new_from_slice(self.secret.expose_secret().as_bytes())
            .unwrap_or_else(|_| unreachable!("hmac accepts any key length"));
        mac.update(timestamp.as_bytes());
        mac.update(b".");
        mac.update(body);
        mac
    }

    pub fn sign(&self, timestamp: &str, body: &[u8]) -> String {
        hex::encode(self.mac(timestamp, body).finalize().into_bytes())
    }

    pub fn verify(
        &self,
        timestamp: Option<&str>,
        signature: Option<&str>,
        body: &[u8],
        now: DateTime<Utc>,
    ) -> Result<(), SignatureError> {
        let timestamp = timestamp
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or(SignatureError::MissingHeader(TIMESTAMP_HEADER))?;
        let signature = signature
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or(SignatureError::MissingHeader(SIGNATURE_HEADER))?;

        let sent_at: i64 = timestamp
            .parse()
            .map_err(|_| SignatureError::InvalidTimestamp(timestamp.to_string()))?;
        if (now.timestamp() - sent_at).abs() > self.max_skew_secs {
            return Err(SignatureError::Expired);
        }

        let provided = signature.strip_prefix("sha256=").unwrap_or(signature);
        let provided = hex::decode(provided).map_err(|_| SignatureError::Mismatch)?;
        self.mac(timestamp, body).verify_slice(&provided).map_err(|_| SignatureError::Mismatch)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::{SignatureError, WebhookVerifier};

    fn verifier() -> WebhookVerifier {
        WebhookVerifier::new("whsec-test".to_string().into(), 300)
    }

    #[test]
    fn signed_body_verifies_with_and_without_prefix() {
        let verifier = verifier();
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let body = br#"{"data":{"id":"evt-1"}}"#;
        let signature = verifier.sign("1700000000", body);

        assert_eq!(verifier.verify(Some("1700000000"), Some(&signature), body, now), Ok(()));
        let prefixed = format!("sha256={signature}");
        assert_eq!(verifier.verify(Some("1700000000"), Some(&prefixed), body, now), Ok(()));
    }

    #[test]
    fn tampered_body_is_rejected() {
        let verifier = verifier();
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let signature = verifier.sign("1700000000", b"original");
        assert_eq!(
            verifier.verify(Some("1700000000"), Some(&signature), b"tampered", now),
            Err(SignatureError::Mismatch)
        );
        assert_eq!(
            verifier.verify(Some("1700000000"), Some("zz-not-hex"), b"original", now),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn stale_or_missing_headers_are_rejected() {
        let verifier = verifier();
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let signature = verifier.sign("1699999000", b"body");
        assert_eq!(
            verifier.verify(Some("1699999000"), Some(&signature), b"body", now),
            Err(SignatureError::Expired)
        );
        assert!(matches!(
            verifier.verify(None, Some(&signature), b"body", now),
            Err(SignatureError::MissingHeader(_))
        ));
        assert!(matches!(
            verifier.verify(Some("yesterday"), Some(&signature), b"body", now),
            Err(SignatureError::InvalidTimestamp(_))
        ));
    }
}
