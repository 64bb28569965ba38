use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

pub const TIMESTAMP_HEADER: &str = "x-slack-request-timestamp";
pub const SIGNATURE_HEADER: &str = "x-slack-signature";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("missing `{0}` header")]
    MissingHeader(&'static str),
    #[error("request timestamp `{0}` is not a unix time")]
    InvalidTimestamp(String),
    #[error("request timestamp is outside the accepted window")]
    Stale,
    #[error("signature does not match request body")]
    Mismatch,
}

/// Verifies Slack's `v0` request signatures: an HMAC-SHA256 over
/// `v0:{timestamp}:{body}` keyed with the app's signing secret.
#[derive(Clone, Debug)]
pub struct SignatureVerifier {
    secret: SecretString,
    max_skew: Duration,
}

impl SignatureVerifier {
    pub fn new(secret: SecretString) -> Self {
        Self { secret, max_skew: Duration::minutes(5) }
    }

    pub fn with_max_skew(mut self, max_skew: Duration) -> Self {
        self.max_skew = max_skew;
        self
    }

    pub fn verify(
        &self,
        timestamp: Option<&str>,
        signature: Option<&str>,
        body: &[u8],
        now: DateTime<Utc>,
    ) -> Result<(), SignatureError> {
        let timestamp = timestamp.ok_or(SignatureError::MissingHeader(TIMESTAMP_HEADER))?.trim();
        let signature = signature.ok_or(SignatureError::MissingHeader(SIGNATURE_HEADER))?.trim();

        let seconds: i64 = timestamp
            .parse()
            .map_err(|_| SignatureError::InvalidTimestamp(timestamp.to_string()))?;
        let sent_at = DateTime::from_timestamp(seconds, 0)
            .ok_or_else(|| SignatureError::InvalidTimestamp(timestamp.to_string()))?;
        let skew = if now > sent_at { now - sent_at } else { sent_at - now };
        if skew > self.max_skew {
            return Err(SignatureError::Stale);
        }

        let provided = signature
            .strip_prefix("v0=")
            .and_then(decode_hex)
            .ok_or(SignatureError::Mismatch)?;

        self.mac(timestamp, body)?.verify_slice(&provided).map_err(|_| SignatureError::Mismatch)
    }

    /// Produces the `X-Slack-Signature` value for a body.
    pub fn sign(&self, timestamp: &str, body: &[u8]) -> Result<String, SignatureError> {
        let digest = self.mac(timestamp, body)?.finalize().into_bytes();
        Ok(format!("v0={}", encode_hex(digest.as_slice())))
    }

    fn mac(&self, timestamp: &str, body: &[u8]) -> Result<HmacSha256, SignatureError> {
        let mut mac = HmacSha256::new_from_slice(self.secret.expose_secret().as_bytes())
            .map_err(|_| SignatureError::Mismatch)?;
        mac.update(b"v0:");
        mac.update(timestamp.as_bytes());
        mac.update(b":");
        mac.update(body);
        Ok(mac)
    }
}

fn encode_hex(bytes: &[u8]) -> String {
    let mut output = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}

fn decode_hex(value: &str) -> Option<Vec<u8>> {
    if value.len() % 2 != 0 {
        return None;
    }
    (0..value.len())
        .step_by(2)
        .map(|index| value.get(index..index + 2).and_then(|pair| u8::from_str_radix(pair, 16).ok()))
        .collect()
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};
    use secrecy::SecretString;

    use super::{SignatureError, SignatureVerifier};

    const BODY: &[u8] = br#"{"type":"event_callback"}"#;

    fn verifier() -> SignatureVerifier {
        SignatureVerifier::new(SecretString::from("8f742231b10e8888abcd99yyyzzz85a5".to_string()))
    }

    #[test]
    fn accepts_a_signature_it_produced() {
        let now = Utc.timestamp_opt(1_714_554_000, 0).single().expect("timestamp");
        let signature = verifier().sign("1714554000", BODY).expect("sign");

        assert!(signature.starts_with("v0="));
        assert_eq!(verifier().verify(Some("1714554000"), Some(&signature), BODY, now), Ok(()));
    }

    #[test]
    fn rejects_tampered_body_and_stale_requests() {
        let now = Utc.timestamp_opt(1_714_554_000, 0).single().expect("timestamp");
        let signature = verifier().sign("1714554000", BODY).expect("sign");

        assert_eq!(
            verifier().verify(Some("1714554000"), Some(&signature), b"{}", now),
            Err(SignatureError::Mismatch)
        );
        assert_eq!(
            verifier().verify(Some("1714554000"), Some(&signature), BODY, now + Duration::minutes(6)),
            Err(SignatureError::Stale)
        );
        assert_eq!(
            verifier().verify(None, Some(&signature), BODY, now),
            Err(SignatureError::MissingHeader("x-slack-request-timestamp"))
        );
    }
}
