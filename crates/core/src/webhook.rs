//! Inbound webhook authentication.
//!
//! Two signing schemes are supported:
//! - raw payload: `v1=` + hex(HMAC-SHA256(secret, payload)), as sent by
//!   PagerDuty. The header may list several comma separated signatures while
//!   a secret is being rotated; any one matching is enough.
//! - timestamp prefixed: `v0=` + hex(HMAC-SHA256(secret, "v0:{ts}:{payload}")),
//!   as sent by Slack, with a replay window checked before any HMAC work.
//!
//! Verification never fails loudly for expected mismatches. Callers get a
//! `bool` (or the reason, for audit logging) and answer with a uniform
//! unauthorized response.

use std::sync::Arc;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::warn;

use crate::clock::{Clock, SystemClock};
use crate::error::WebhookVerificationError;
use crate::types::Provider;

pub const PAGERDUTY_SIGNATURE_HEADER: &str = "x-pagerduty-signature";
pub const SLACK_SIGNATURE_HEADER: &str = "x-slack-signature";
pub const SLACK_TIMESTAMP_HEADER: &str = "x-slack-request-timestamp";
pub const DEFAULT_TOLERANCE_SECS: i64 = 300;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureScheme {
    RawPayload,
    TimestampPrefixed,
}

impl SignatureScheme {
    pub fn for_provider(provider: Provider) -> Option<Self> {
        match provider {
            Provider::PagerDuty => Some(SignatureScheme::RawPayload),
            Provider::Slack => Some(SignatureScheme::TimestampPrefixed),
            Provider::Claude | Provider::OpenAi => None,
        }
    }

    pub fn version(&self) -> &'static str {
        match self {
            SignatureScheme::RawPayload => "v1",
            SignatureScheme::TimestampPrefixed => "v0",
        }
    }

    pub fn requires_timestamp(&self) -> bool {
        matches!(self, SignatureScheme::TimestampPrefixed)
    }
}

/// One inbound request's authentication inputs. `raw_payload` must be the
/// exact body received.
#[derive(Debug, Clone, Copy)]
pub struct WebhookEnvelope<'a> {
    pub raw_payload: &'a str,
    pub provided_signature: Option<&'a str>,
    pub provided_timestamp: Option<&'a str>,
    pub secret: Option<&'a str>,
}

fn mac(secret: &str, scheme: SignatureScheme, timestamp: Option<i64>, payload: &str) -> HmacSha256 {
    // HMAC-SHA256 accepts any key length, so this cannot fail
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC-SHA256 accepts any key length");
    if let (SignatureScheme::TimestampPrefixed, Some(ts)) = (scheme, timestamp) {
        mac.update(format!("{}:{}:", scheme.version(), ts).as_bytes());
    }
    mac.update(payload.as_bytes());
    mac
}

/// Produces the header value a provider would send for `payload`.
pub fn sign(scheme: SignatureScheme, secret: &str, timestamp: Option<i64>, payload: &str) -> String {
    let digest = mac(secret, scheme, timestamp, payload).finalize().into_bytes();
    format!("{}={}", scheme.version(), hex::encode(digest))
}

/// Checks `envelope` against `scheme` at unix time `now`. Pure: the same
/// inputs always give the same answer.
pub fn check_at(
    envelope: &WebhookEnvelope<'_>,
    scheme: SignatureScheme,
    tolerance_secs: i64,
    now: i64,
) -> Result<(), WebhookVerificationError> {
    let payload = non_empty(Some(envelope.raw_payload), "payload")?;
    let signature = non_empty(envelope.provided_signature, "signature")?;
    let secret = non_empty(envelope.secret, "secret")?;

    let timestamp = if scheme.requires_timestamp() {
        let raw = non_empty(envelope.provided_timestamp, "timestamp")?;
        let ts: i64 = raw
            .trim()
            .parse()
            .map_err(|_| WebhookVerificationError::Malformed("timestamp"))?;
        if now.abs_diff(ts) > tolerance_secs.max(0) as u64 {
            return Err(WebhookVerificationError::StaleTimestamp { tolerance_secs });
        }
        Some(ts)
    } else {
        None
    };

    let candidates = parse_signatures(signature, scheme)?;
    let expected = mac(secret, scheme, timestamp, payload).finalize().into_bytes();

    let mut matched = subtle::Choice::from(0u8);
    for candidate in &candidates {
        matched |= expected.as_slice().ct_eq(candidate.as_slice());
    }
    if bool::from(matched) {
        Ok(())
    } else {
        Err(WebhookVerificationError::SignatureMismatch)
    }
}

fn non_empty<'a>(
    value: Option<&'a str>,
    field: &'static str,
) -> Result<&'a str, WebhookVerificationError> {
    match value {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(WebhookVerificationError::MissingInput(field)),
    }
}

fn parse_signatures(
    header: &str,
    scheme: SignatureScheme,
) -> Result<Vec<Vec<u8>>, WebhookVerificationError> {
    let prefix = format!("{}=", scheme.version());
    let mut decoded = Vec::new();
    for part in header.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let Some(hex_part) = part.strip_prefix(&prefix) else {
            continue;
        };
        if hex_part.is_empty() {
            return Err(WebhookVerificationError::Malformed("signature"));
        }
        let bytes =
            hex::decode(hex_part).map_err(|_| WebhookVerificationError::Malformed("signature"))?;
        decoded.push(bytes);
    }
    if decoded.is_empty() {
        return Err(WebhookVerificationError::Malformed("signature"));
    }
    Ok(decoded)
}

#[derive(Clone)]
pub struct WebhookVerifier {
    tolerance_secs: i64,
    clock: Arc<dyn Clock>,
}

impl Default for WebhookVerifier {
    fn default() -> Self {
        Self::new(DEFAULT_TOLERANCE_SECS)
    }
}

impl WebhookVerifier {
    pub fn new(tolerance_secs: i64) -> Self {
        Self::with_clock(tolerance_secs, Arc::new(SystemClock))
    }

    pub fn with_clock(tolerance_secs: i64, clock: Arc<dyn Clock>) -> Self {
        Self {
            tolerance_secs,
            clock,
        }
    }

    pub fn tolerance_secs(&self) -> i64 {
        self.tolerance_secs
    }

    /// Like [`verify`](Self::verify) but keeps the rejection reason for
    /// audit logging. The reason must not be echoed to the sender.
    pub fn check(
        &self,
        scheme: SignatureScheme,
        envelope: &WebhookEnvelope<'_>,
    ) -> Result<(), WebhookVerificationError> {
        let now = self.clock.now().timestamp();
        let result = check_at(envelope, scheme, self.tolerance_secs, now);
        if let Err(err) = &result {
            match err {
                WebhookVerificationError::MissingInput(field) => {
                    warn!(reason = err.reason(), field = *field, "webhook rejected");
                }
                _ => warn!(reason = err.reason(), scheme = scheme.version(), "webhook rejected"),
            }
        }
        result
    }

    pub fn verify(&self, scheme: SignatureScheme, envelope: &WebhookEnvelope<'_>) -> bool {
        self.check(scheme, envelope).is_ok()
    }
}
