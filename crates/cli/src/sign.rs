use anyhow::Context;
use gateway_core::webhook::{
    check_at, sign, SignatureScheme, WebhookEnvelope, PAGERDUTY_SIGNATURE_HEADER,
    SLACK_SIGNATURE_HEADER, SLACK_TIMESTAMP_HEADER,
};
use gateway_core::{Provider, WebhookVerificationError};

/// clap value parser: only providers that sign their webhooks.
pub fn parse_provider(raw: &str) -> Result<Provider, String> {
    let provider: Provider = raw.parse()?;
    match SignatureScheme::for_provider(provider) {
        Some(_) => Ok(provider),
        None => Err(format!("{} does not sign webhooks", provider)),
    }
}

pub fn scheme_for(provider: Provider) -> anyhow::Result<SignatureScheme> {
    SignatureScheme::for_provider(provider)
        .with_context(|| format!("{} does not sign webhooks", provider))
}

/// Literal payload, or `@path` to read it from a file.
pub fn read_payload(raw: &str) -> anyhow::Result<String> {
    match raw.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path).with_context(|| format!("reading {}", path)),
        None => Ok(raw.to_string()),
    }
}

/// Headers the provider would attach to `payload`.
pub fn signature_headers(
    provider: Provider,
    secret: &str,
    payload: &str,
    timestamp: i64,
) -> anyhow::Result<Vec<(&'static str, String)>> {
    let scheme = scheme_for(provider)?;
    Ok(match scheme {
        SignatureScheme::RawPayload => vec![(
            PAGERDUTY_SIGNATURE_HEADER,
            sign(scheme, secret, None, payload),
        )],
        SignatureScheme::TimestampPrefixed => vec![
            (SLACK_TIMESTAMP_HEADER, timestamp.to_string()),
            (
                SLACK_SIGNATURE_HEADER,
                sign(scheme, secret, Some(timestamp), payload),
            ),
        ],
    })
}

pub struct VerifyInput<'a> {
    pub provider: Provider,
    pub secret: &'a str,
    pub payload: &'a str,
    pub signature: &'a str,
    pub timestamp: Option<&'a str>,
    pub tolerance_secs: i64,
    pub now: i64,
}

pub fn verify(input: &VerifyInput<'_>) -> anyhow::Result<Result<(), WebhookVerificationError>> {
    let scheme = scheme_for(input.provider)?;
    let envelope = WebhookEnvelope {
        raw_payload: input.payload,
        provided_signature: Some(input.signature),
        provided_timestamp: input.timestamp,
        secret: Some(input.secret),
    };
    Ok(check_at(&envelope, scheme, input.tolerance_secs, input.now))
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_707_379_800;

    #[test]
    fn test_parse_provider_rejects_unsigned() {
        assert_eq!(parse_provider("slack"), Ok(Provider::Slack));
        assert_eq!(parse_provider("PagerDuty"), Ok(Provider::PagerDuty));
        assert!(parse_provider("claude").unwrap_err().contains("does not sign"));
        assert!(parse_provider("fax").is_err());
    }

    #[test]
    fn test_pagerduty_headers() {
        let headers = signature_headers(Provider::PagerDuty, "secret", "{}", NOW).unwrap();
        assert_eq!(headers.len(), 1);
        assert_eq!(headers[0].0, PAGERDUTY_SIGNATURE_HEADER);
        assert!(headers[0].1.starts_with("v1="));
    }

    #[test]
    fn test_slack_headers_carry_timestamp() {
        let headers = signature_headers(Provider::Slack, "secret", "{}", NOW).unwrap();
        assert_eq!(headers[0], (SLACK_TIMESTAMP_HEADER, NOW.to_string()));
        assert_eq!(headers[1].0, SLACK_SIGNATURE_HEADER);
        assert!(headers[1].1.starts_with("v0="));
    }

    #[test]
    fn test_signed_headers_verify() {
        let headers = signature_headers(Provider::Slack, "secret", "token=x", NOW).unwrap();
        let input = VerifyInput {
            provider: Provider::Slack,
            secret: "secret",
            payload: "token=x",
            signature: &headers[1].1,
            timestamp: Some(&headers[0].1),
            tolerance_secs: 300,
            now: NOW + 10,
        };
        assert_eq!(verify(&input).unwrap(), Ok(()));

        let stale = VerifyInput {
            now: NOW + 301,
            ..input
        };
        assert_eq!(
            verify(&stale).unwrap().unwrap_err().reason(),
            "stale_timestamp"
        );
    }

    #[test]
    fn test_wrong_secret_is_mismatch() {
        let headers = signature_headers(Provider::PagerDuty, "secret", "{}", NOW).unwrap();
        let input = VerifyInput {
            provider: Provider::PagerDuty,
            secret: "other",
            payload: "{}",
            signature: &headers[0].1,
            timestamp: None,
            tolerance_secs: 300,
            now: NOW,
        };
        assert_eq!(
            verify(&input).unwrap(),
            Err(WebhookVerificationError::SignatureMismatch)
        );
    }

    #[test]
    fn test_read_payload_from_file() {
        let path = std::env::temp_dir().join("pa-gateway-payload-test.json");
        std::fs::write(&path, r#"{"event":{}}"#).unwrap();
        let arg = format!("@{}", path.display());
        assert_eq!(read_payload(&arg).unwrap(), r#"{"event":{}}"#);
        assert_eq!(read_payload("inline").unwrap(), "inline");
        std::fs::remove_file(path).ok();
    }
}
