//! Shared HTTP plumbing: client construction and translation of transport
//! failures and non-2xx responses into [`IntegrationError`].

use std::time::Duration;

use chrono::{DateTime, Utc};
use gateway_core::error::IntegrationError;
use reqwest::header::HeaderMap;
use reqwest::Response;
use tracing::warn;

const MAX_ERROR_BODY: usize = 512;

// Values above this are unix timestamps rather than second counts.
const EPOCH_THRESHOLD: i64 = 1_000_000_000;

pub fn build_client(timeout: Duration) -> Result<reqwest::Client, IntegrationError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("processaudit-gateway/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| IntegrationError::InvalidInput(format!("failed to build HTTP client: {e}")))
}

pub fn transport_error(err: reqwest::Error, timeout: Duration) -> IntegrationError {
    if err.is_timeout() {
        IntegrationError::Timeout(timeout)
    } else if err.is_builder() {
        IntegrationError::InvalidInput(err.to_string())
    } else {
        IntegrationError::Network(err.to_string())
    }
}

/// Provider wait hint, from `Retry-After` (seconds or HTTP date) or the
/// rate limit reset headers (seconds or unix timestamp).
pub fn retry_after(headers: &HeaderMap, now: DateTime<Utc>) -> Option<Duration> {
    let value = |name: &str| headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim);

    if let Some(raw) = value("retry-after") {
        if let Ok(secs) = raw.parse::<u64>() {
            return Some(Duration::from_secs(secs));
        }
        if let Ok(at) = DateTime::parse_from_rfc2822(raw) {
            return (at.with_timezone(&Utc) - now).to_std().ok();
        }
    }

    let raw = value("x-ratelimit-reset").or_else(|| value("ratelimit-reset"))?;
    let reset = raw.parse::<f64>().ok()?.ceil() as i64;
    let secs = if reset > EPOCH_THRESHOLD {
        reset - now.timestamp()
    } else {
        reset
    };
    u64::try_from(secs).ok().map(Duration::from_secs)
}

/// Passes 2xx responses through; turns anything else into
/// [`IntegrationError::Http`] carrying a truncated body and wait hint.
pub async fn check_response(response: Response) -> Result<Response, IntegrationError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let hint = retry_after(response.headers(), Utc::now());
    let body = response.text().await.unwrap_or_default();
    let message = if body.len() > MAX_ERROR_BODY {
        let mut end = MAX_ERROR_BODY;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &body[..end])
    } else {
        body
    };

    warn!(status = status.as_u16(), retry_after_ms = ?hint.map(|d| d.as_millis() as u64), "provider returned error status");

    Err(IntegrationError::Http {
        status: status.as_u16(),
        message: if message.is_empty() {
            status.canonical_reason().unwrap_or("error").to_string()
        } else {
            message
        },
        retry_after: hint,
    })
}

pub async fn decode_json<T>(response: Response) -> Result<T, IntegrationError>
where
    T: serde::de::DeserializeOwned,
{
    let status = response.status().as_u16();
    response
        .json::<T>()
        .await
        .map_err(|e| IntegrationError::http(status, format!("unreadable response body: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use reqwest::header::HeaderValue;
    use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_str(value).unwrap());
        }
        map
    }

    fn now() -> DateTime<Utc> {
        Utc.timestamp_opt(1_707_386_400, 0).unwrap()
    }

    #[test]
    fn test_retry_after_seconds() {
        let hint = retry_after(&headers(&[("retry-after", "30")]), now());
        assert_eq!(hint, Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_retry_after_http_date() {
        let hint = retry_after(
            &headers(&[("retry-after", "Thu, 08 Feb 2024 10:00:45 +0000")]),
            now(),
        );
        assert_eq!(hint, Some(Duration::from_secs(45)));
    }

    #[test]
    fn test_ratelimit_reset_epoch_and_delta() {
        let epoch = retry_after(&headers(&[("x-ratelimit-reset", "1707386460")]), now());
        assert_eq!(epoch, Some(Duration::from_secs(60)));

        let delta = retry_after(&headers(&[("ratelimit-reset", "12")]), now());
        assert_eq!(delta, Some(Duration::from_secs(12)));
    }

    #[test]
    fn test_reset_in_the_past_is_ignored() {
        assert_eq!(
            retry_after(&headers(&[("x-ratelimit-reset", "1707386000")]), now()),
            None
        );
        assert_eq!(retry_after(&HeaderMap::new(), now()), None);
    }

    #[tokio::test]
    async fn test_error_status_becomes_http_error() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("GET"))
            .respond_with(
                ResponseTemplate::new(429)
                    .insert_header("retry-after", "7")
                    .set_body_string("slow down"),
            )
            .mount(&server)
            .await;

        let client = build_client(Duration::from_secs(5)).unwrap();
        let response = client.get(server.uri()).send().await.unwrap();
        let err = check_response(response).await.unwrap_err();

        assert_eq!(err.status(), Some(429));
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
        assert!(err.is_retryable());
        assert!(err.to_string().contains("slow down"));
    }

    #[tokio::test]
    async fn test_connection_refused_is_network_error() {
        let client = build_client(Duration::from_secs(5)).unwrap();
        let err = client
            .get("http://127.0.0.1:9/unreachable")
            .send()
            .await
            .map_err(|e| transport_error(e, Duration::from_secs(5)))
            .unwrap_err();
        assert!(matches!(err, IntegrationError::Network(_)));
    }
}
