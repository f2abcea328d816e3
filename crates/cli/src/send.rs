use std::time::Duration;

use backoff::{backoff::Backoff, ExponentialBackoff};
use chrono::Utc;
use integrations::http::{build_client, retry_after};
use tracing::{info, warn};

pub struct Sender {
    client: reqwest::Client,
    url: String,
}

impl Sender {
    pub fn new(url: String, timeout: Duration) -> anyhow::Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            url,
        })
    }

    /// One delivery attempt. Network failures, 429 and 5xx are transient.
    pub async fn send_once(
        &self,
        headers: &[(&'static str, String)],
        payload: &str,
    ) -> Result<u16, backoff::Error<anyhow::Error>> {
        let mut request = self
            .client
            .post(&self.url)
            .header("Content-Type", content_type(payload))
            .body(payload.to_string());
        for (name, value) in headers {
            request = request.header(*name, value);
        }

        let resp = request
            .send()
            .await
            .map_err(|e| backoff::Error::transient(anyhow::Error::new(e)))?;

        let status = resp.status();
        if status.is_success() {
            return Ok(status.as_u16());
        }

        let err = anyhow::anyhow!("delivery failed: HTTP {}", status);
        if status.as_u16() == 429 || status.is_server_error() {
            Err(backoff::Error::Transient {
                err,
                retry_after: retry_after(resp.headers(), Utc::now()),
            })
        } else {
            Err(backoff::Error::permanent(err))
        }
    }
}

fn content_type(payload: &str) -> &'static str {
    if payload.trim_start().starts_with('{') {
        "application/json"
    } else {
        "application/x-www-form-urlencoded"
    }
}

/// Repeats [`Sender::send_once`] until it succeeds, fails permanently, or
/// `backoff` gives up.
pub async fn send_with_backoff(
    sender: &Sender,
    headers: &[(&'static str, String)],
    payload: &str,
    mut backoff: ExponentialBackoff,
) -> anyhow::Result<u16> {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match sender.send_once(headers, payload).await {
            Ok(status) => {
                info!(attempt, status, "webhook delivered");
                return Ok(status);
            }
            Err(backoff::Error::Permanent(err)) => return Err(err),
            Err(backoff::Error::Transient { err, retry_after }) => {
                let Some(delay) = backoff.next_backoff() else {
                    return Err(err.context(format!("giving up after {} attempts", attempt)));
                };
                let delay = retry_after.map_or(delay, |hint| hint.max(delay));
                warn!(attempt, error = %err, ?delay, "delivery failed, retrying");
                tokio::time::sleep(delay).await;
            }
        }
    }
}
