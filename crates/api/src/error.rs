use axum::{
    http::{header, HeaderValue, StatusCode},
    response::IntoResponse,
    Json,
};
use gateway_core::error::{GatewayError, IntegrationError};
use serde::Serialize;
use tracing::error;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    pub request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    Unauthorized(String),
    CircuitOpen { retry_in_ms: u64 },
    QuotaExceeded { used: f64, limit: f64 },
    Upstream(String),
    NotConfigured(&'static str),
    Internal,
}

#[derive(Debug)]
pub struct ApiError {
    pub error: AppError,
    pub request_id: String,
    pub correlation_id: Option<String>,
}

impl AppError {
    pub fn with_request_id(self, request_id: &str) -> ApiError {
        ApiError {
            error: self,
            request_id: request_id.to_string(),
            correlation_id: None,
        }
    }
}

impl ApiError {
    pub fn with_correlation_id(mut self, correlation_id: &str) -> Self {
        self.correlation_id = Some(correlation_id.to_string());
        self
    }
}

/// Provider failures are reduced to a code and a generic message; the
/// upstream body stays in the logs.
impl From<GatewayError> for AppError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::CircuitOpen { open, .. } => AppError::CircuitOpen {
                retry_in_ms: open.retry_in.as_millis() as u64,
            },
            GatewayError::QuotaExceeded { used, limit, .. } => {
                AppError::QuotaExceeded { used, limit }
            }
            GatewayError::Fatal {
                source: IntegrationError::InvalidInput(message),
                ..
            } => AppError::BadRequest(message),
            GatewayError::Fatal { provider, .. } => {
                AppError::Upstream(format!("{} rejected the request", provider))
            }
            GatewayError::RetryExhausted { provider, .. } => {
                AppError::Upstream(format!("{} is unavailable", provider))
            }
            GatewayError::Cancelled { .. } => AppError::Internal,
            GatewayError::Quota { provider, source } => {
                error!(%provider, error = %source, "usage store failure");
                AppError::Internal
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let mut retry_after = None;
        let (status, code, message) = match self.error {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "invalid_request", msg),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "unauthorized", msg),
            AppError::CircuitOpen { retry_in_ms } => {
                retry_after = Some(retry_in_ms.div_ceil(1_000));
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "circuit_open",
                    "Provider temporarily unavailable".to_string(),
                )
            }
            AppError::QuotaExceeded { used, limit } => (
                StatusCode::TOO_MANY_REQUESTS,
                "quota_exceeded",
                format!("Usage quota exceeded ({} of {})", used, limit),
            ),
            AppError::Upstream(msg) => (StatusCode::BAD_GATEWAY, "upstream_error", msg),
            AppError::NotConfigured(what) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "not_configured",
                format!("{} is not configured", what),
            ),
            AppError::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "Unexpected error".to_string(),
            ),
        };

        let mut response = (
            status,
            Json(ErrorResponse {
                error: ErrorBody {
                    code: code.to_string(),
                    message,
                    request_id: self.request_id,
                    correlation_id: self.correlation_id,
                },
            }),
        )
            .into_response();

        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use axum::response::IntoResponse;
    use gateway_core::error::CircuitOpen;
    use gateway_core::Provider;
    use std::time::Duration;

    fn rt() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let body = to_bytes(response.into_body(), 1024).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[test]
    fn test_with_request_id() {
        let err = AppError::Internal.with_request_id("req_123");
        assert_eq!(err.request_id, "req_123");
        assert!(err.correlation_id.is_none());
    }

    #[test]
    fn test_bad_request_response() {
        rt().block_on(async {
            let err = AppError::BadRequest("missing field".to_string()).with_request_id("req_001");
            let response = err.into_response();

            assert_eq!(response.status(), StatusCode::BAD_REQUEST);

            let json = body_json(response).await;
            assert_eq!(json["error"]["code"], "invalid_request");
            assert_eq!(json["error"]["message"], "missing field");
            assert_eq!(json["error"]["request_id"], "req_001");
            assert!(json["error"].get("correlation_id").is_none());
        });
    }

    #[test]
    fn test_unauthorized_response() {
        rt().block_on(async {
            let err = AppError::Unauthorized("invalid signature".to_string()).with_request_id("req_002");
            let response = err.into_response();

            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

            let json = body_json(response).await;
            assert_eq!(json["error"]["code"], "unauthorized");
            assert_eq!(json["error"]["message"], "invalid signature");
        });
    }

    #[test]
    fn test_circuit_open_response_sets_retry_after() {
        rt().block_on(async {
            let err = AppError::from(GatewayError::CircuitOpen {
                provider: Provider::PagerDuty,
                open: CircuitOpen {
                    target: "pagerduty".to_string(),
                    retry_in: Duration::from_millis(1_500),
                },
            })
            .with_request_id("req_003")
            .with_correlation_id("corr_abc");
            let response = err.into_response();

            assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
            assert_eq!(response.headers()[header::RETRY_AFTER], "2");

            let json = body_json(response).await;
            assert_eq!(json["error"]["code"], "circuit_open");
            assert_eq!(json["error"]["correlation_id"], "corr_abc");
        });
    }

    #[test]
    fn test_quota_exceeded_response() {
        rt().block_on(async {
            let err = AppError::from(GatewayError::QuotaExceeded {
                provider: Provider::Claude,
                organization_id: "org_free".to_string(),
                used: 50.0,
                limit: 50.0,
            })
            .with_request_id("req_004");
            let response = err.into_response();

            assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

            let json = body_json(response).await;
            assert_eq!(json["error"]["code"], "quota_exceeded");
        });
    }

    #[test]
    fn test_upstream_error_hides_provider_body() {
        rt().block_on(async {
            let err = AppError::from(GatewayError::RetryExhausted {
                provider: Provider::Slack,
                attempts: 3,
                source: IntegrationError::http(503, "secret internal stack trace"),
            })
            .with_request_id("req_005");
            let response = err.into_response();

            assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

            let json = body_json(response).await;
            assert_eq!(json["error"]["code"], "upstream_error");
            assert_eq!(json["error"]["message"], "slack is unavailable");
            assert!(!json.to_string().contains("stack trace"));
        });
    }

    #[test]
    fn test_fatal_invalid_input_is_bad_request() {
        let err = AppError::from(GatewayError::Fatal {
            provider: Provider::PagerDuty,
            attempts: 1,
            source: IntegrationError::InvalidInput("summary is required".to_string()),
        });
        assert!(matches!(err, AppError::BadRequest(ref msg) if msg == "summary is required"));
    }

    #[test]
    fn test_not_configured_response() {
        rt().block_on(async {
            let response = AppError::NotConfigured("PagerDuty")
                .with_request_id("req_006")
                .into_response();

            assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

            let json = body_json(response).await;
            assert_eq!(json["error"]["code"], "not_configured");
            assert_eq!(json["error"]["message"], "PagerDuty is not configured");
        });
    }

    #[test]
    fn test_internal_error_response() {
        rt().block_on(async {
            let err = AppError::Internal.with_request_id("req_007");
            let response = err.into_response();

            assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

            let json = body_json(response).await;
            assert_eq!(json["error"]["code"], "internal_error");
            assert_eq!(json["error"]["message"], "Unexpected error");
        });
    }
}
