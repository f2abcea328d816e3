pub mod circuit;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod gateway;
pub mod keyed;
pub mod quota;
pub mod retry;
pub mod types;
pub mod webhook;

pub use circuit::{CircuitBreaker, CircuitConfig, CircuitStatus};
pub use error::{Classification, GatewayError, IntegrationError, WebhookVerificationError};
pub use gateway::{Gateway, GatewayOutcome, GatewayRequest};
pub use quota::{QuotaConfig, QuotaTracker, UsageStore};
pub use retry::{RetryConfig, RetryPolicy};
pub use types::{Metered, Plan, Provider, TokenUsage};
pub use webhook::{SignatureScheme, WebhookVerifier};
