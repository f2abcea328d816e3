use axum::{body::Body, http::Request, middleware::Next, response::Response};
use gateway_core::Plan;

use crate::{
    error::{ApiError, AppError},
    state::RequestId,
};

pub const ORGANIZATION_HEADER: &str = "x-organization-id";
pub const PLAN_HEADER: &str = "x-organization-plan";

/// Caller identity for quota accounting. Authentication happens upstream of
/// this service; the edge proxy forwards the organization and its plan.
#[derive(Debug, Clone)]
pub struct OrgContext {
    pub organization_id: String,
    pub plan: Plan,
}

pub async fn organization(mut req: Request<Body>, next: Next) -> Result<Response, ApiError> {
    let request_id = req
        .extensions()
        .get::<RequestId>()
        .map(|id| id.0.clone())
        .unwrap_or_default();

    let (organization_id, plan) = {
        let header = |name: &str| {
            req.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        let organization_id = header(ORGANIZATION_HEADER).ok_or_else(|| {
            AppError::Unauthorized("missing organization".to_string()).with_request_id(&request_id)
        })?;

        let plan = match header(PLAN_HEADER) {
            Some(raw) => raw
                .parse::<Plan>()
                .map_err(|e| AppError::BadRequest(e).with_request_id(&request_id))?,
            None => Plan::Free,
        };

        (organization_id, plan)
    };

    req.extensions_mut().insert(OrgContext {
        organization_id,
        plan,
    });

    Ok(next.run(req).await)
}
