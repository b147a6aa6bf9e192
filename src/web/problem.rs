//! Problem-details error responses
//!
//! Every failure leaves the gateway as `application/problem+json`. Internal
//! errors are logged server-side and rendered with a generic message.

use crate::admission::AdmissionError;
use crate::router::RoutingError;
use crate::storage::StorageError;
use crate::{GatewayError, RequestContext};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;

const PROBLEM_JSON: &str = "application/problem+json";
const GENERIC_DETAIL: &str = "An unexpected error occurred.";
const UPSTREAM_UNAVAILABLE_DETAIL: &str = "Upstream service unavailable.";
const UPSTREAM_TIMEOUT_DETAIL: &str = "Upstream service timed out.";

/// RFC 9457 problem body
#[derive(Debug, Clone, Serialize)]
pub struct Problem {
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    /// Individual validation failures
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

/// A gateway error on its way to the client
#[derive(Debug)]
pub struct ApiError {
    pub error: GatewayError,
    pub instance: Option<String>,
}

impl ApiError {
    /// Attribute the error to a request
    pub fn at(mut self, ctx: &RequestContext) -> Self {
        self.instance = Some(format!("urn:uuid:{}", ctx.request_id));
        self
    }
}

impl From<GatewayError> for ApiError {
    fn from(error: GatewayError) -> Self {
        Self {
            error,
            instance: None,
        }
    }
}

/// HTTP status for a gateway error
pub fn status_for(error: &GatewayError) -> StatusCode {
    match error {
        GatewayError::Authentication(_) => StatusCode::UNAUTHORIZED,
        GatewayError::Authorization(_) => StatusCode::FORBIDDEN,
        GatewayError::Admission(_) => StatusCode::TOO_MANY_REQUESTS,
        GatewayError::Routing(RoutingError::NoMatchingRoute { .. }) => StatusCode::NOT_FOUND,
        GatewayError::Routing(RoutingError::UpstreamUnavailable { .. }) => StatusCode::BAD_GATEWAY,
        GatewayError::Routing(RoutingError::UpstreamTimeout { .. }) => StatusCode::GATEWAY_TIMEOUT,
        GatewayError::Identity(_) | GatewayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        GatewayError::Storage(StorageError::EmailTaken(_)) => StatusCode::CONFLICT,
        GatewayError::Storage(StorageError::IdentityNotFound(_)) => StatusCode::NOT_FOUND,
        GatewayError::Storage(StorageError::UnknownRole(_)) => StatusCode::BAD_REQUEST,
        GatewayError::Storage(_)
        | GatewayError::Token(_)
        | GatewayError::Config(_)
        | GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn problem_slug(error: &GatewayError) -> &'static str {
    match error {
        GatewayError::Authentication(_) => "unauthenticated",
        GatewayError::Authorization(_) => "forbidden",
        GatewayError::Admission(AdmissionError::RateLimited { .. }) => "rate-limited",
        GatewayError::Admission(AdmissionError::QueueOverflow { .. }) => "queue-timeout",
        GatewayError::Routing(RoutingError::NoMatchingRoute { .. }) => "no-route",
        GatewayError::Routing(RoutingError::UpstreamUnavailable { .. }) => "upstream-unavailable",
        GatewayError::Routing(RoutingError::UpstreamTimeout { .. }) => "upstream-timeout",
        GatewayError::Identity(_) => "validation",
        GatewayError::InvalidRequest(_) => "bad-request",
        GatewayError::Storage(StorageError::EmailTaken(_)) => "email-taken",
        GatewayError::Storage(StorageError::IdentityNotFound(_)) => "not-found",
        GatewayError::Storage(StorageError::UnknownRole(_)) => "unknown-role",
        _ => "internal",
    }
}

/// Seconds to put in `Retry-After`, rounded up
fn retry_after(error: &GatewayError) -> Option<u64> {
    match error {
        GatewayError::Admission(AdmissionError::RateLimited { retry_after, .. }) => {
            let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
            Some(secs.max(1))
        }
        _ => None,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.error);

        // backend origins and transport errors stay in the logs
        let detail = if status.is_server_error() {
            tracing::error!(error = %self.error, instance = ?self.instance, "Request failed");
            match &self.error {
                GatewayError::Routing(RoutingError::UpstreamUnavailable { .. }) => {
                    UPSTREAM_UNAVAILABLE_DETAIL
                }
                GatewayError::Routing(RoutingError::UpstreamTimeout { .. }) => {
                    UPSTREAM_TIMEOUT_DETAIL
                }
                _ => GENERIC_DETAIL,
            }
            .to_string()
        } else {
            self.error.to_string()
        };

        let errors = match &self.error {
            GatewayError::Identity(problems) => problems.clone(),
            _ => Vec::new(),
        };

        let problem = Problem {
            kind: format!("urn:portcullis:problem:{}", problem_slug(&self.error)),
            title: status.canonical_reason().unwrap_or("Error").to_string(),
            status: status.as_u16(),
            detail: Some(detail),
            instance: self.instance,
            errors,
        };

        let body = serde_json::to_vec(&problem).unwrap_or_default();
        let mut response = (status, body).into_response();
        let headers = response.headers_mut();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(PROBLEM_JSON));
        if let Some(secs) = retry_after(&self.error) {
            headers.insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        if status == StatusCode::UNAUTHORIZED {
            headers.insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
        }
        response
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        ApiError::from(self).into_response()
    }
}
