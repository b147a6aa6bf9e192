//! HTTP handlers for the gateway
//!
//! Identity endpoints are served by the gateway itself; every other path
//! falls through to [`proxy`] and is forwarded to a backend.

use super::problem::ApiError;
use super::server::AppState;
use crate::auth::{Claims, Identity, IssuedToken, Role};
use crate::policy::POLICY_ADMIN_ONLY;
use crate::router::ForwardRequest;
use crate::{GatewayError, RequestContext};
use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection},
        ConnectInfo, FromRequestParts, Json, Path, Request, State,
    },
    http::{header, request::Parts, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Extension,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::SocketAddr;
use uuid::Uuid;

const REQUEST_ID_HEADER: &str = "x-request-id";

/// Extractor for handlers that need a validated bearer token
pub struct Authenticated(pub Claims);

impl FromRequestParts<AppState> for Authenticated {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let header = authorization(parts.headers.get(header::AUTHORIZATION));
        let claims = state.gateway.authenticate(header)?;
        Ok(Authenticated(claims))
    }
}

fn authorization(value: Option<&HeaderValue>) -> Option<&str> {
    value.and_then(|v| v.to_str().ok())
}

fn json_body<T>(
    payload: Result<Json<T>, JsonRejection>,
    ctx: &RequestContext,
) -> Result<T, ApiError> {
    payload
        .map(|Json(body)| body)
        .map_err(|e| ApiError::from(GatewayError::InvalidRequest(e.body_text())).at(ctx))
}

/// Attach a [`RequestContext`] to every request and echo its ID back
pub async fn request_context(mut request: Request, next: Next) -> Response {
    let client_ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    let ctx = RequestContext::new(client_ip)
        .with_authorization(authorization(request.headers().get(header::AUTHORIZATION)));
    let request_id = ctx.request_id.clone();
    request.extensions_mut().insert(ctx);

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

/// Admission control for endpoints the gateway serves itself
pub async fn admit(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    request: Request,
    next: Next,
) -> Response {
    match state.gateway.admit(&ctx, None).await {
        Ok(_permit) => next.run(request).await,
        Err(e) => ApiError::from(e).at(&ctx).into_response(),
    }
}

/// Liveness probe
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    match state.gateway.store().health_check().await {
        Ok(()) => (StatusCode::OK, Json(serde_json::json!({ "status": "OK" }))),
        Err(e) => {
            tracing::warn!("Health check failed: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({ "status": "Unavailable" })),
            )
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CredentialsBody {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct AddRoleBody {
    pub role: String,
}

/// Public view of an identity
#[derive(Debug, Serialize)]
pub struct IdentityView {
    pub id: Uuid,
    pub email: String,
    pub roles: BTreeSet<Role>,
}

impl From<Identity> for IdentityView {
    fn from(identity: Identity) -> Self {
        Self {
            id: identity.id,
            email: identity.email.clone(),
            roles: identity.roles().clone(),
        }
    }
}

pub async fn register(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    payload: Result<Json<CredentialsBody>, JsonRejection>,
) -> Result<(StatusCode, Json<IdentityView>), ApiError> {
    let body = json_body(payload, &ctx)?;
    let identity = state
        .gateway
        .register(&body.email, &body.password)
        .await
        .map_err(|e| ApiError::from(e).at(&ctx))?;

    Ok((StatusCode::CREATED, Json(identity.into())))
}

pub async fn login(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    payload: Result<Json<CredentialsBody>, JsonRejection>,
) -> Result<Json<IssuedToken>, ApiError> {
    let body = json_body(payload, &ctx)?;
    let issued = state
        .gateway
        .login(&body.email, &body.password)
        .await
        .map_err(|e| ApiError::from(e).at(&ctx))?;

    Ok(Json(issued))
}

/// The caller's own identity
pub async fn me(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Authenticated(claims): Authenticated,
) -> Result<Json<IdentityView>, ApiError> {
    let identity = state
        .gateway
        .current_identity(&claims)
        .await
        .map_err(|e| ApiError::from(e).at(&ctx))?;

    Ok(Json(identity.into()))
}

/// Grant a role to another identity (admins only)
pub async fn add_role(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Authenticated(claims): Authenticated,
    path: Result<Path<Uuid>, PathRejection>,
    payload: Result<Json<AddRoleBody>, JsonRejection>,
) -> Result<Json<IdentityView>, ApiError> {
    let Path(id) =
        path.map_err(|e| ApiError::from(GatewayError::InvalidRequest(e.body_text())).at(&ctx))?;
    let body = json_body(payload, &ctx)?;
    let result = async {
        state.gateway.authorize(&claims, POLICY_ADMIN_ONLY)?;
        state.gateway.add_role(id, &body.role).await
    }
    .await;

    let identity = result.map_err(|e| ApiError::from(e).at(&ctx))?;
    Ok(Json(identity.into()))
}

/// Forward anything not served by the gateway itself
pub async fn proxy(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    request: Request,
) -> Result<Response, ApiError> {
    let (parts, body) = request.into_parts();
    let auth_header = authorization(parts.headers.get(header::AUTHORIZATION));

    // the body is only read once the caller has been admitted and authorized
    let ticket = state
        .gateway
        .check_proxy(&ctx, auth_header, parts.uri.path())
        .await
        .map_err(|e| ApiError::from(e).at(&ctx))?;

    let limit = state.gateway.config().upstream.max_body_bytes;
    let body = axum::body::to_bytes(body, limit).await.map_err(|e| {
        ApiError::from(GatewayError::InvalidRequest(format!(
            "Unable to read request body: {}",
            e
        )))
        .at(&ctx)
    })?;

    let forward = ForwardRequest {
        method: parts.method,
        path: parts.uri.path().to_string(),
        query: parts.uri.query().map(str::to_string),
        headers: parts.headers,
        body,
    };

    let upstream = state
        .gateway
        .forward(&ctx, &ticket, forward)
        .await
        .map_err(|e| ApiError::from(e).at(&ctx))?;

    let mut response = Response::new(upstream.body);
    *response.status_mut() = upstream.status;
    *response.headers_mut() = upstream.headers;
    Ok(response)
}
