//! Portcullis - an edge gateway core
//!
//! Portcullis sits in front of backend services. Every inbound request is
//! admitted by a fixed-window rate limiter, authenticated by its bearer token,
//! authorized against the matched route's role policy and finally forwarded
//! to the route's backend.

pub mod admission;
pub mod auth;
pub mod config;
pub mod policy;
pub mod router;
pub mod server;
pub mod storage;
pub mod web;

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use std::net::IpAddr;
use thiserror::Error;
use uuid::Uuid;

/// Core error types for Portcullis
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Authentication failed: {0}")]
    Authentication(#[from] auth::AuthError),

    #[error("{0}")]
    Authorization(#[from] policy::AuthorizationError),

    #[error("{0}")]
    Admission(#[from] admission::AdmissionError),

    #[error("{0}")]
    Routing(#[from] router::RoutingError),

    #[error("Invalid identity data: {}", .0.join(" "))]
    Identity(Vec<String>),

    #[error("Storage error: {0}")]
    Storage(#[from] storage::StorageError),

    #[error("Token error: {0}")]
    Token(#[from] auth::TokenError),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Per-request context threaded through admission, auth and forwarding
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Unique request identifier
    pub request_id: String,
    /// When the request was received
    pub received_at: DateTime<Utc>,
    /// Peer address of the client connection
    pub client_ip: Option<IpAddr>,
    /// Raw bearer credential, if one was presented
    pub credential: Option<SecretString>,
}

impl RequestContext {
    /// Create a new request context with generated ID
    pub fn new(client_ip: Option<IpAddr>) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            received_at: Utc::now(),
            client_ip,
            credential: None,
        }
    }

    /// Attach the bearer credential from an Authorization header value
    pub fn with_authorization(mut self, header: Option<&str>) -> Self {
        self.credential = auth::extract_bearer_token(header)
            .ok()
            .filter(|token| !token.is_empty())
            .map(|token| SecretString::from(token.to_string()));
        self
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new(None)
    }
}
