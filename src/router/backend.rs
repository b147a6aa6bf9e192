//! Backend port and the reqwest-based HTTP implementation

use super::RoutingError;
use async_trait::async_trait;
use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, Method, StatusCode};
use reqwest::Client;
use std::time::Duration;
use url::Url;

/// A request ready to leave the gateway
#[derive(Debug, Clone)]
pub struct ForwardRequest {
    pub method: Method,
    /// Original request path, before any prefix stripping
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// A backend response, body still streaming
#[derive(Debug)]
pub struct ForwardResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Body,
}

/// Something that can carry a request to a backend
#[async_trait]
pub trait Backend: Send + Sync {
    /// Send `request` to `target`, failing with `UpstreamTimeout` after `timeout`
    async fn send(
        &self,
        target: Url,
        request: ForwardRequest,
        timeout: Duration,
    ) -> Result<ForwardResponse, RoutingError>;
}

/// HTTP backend over a shared reqwest client
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: Client,
}

impl HttpBackend {
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .user_agent(concat!("portcullis/", env!("CARGO_PKG_VERSION")))
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

fn origin(url: &Url) -> String {
    url.origin().ascii_serialization()
}

#[async_trait]
impl Backend for HttpBackend {
    async fn send(
        &self,
        target: Url,
        request: ForwardRequest,
        timeout: Duration,
    ) -> Result<ForwardResponse, RoutingError> {
        let backend = origin(&target);
        let pending = self
            .client
            .request(request.method, target)
            .headers(request.headers)
            .body(request.body)
            .send();

        let response = match tokio::time::timeout(timeout, pending).await {
            Err(_) => {
                return Err(RoutingError::UpstreamTimeout {
                    backend,
                    after: timeout,
                })
            }
            Ok(Err(e)) if e.is_timeout() => {
                return Err(RoutingError::UpstreamTimeout {
                    backend,
                    after: timeout,
                })
            }
            Ok(Err(e)) => {
                return Err(RoutingError::UpstreamUnavailable {
                    backend,
                    reason: e.to_string(),
                })
            }
            Ok(Ok(response)) => response,
        };

        let status = response.status();
        let headers = response.headers().clone();
        let body = Body::from_stream(response.bytes_stream());

        Ok(ForwardResponse {
            status,
            headers,
            body,
        })
    }
}
