//! Request routing for Portcullis
//!
//! Handles:
//! - Longest-prefix matching of request paths to backend routes
//! - Forwarding admitted requests to the matched backend
//! - Atomic replacement of the route table on reload

mod backend;
mod matcher;

pub use backend::{Backend, ForwardRequest, ForwardResponse, HttpBackend};
pub use matcher::{RouteRule, RouteTable, RouteTableError};

use crate::RequestContext;
use arc_swap::ArcSwap;
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Routing failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoutingError {
    #[error("No route matches '{path}'")]
    NoMatchingRoute { path: String },

    #[error("Upstream {backend} unavailable: {reason}")]
    UpstreamUnavailable { backend: String, reason: String },

    #[error("Upstream {backend} did not respond within {}ms", after.as_millis())]
    UpstreamTimeout { backend: String, after: Duration },
}

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// Headers that describe a single connection and must not be forwarded
const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Remove hop-by-hop headers, including any named by `Connection`
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in named.iter().chain(HOP_BY_HOP.iter()) {
        headers.remove(name);
    }
}

/// Matches requests to routes and forwards them
pub struct Router {
    table: ArcSwap<RouteTable>,
    backend: Arc<dyn Backend>,
    timeout: Duration,
}

impl Router {
    pub fn new(table: RouteTable, backend: Arc<dyn Backend>, timeout: Duration) -> Self {
        Self {
            table: ArcSwap::from_pointee(table),
            backend,
            timeout,
        }
    }

    /// The current table; callers keep using it even if a reload happens
    pub fn snapshot(&self) -> Arc<RouteTable> {
        self.table.load_full()
    }

    /// Replace the route table atomically
    pub fn reload(&self, table: RouteTable) {
        let routes = table.len();
        self.table.store(Arc::new(table));
        tracing::info!(routes, "Route table reloaded");
    }

    /// Per-request upstream deadline
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Forward a request to the backend of `rule`
    pub async fn forward(
        &self,
        rule: &RouteRule,
        mut request: ForwardRequest,
        ctx: &RequestContext,
    ) -> Result<ForwardResponse, RoutingError> {
        let target = rule.target_url(&request.path, request.query.as_deref());

        strip_hop_by_hop(&mut request.headers);
        request.headers.remove(header::HOST);
        if let Some(ip) = ctx.client_ip {
            let forwarded_for = match request.headers.get(&X_FORWARDED_FOR) {
                Some(prior) => format!("{}, {}", prior.to_str().unwrap_or_default(), ip),
                None => ip.to_string(),
            };
            if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
                request.headers.insert(X_FORWARDED_FOR, value);
            }
        }
        if let Ok(value) = HeaderValue::from_str(&ctx.request_id) {
            request.headers.insert(X_REQUEST_ID, value);
        }

        tracing::debug!(
            request_id = %ctx.request_id,
            route = %rule.path_prefix,
            target = %target,
            "Forwarding request"
        );

        let mut response = self.backend.send(target, request, self.timeout).await?;
        strip_hop_by_hop(&mut response.headers);
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::{Body, Bytes};
    use axum::http::{Method, StatusCode};
    use parking_lot::Mutex;
    use std::net::{IpAddr, Ipv4Addr};
    use url::Url;

    /// Records what it was asked to send
    #[derive(Default)]
    struct RecordingBackend {
        seen: Mutex<Vec<(Url, HeaderMap)>>,
    }

    #[async_trait]
    impl Backend for RecordingBackend {
        async fn send(
            &self,
            target: Url,
            request: ForwardRequest,
            _timeout: Duration,
        ) -> Result<ForwardResponse, RoutingError> {
            self.seen.lock().push((target, request.headers));
            let mut headers = HeaderMap::new();
            headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
            headers.insert("x-upstream", HeaderValue::from_static("1"));
            Ok(ForwardResponse {
                status: StatusCode::OK,
                headers,
                body: Body::empty(),
            })
        }
    }

    fn table(prefix: &str, backend: &str) -> RouteTable {
        RouteTable::new(vec![RouteRule::new(prefix, Url::parse(backend).unwrap())]).unwrap()
    }

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, x-private"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("x-private", HeaderValue::from_static("secret"));
        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert(header::ACCEPT, HeaderValue::from_static("*/*"));

        strip_hop_by_hop(&mut headers);

        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key(header::ACCEPT));
    }

    #[tokio::test]
    async fn test_forward_rewrites_headers() {
        let backend = Arc::new(RecordingBackend::default());
        let router = Router::new(
            table("/api", "http://svc:9000"),
            backend.clone(),
            Duration::from_secs(1),
        );

        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("gateway.local"));
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer t"));
        headers.insert(X_FORWARDED_FOR, HeaderValue::from_static("203.0.113.9"));
        let request = ForwardRequest {
            method: Method::POST,
            path: "/api/items".to_string(),
            query: Some("page=2".to_string()),
            headers,
            body: Bytes::from_static(b"{}"),
        };
        let ctx = RequestContext::new(Some(IpAddr::V4(Ipv4Addr::LOCALHOST)));

        let snapshot = router.snapshot();
        let rule = snapshot.match_path("/api/items").unwrap();
        let response = router.forward(rule, request, &ctx).await.unwrap();

        assert!(!response.headers.contains_key(header::CONNECTION));
        assert_eq!(response.headers["x-upstream"], "1");

        let seen = backend.seen.lock();
        let (target, sent) = &seen[0];
        assert_eq!(target.as_str(), "http://svc:9000/api/items?page=2");
        assert!(!sent.contains_key(header::HOST));
        assert_eq!(sent[header::AUTHORIZATION], "Bearer t");
        assert_eq!(sent[&X_FORWARDED_FOR], "203.0.113.9, 127.0.0.1");
        assert_eq!(sent[&X_REQUEST_ID], ctx.request_id.as_str());
    }

    #[test]
    fn test_reload_keeps_old_snapshot() {
        let router = Router::new(
            table("/old", "http://old"),
            Arc::new(RecordingBackend::default()),
            Duration::from_secs(1),
        );

        let before = router.snapshot();
        router.reload(table("/new", "http://new"));

        assert!(before.match_path("/old/x").is_ok());
        assert!(router.snapshot().match_path("/old/x").is_err());
        assert!(router.snapshot().match_path("/new/x").is_ok());
    }
}
