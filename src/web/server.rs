//! HTTP server assembly using Axum
//!
//! Routes are registered explicitly through [`GatewayAppBuilder`]. Paths not
//! registered there fall through to the forwarding handler.

use crate::server::Gateway;
use crate::GatewayError;
use axum::{
    extract::FromRef,
    middleware,
    routing::{get, post, MethodRouter},
    Router,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use super::routes;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
}

impl FromRef<AppState> for Arc<Gateway> {
    fn from_ref(state: &AppState) -> Self {
        state.gateway.clone()
    }
}

/// Builder for [`GatewayApp`]
#[derive(Default)]
pub struct GatewayAppBuilder {
    gateway: Option<Arc<Gateway>>,
    /// Served without admission control
    public: Vec<(&'static str, MethodRouter<AppState>)>,
    /// Served behind admission control
    admitted: Vec<(&'static str, MethodRouter<AppState>)>,
}

impl GatewayAppBuilder {
    /// Gateway the handlers run against
    pub fn gateway(mut self, gateway: Arc<Gateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    /// Register a route that bypasses admission control
    pub fn public_route(mut self, path: &'static str, handler: MethodRouter<AppState>) -> Self {
        self.public.push((path, handler));
        self
    }

    /// Register a route subject to admission control
    pub fn route(mut self, path: &'static str, handler: MethodRouter<AppState>) -> Self {
        self.admitted.push((path, handler));
        self
    }

    /// Health and identity endpoints
    pub fn with_default_routes(self) -> Self {
        self.public_route("/health", get(routes::health))
            .route("/auth/register", post(routes::register))
            .route("/auth/login", post(routes::login))
            .route("/users/me", get(routes::me))
            .route("/users/{id}/roles", post(routes::add_role))
    }

    pub fn build(self) -> Result<GatewayApp, GatewayError> {
        let gateway = self
            .gateway
            .ok_or_else(|| GatewayError::Internal("No gateway configured".to_string()))?;

        Ok(GatewayApp {
            state: AppState { gateway },
            public: self.public,
            admitted: self.admitted,
        })
    }
}

/// The gateway's HTTP application
pub struct GatewayApp {
    state: AppState,
    public: Vec<(&'static str, MethodRouter<AppState>)>,
    admitted: Vec<(&'static str, MethodRouter<AppState>)>,
}

impl GatewayApp {
    pub fn builder() -> GatewayAppBuilder {
        GatewayAppBuilder::default()
    }

    /// Build the router with all registered routes
    pub fn router(&self) -> Router {
        let admitted = self
            .admitted
            .iter()
            .fold(Router::new(), |router, (path, handler)| {
                router.route(path, handler.clone())
            })
            .route_layer(middleware::from_fn_with_state(
                self.state.clone(),
                routes::admit,
            ));

        self.public
            .iter()
            .fold(Router::new(), |router, (path, handler)| {
                router.route(path, handler.clone())
            })
            .merge(admitted)
            .fallback(routes::proxy)
            .layer(middleware::from_fn(routes::request_context))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Serve until `shutdown` resolves
    pub async fn run(
        self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let bind = self.state.gateway.config().server.bind.clone();
        let router = self.router();
        let listener = tokio::net::TcpListener::bind(&bind).await?;

        tracing::info!(bind = %bind, "Starting Portcullis gateway");

        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await?;

        tracing::info!("Gateway stopped");
        Ok(())
    }

    /// Get the gateway behind this application
    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.state.gateway
    }
}
