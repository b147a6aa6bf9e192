//! Portcullis gateway core
//!
//! Wires the token service, authorization engine, admission controller and
//! router into the per-request pipeline, and implements the identity
//! operations exposed over HTTP.

use crate::admission::{AdmissionController, KeyBy, Permit};
use crate::auth::{
    authenticate, check_email, check_password_rules, hash_password, AuthError, Claims, Identity,
    IssuedToken, Role, TokenService,
};
use crate::config::Config;
use crate::policy::AuthorizationEngine;
use crate::router::{Backend, ForwardRequest, ForwardResponse, RouteRule, RouteTable, Router};
use crate::storage::{CredentialStore, StorageError};
use crate::{GatewayError, RequestContext};
use secrecy::ExposeSecret;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::info;
use uuid::Uuid;

/// A proxied request that passed admission, authentication and authorization
#[derive(Debug, Clone)]
pub struct ProxyTicket {
    /// The matched route
    pub rule: RouteRule,
    /// Claims of the validated bearer token
    pub claims: Claims,
}

/// The gateway: every shared component a request handler needs
pub struct Gateway {
    /// Configuration
    config: Config,
    /// Token issuing and validation
    tokens: TokenService,
    /// Policy evaluation
    authz: AuthorizationEngine,
    /// Rate limiting and queueing
    admission: AdmissionController,
    /// Route matching and forwarding
    router: Router,
    /// Identity storage
    store: Arc<dyn CredentialStore>,
}

impl Gateway {
    /// Create a new gateway
    pub fn new(
        config: Config,
        store: Arc<dyn CredentialStore>,
        backend: Arc<dyn Backend>,
    ) -> Self {
        let tokens = TokenService::new(&config.token);
        let authz = AuthorizationEngine::new().with_policies(config.policies.clone());
        let admission = AdmissionController::new(config.admission.limits.clone());
        let router = Router::new(config.routes.clone(), backend, config.upstream.timeout);

        Self {
            config,
            tokens,
            authz,
            admission,
            router,
            store,
        }
    }

    /// Create the identities listed in the configuration
    ///
    /// Identities whose email is already registered are left untouched.
    pub async fn bootstrap_identities(&self) -> Result<usize, GatewayError> {
        let mut created = 0;
        for user in &self.config.users {
            let mut identity = Identity::new(user.email.trim(), user.password_hash.clone());
            for role in &user.roles {
                identity.grant(*role);
            }

            match self.store.create(&identity).await {
                Ok(()) => {
                    info!(email = %identity.email, roles = ?identity.roles(), "Bootstrapped identity");
                    created += 1;
                }
                Err(StorageError::EmailTaken(email)) => {
                    tracing::debug!(email = %email, "Bootstrap identity already exists");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(created)
    }

    /// Limiter key for a request, honoring the route's override
    pub fn admission_key(&self, ctx: &RequestContext, rule: Option<&RouteRule>) -> String {
        let key_by = rule
            .and_then(|r| r.key_by)
            .unwrap_or(self.config.admission.key_by);
        let subject = match key_by {
            KeyBy::Credential => self.verified_subject(ctx),
            _ => None,
        };
        key_by.resolve(ctx, subject.as_deref(), rule.map(|r| r.path_prefix.as_str()))
    }

    /// Subject of the request's bearer token, if it validates
    fn verified_subject(&self, ctx: &RequestContext) -> Option<String> {
        let credential = ctx.credential.as_ref()?;
        self.tokens
            .validate(credential.expose_secret())
            .ok()
            .map(|claims| claims.sub)
    }

    /// Run a request through admission control
    pub async fn admit(
        &self,
        ctx: &RequestContext,
        rule: Option<&RouteRule>,
    ) -> Result<Permit, GatewayError> {
        let key = self.admission_key(ctx, rule);
        let permit = match self.config.admission.queue_timeout {
            Some(timeout) => {
                self.admission
                    .admit_with_deadline(&key, Instant::now() + timeout)
                    .await?
            }
            None => self.admission.admit(&key).await?,
        };

        if !permit.waited.is_zero() {
            tracing::debug!(
                request_id = %ctx.request_id,
                key = %permit.key,
                waited_ms = permit.waited.as_millis() as u64,
                "Admitted after queueing"
            );
        }
        Ok(permit)
    }

    /// Validate the bearer credential in an Authorization header
    pub fn authenticate(&self, auth_header: Option<&str>) -> Result<Claims, GatewayError> {
        Ok(authenticate(&self.tokens, auth_header)?)
    }

    /// Evaluate a named policy
    pub fn authorize(&self, claims: &Claims, policy: &str) -> Result<(), GatewayError> {
        Ok(self.authz.authorize(claims, policy)?)
    }

    /// Full pipeline for a proxied request: admit, authenticate, authorize, forward
    pub async fn proxy(
        &self,
        ctx: &RequestContext,
        auth_header: Option<&str>,
        request: ForwardRequest,
    ) -> Result<ForwardResponse, GatewayError> {
        let ticket = self.check_proxy(ctx, auth_header, &request.path).await?;
        self.forward(ctx, &ticket, request).await
    }

    /// Everything that must pass before a proxied request body is read
    ///
    /// Unmatched paths still pass through admission before `NoMatchingRoute`
    /// is reported.
    pub async fn check_proxy(
        &self,
        ctx: &RequestContext,
        auth_header: Option<&str>,
        path: &str,
    ) -> Result<ProxyTicket, GatewayError> {
        let table = self.router.snapshot();
        let matched = table.match_path(path);

        self.admit(ctx, matched.as_ref().ok().copied()).await?;
        let rule = matched?;

        let claims = self.authenticate(auth_header)?;
        if let Some(policy) = &rule.policy {
            self.authorize(&claims, policy)?;
        }

        Ok(ProxyTicket {
            rule: rule.clone(),
            claims,
        })
    }

    /// Forward a request that already passed [`Gateway::check_proxy`]
    pub async fn forward(
        &self,
        ctx: &RequestContext,
        ticket: &ProxyTicket,
        request: ForwardRequest,
    ) -> Result<ForwardResponse, GatewayError> {
        let method = request.method.clone();
        let response = self.router.forward(&ticket.rule, request, ctx).await?;

        info!(
            request_id = %ctx.request_id,
            route = %ticket.rule.path_prefix,
            method = %method,
            subject = %ticket.claims.sub,
            status = response.status.as_u16(),
            "Request forwarded"
        );

        Ok(response)
    }

    /// Register a new identity with the USER role
    pub async fn register(&self, email: &str, password: &str) -> Result<Identity, GatewayError> {
        let mut problems = Vec::new();
        if let Err(problem) = check_email(email) {
            problems.push(problem);
        }
        if let Err(mut password_problems) = check_password_rules(password) {
            problems.append(&mut password_problems);
        }
        if !problems.is_empty() {
            return Err(GatewayError::Identity(problems));
        }

        let password = password.to_string();
        let hash = tokio::task::spawn_blocking(move || hash_password(&password))
            .await
            .map_err(|e| GatewayError::Internal(e.to_string()))?
            .map_err(StorageError::from)?;

        let mut identity = Identity::new(email.trim(), hash);
        identity.grant(Role::User);
        self.store.create(&identity).await?;

        info!(id = %identity.id, email = %identity.email, "Identity registered");
        Ok(identity)
    }

    /// Exchange email and password for a token
    pub async fn login(&self, email: &str, password: &str) -> Result<IssuedToken, GatewayError> {
        let identity = self
            .store
            .check_password(email, password)
            .await?
            .ok_or(AuthError::InvalidCredentials)?;

        let token = self.tokens.create(&identity)?;
        info!(id = %identity.id, "Token issued");
        Ok(token)
    }

    /// The stored identity behind validated claims
    pub async fn current_identity(&self, claims: &Claims) -> Result<Identity, GatewayError> {
        let id = claims.subject_id().ok_or(AuthError::Malformed)?;
        self.store
            .find_by_id(id)
            .await?
            .ok_or_else(|| StorageError::IdentityNotFound(id.to_string()).into())
    }

    /// Add a catalog role to an identity
    pub async fn add_role(&self, id: Uuid, role: &str) -> Result<Identity, GatewayError> {
        let identity = self.store.add_role(id, role).await?;
        info!(id = %id, role = %role, "Role added");
        Ok(identity)
    }

    /// Swap in a new route table
    pub fn reload_routes(&self, table: RouteTable) {
        self.router.reload(table);
    }

    /// Get the gateway configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get a reference to the token service
    pub fn tokens(&self) -> &TokenService {
        &self.tokens
    }

    /// Get a reference to the authorization engine
    pub fn authz(&self) -> &AuthorizationEngine {
        &self.authz
    }

    /// Get a reference to the admission controller
    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    /// Get a reference to the router
    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Get a reference to the identity store
    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::{AdmissionError, KeyBy};
    use crate::config::BootstrapUser;
    use crate::router::RoutingError;
    use crate::storage::MemoryCredentialStore;
    use async_trait::async_trait;
    use axum::body::{Body, Bytes};
    use axum::http::{HeaderMap, Method, StatusCode};
    use secrecy::SecretString;
    use std::time::Duration;
    use url::Url;

    struct OkBackend;

    #[async_trait]
    impl Backend for OkBackend {
        async fn send(
            &self,
            _target: Url,
            _request: ForwardRequest,
            _timeout: Duration,
        ) -> Result<ForwardResponse, RoutingError> {
            Ok(ForwardResponse {
                status: StatusCode::OK,
                headers: HeaderMap::new(),
                body: Body::from("ok"),
            })
        }
    }

    fn config() -> Config {
        let mut config = Config::with_secret(SecretString::from(
            "0123456789abcdef0123456789abcdef".to_string(),
        ));
        config.admission.key_by = KeyBy::Global;
        config.routes = RouteTable::new(vec![
            RouteRule::new("/api", Url::parse("http://svc").unwrap()),
            RouteRule::new("/api/admin", Url::parse("http://svc").unwrap()).with_policy("AdminOnly"),
        ])
        .unwrap();
        config
    }

    fn gateway(config: Config) -> Gateway {
        Gateway::new(
            config,
            Arc::new(MemoryCredentialStore::new()),
            Arc::new(OkBackend),
        )
    }

    fn request(path: &str) -> ForwardRequest {
        ForwardRequest {
            method: Method::GET,
            path: path.to_string(),
            query: None,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    fn bearer_for(gateway: &Gateway, roles: &[Role]) -> String {
        let mut identity = Identity::new(format!("{}@example.com", Uuid::new_v4()), "h");
        for role in roles {
            identity.grant(*role);
        }
        format!("Bearer {}", gateway.tokens().create(&identity).unwrap().token)
    }

    #[tokio::test]
    async fn test_register_login_me() {
        let gateway = gateway(config());

        let identity = gateway.register("Ada@Example.com", "Str0ng!pass").await.unwrap();
        assert!(identity.has_role(Role::User));

        let issued = gateway.login("ada@example.com", "Str0ng!pass").await.unwrap();
        let claims = gateway
            .authenticate(Some(&format!("Bearer {}", issued.token)))
            .unwrap();
        assert_eq!(claims.email, "Ada@Example.com");

        let me = gateway.current_identity(&claims).await.unwrap();
        assert_eq!(me.id, identity.id);
    }

    #[tokio::test]
    async fn test_register_validation() {
        let gateway = gateway(config());

        let err = gateway.register("not-an-email", "weak").await.unwrap_err();
        match err {
            GatewayError::Identity(problems) => assert!(problems.len() >= 4),
            other => panic!("expected Identity error, got {:?}", other),
        }

        gateway.register("ada@example.com", "Str0ng!pass").await.unwrap();
        let err = gateway.register("ADA@example.com", "Str0ng!pass").await.unwrap_err();
        assert!(matches!(err, GatewayError::Storage(StorageError::EmailTaken(_))));
    }

    #[tokio::test]
    async fn test_login_failure_is_uniform() {
        let gateway = gateway(config());
        gateway.register("ada@example.com", "Str0ng!pass").await.unwrap();

        for (email, password) in [("ada@example.com", "Wr0ng!pass"), ("bob@example.com", "Str0ng!pass")] {
            let err = gateway.login(email, password).await.unwrap_err();
            assert!(matches!(
                err,
                GatewayError::Authentication(AuthError::InvalidCredentials)
            ));
        }
    }

    #[tokio::test]
    async fn test_add_role() {
        let gateway = gateway(config());
        let identity = gateway.register("ada@example.com", "Str0ng!pass").await.unwrap();

        let updated = gateway.add_role(identity.id, "Admin").await.unwrap();
        assert!(updated.has_role(Role::Admin));

        let err = gateway.add_role(identity.id, "OWNER").await.unwrap_err();
        assert!(matches!(err, GatewayError::Storage(StorageError::UnknownRole(_))));
    }

    #[tokio::test]
    async fn test_bootstrap_identities_idempotent() {
        let mut config = config();
        config.users = vec![BootstrapUser {
            email: "root@example.com".to_string(),
            password_hash: hash_password("R00t!pass").unwrap(),
            roles: vec![Role::Admin],
        }];
        let gateway = gateway(config);

        assert_eq!(gateway.bootstrap_identities().await.unwrap(), 1);
        assert_eq!(gateway.bootstrap_identities().await.unwrap(), 0);

        let issued = gateway.login("root@example.com", "R00t!pass").await.unwrap();
        let claims = gateway.tokens().validate(&issued.token).unwrap();
        assert!(claims.has_role(Role::Admin));
    }

    #[tokio::test]
    async fn test_proxy_pipeline() {
        let gateway = gateway(config());
        let ctx = RequestContext::default();
        let user = bearer_for(&gateway, &[Role::User]);
        let admin = bearer_for(&gateway, &[Role::Admin]);

        let response = gateway.proxy(&ctx, Some(&user), request("/api/items")).await.unwrap();
        assert_eq!(response.status, StatusCode::OK);

        let err = gateway.proxy(&ctx, None, request("/api/items")).await.unwrap_err();
        assert!(matches!(
            err,
            GatewayError::Authentication(AuthError::MissingCredential)
        ));

        let err = gateway
            .proxy(&ctx, Some(&user), request("/api/admin/users"))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Authorization(_)));

        gateway
            .proxy(&ctx, Some(&admin), request("/api/admin/users"))
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unmatched_requests_are_admitted_first() {
        let mut config = config();
        config.admission.limits.permit_limit = 1;
        config.admission.limits.queue_limit = 0;
        let gateway = gateway(config);
        let ctx = RequestContext::default();

        let err = gateway.proxy(&ctx, None, request("/nowhere")).await.unwrap_err();
        assert!(matches!(
            err,
            GatewayError::Routing(RoutingError::NoMatchingRoute { .. })
        ));

        let err = gateway.proxy(&ctx, None, request("/nowhere")).await.unwrap_err();
        assert!(matches!(
            err,
            GatewayError::Admission(AdmissionError::RateLimited { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_timeout_applies() {
        let mut config = config();
        config.admission.limits.permit_limit = 1;
        config.admission.limits.queue_limit = 1;
        config.admission.queue_timeout = Some(Duration::from_secs(2));
        let gateway = gateway(config);
        let ctx = RequestContext::default();

        gateway.admit(&ctx, None).await.unwrap();
        let err = gateway.admit(&ctx, None).await.unwrap_err();
        assert!(matches!(
            err,
            GatewayError::Admission(AdmissionError::QueueOverflow { .. })
        ));
    }

    #[test]
    fn test_route_key_override() {
        let gateway = gateway(config());
        let ctx = RequestContext::default();
        let rule = RouteRule::new("/api", Url::parse("http://svc").unwrap()).with_key_by(KeyBy::Route);

        assert_eq!(gateway.admission_key(&ctx, None), "global");
        assert_eq!(gateway.admission_key(&ctx, Some(&rule)), "route:/api");
    }

    #[test]
    fn test_credential_key_uses_validated_subject() {
        let mut config = config();
        config.admission.key_by = KeyBy::Credential;
        let gateway = gateway(config);
        let ip = Some("10.0.0.7".parse().unwrap());

        let mut identity = Identity::new("ada@example.com", "h");
        identity.grant(Role::User);
        let first = gateway.tokens().create(&identity).unwrap().token;
        identity.grant(Role::Admin);
        let second = gateway.tokens().create(&identity).unwrap().token;
        assert_ne!(first, second);

        // a fresh token for the same identity shares its window
        let expected = format!("sub:{}", identity.id);
        for token in [&first, &second] {
            let header = format!("Bearer {}", token);
            let ctx = RequestContext::new(ip).with_authorization(Some(&header));
            assert_eq!(gateway.admission_key(&ctx, None), expected);
        }

        // tokens that fail validation fall back to the client address
        for junk in ["Bearer junk0", "Bearer junk1", "Basic abc"] {
            let ctx = RequestContext::new(ip).with_authorization(Some(junk));
            assert_eq!(gateway.admission_key(&ctx, None), "ip:10.0.0.7");
        }
    }

    #[tokio::test]
    async fn test_check_proxy_before_forward() {
        let gateway = gateway(config());
        let ctx = RequestContext::default();
        let admin = bearer_for(&gateway, &[Role::Admin]);

        let ticket = gateway
            .check_proxy(&ctx, Some(&admin), "/api/admin/users")
            .await
            .unwrap();
        assert_eq!(ticket.rule.path_prefix, "/api/admin");
        assert!(ticket.claims.has_role(Role::Admin));

        let response = gateway
            .forward(&ctx, &ticket, request("/api/admin/users"))
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::OK);
    }

    #[test]
    fn test_reload_routes() {
        let gateway = gateway(config());
        gateway.reload_routes(RouteTable::default());
        assert!(gateway.router().snapshot().is_empty());
    }
}
