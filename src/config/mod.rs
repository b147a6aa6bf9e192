//! Configuration system for Portcullis
//!
//! Loads configuration from TOML files and environment variables. The token
//! secret only ever comes from the environment.

mod types;

pub use types::*;

use crate::admission::{AdmissionLimits, KeyBy};
use crate::auth::Role;
use crate::policy::{AuthorizationEngine, Policy};
use crate::router::{RouteRule, RouteTable};
use secrecy::SecretString;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::fs;

/// Environment variable holding the token secret unless overridden
pub const DEFAULT_SECRET_ENV: &str = "JWT_SECRET_KEY";
/// Environment variable overriding the token issuer
pub const ISSUER_ENV: &str = "JWT_ISSUER";
/// Environment variable overriding the token audience
pub const AUDIENCE_ENV: &str = "JWT_AUDIENCE";

const DEFAULT_ISSUER: &str = "portcullis";
const DEFAULT_AUDIENCE: &str = "portcullis-clients";
const DEFAULT_TOKEN_LIFETIME_SECS: u64 = 3600;
const MAX_TOKEN_LIFETIME_SECS: u64 = 366 * 24 * 3600;
/// Minimum HS256 secret length
const MIN_SECRET_BYTES: usize = 32;

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to read configuration: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Environment variable {0} is not set")]
    MissingEnv(String),

    #[error("Secret in {var} must be at least {min} bytes")]
    WeakSecret { var: String, min: usize },
}

/// Main Portcullis configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Listener configuration
    pub server: ServerConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Token signing and validation
    pub token: TokenConfig,
    /// Rate limiting and queueing
    pub admission: AdmissionConfig,
    /// Backend forwarding
    pub upstream: UpstreamConfig,
    /// Validated route table
    pub routes: RouteTable,
    /// Policies beyond the built-in ones
    pub policies: Vec<Policy>,
    /// Identities created at startup
    pub users: Vec<BootstrapUser>,
}

impl Config {
    /// Load configuration from a file, reading secrets from the process environment
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path).await?;
        Self::parse(&content)
    }

    /// Load configuration from a string, reading secrets from the process environment
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Self::parse_with_env(content, &|name| std::env::var(name).ok())
    }

    /// Load configuration from a string with an explicit environment lookup
    pub fn parse_with_env(
        content: &str,
        env: &dyn Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let raw: RawConfig =
            toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        Self::from_raw(raw, env)
    }

    /// Convert from raw TOML config to validated config
    fn from_raw(raw: RawConfig, env: &dyn Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let server = raw.server.unwrap_or_default().into();
        let logging = raw.logging.unwrap_or_default().try_into()?;
        let token = raw.token.unwrap_or_default().resolve(env)?;
        let admission = raw.admission.unwrap_or_default().try_into()?;
        let upstream = raw.upstream.unwrap_or_default().into();

        let policies = raw
            .policies
            .into_iter()
            .map(|p| p.try_into())
            .collect::<Result<Vec<Policy>, _>>()?;

        let rules = raw
            .routes
            .into_iter()
            .map(|r| r.try_into())
            .collect::<Result<Vec<RouteRule>, _>>()?;
        let routes = Self::validate_routes(rules, &policies)?;

        let users = raw
            .users
            .into_iter()
            .map(|u| u.try_into())
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            server,
            logging,
            token,
            admission,
            upstream,
            routes,
            policies,
            users,
        })
    }

    /// Build the route table, rejecting routes that name unknown policies
    pub fn validate_routes(
        rules: Vec<RouteRule>,
        policies: &[Policy],
    ) -> Result<RouteTable, ConfigError> {
        let engine = AuthorizationEngine::new().with_policies(policies.to_vec());
        for rule in &rules {
            if let Some(policy) = &rule.policy {
                if !engine.contains(policy) {
                    return Err(ConfigError::Invalid(format!(
                        "Route '{}' references unknown policy '{}'",
                        rule.path_prefix, policy
                    )));
                }
            }
        }

        RouteTable::new(rules).map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    /// Configuration with defaults everywhere except the token secret
    pub fn with_secret(secret: SecretString) -> Self {
        Self {
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
            token: TokenConfig {
                secret,
                secret_env: DEFAULT_SECRET_ENV.to_string(),
                issuer: DEFAULT_ISSUER.to_string(),
                audience: DEFAULT_AUDIENCE.to_string(),
                lifetime: Duration::from_secs(DEFAULT_TOKEN_LIFETIME_SECS),
            },
            admission: AdmissionConfig::default(),
            upstream: UpstreamConfig::default(),
            routes: RouteTable::default(),
            policies: vec![],
            users: vec![],
        }
    }

    /// Get the default config file path
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("portcullis")
            .join("config.toml")
    }
}

/// Listener configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Log level or filter directive
    pub level: String,
    /// Format: "json" or "pretty"
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable format
    Pretty,
    /// JSON format
    Json,
}

/// Token signing configuration
#[derive(Debug, Clone)]
pub struct TokenConfig {
    /// Shared HS256 secret
    pub secret: SecretString,
    /// Variable the secret was read from
    pub secret_env: String,
    pub issuer: String,
    pub audience: String,
    /// How long issued tokens stay valid
    pub lifetime: Duration,
}

/// Admission control configuration
#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    pub limits: AdmissionLimits,
    /// Default limiter key; routes may override it
    pub key_by: KeyBy,
    /// How long a caller may stay queued before giving up
    pub queue_timeout: Option<Duration>,
    /// How often idle windows are evicted
    pub sweep_interval: Duration,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            limits: AdmissionLimits::default(),
            key_by: KeyBy::default(),
            queue_timeout: None,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Backend forwarding configuration
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// Per-request deadline for a backend response
    pub timeout: Duration,
    /// Largest request body the gateway buffers
    pub max_body_bytes: usize,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_body_bytes: 10 * 1024 * 1024,
        }
    }
}

/// An identity seeded at startup
#[derive(Debug, Clone)]
pub struct BootstrapUser {
    pub email: String,
    /// Argon2 PHC string
    pub password_hash: String,
    pub roles: Vec<Role>,
}
