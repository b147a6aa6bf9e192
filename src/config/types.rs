//! Raw configuration types for TOML parsing

use super::*;
use crate::admission::{KeyBy, QueueOrder};
use crate::auth::{is_valid_hash, Role};
use crate::policy::{Policy, RoleRequirement};
use crate::router::RouteRule;
use serde::Deserialize;
use url::Url;

/// Raw configuration as parsed from TOML
#[derive(Debug, Deserialize, Default)]
pub struct RawConfig {
    pub server: Option<RawServerConfig>,
    pub logging: Option<RawLoggingConfig>,
    pub token: Option<RawTokenConfig>,
    pub admission: Option<RawAdmissionConfig>,
    pub upstream: Option<RawUpstreamConfig>,
    #[serde(default)]
    pub routes: Vec<RawRoute>,
    #[serde(default)]
    pub policies: Vec<RawPolicy>,
    #[serde(default)]
    pub users: Vec<RawUser>,
}

#[derive(Debug, Deserialize, Default)]
pub struct RawServerConfig {
    pub bind: Option<String>,
}

impl From<RawServerConfig> for ServerConfig {
    fn from(raw: RawServerConfig) -> Self {
        let defaults = ServerConfig::default();
        Self {
            bind: raw.bind.unwrap_or(defaults.bind),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct RawLoggingConfig {
    pub level: Option<String>,
    pub format: Option<String>,
}

impl TryFrom<RawLoggingConfig> for LoggingConfig {
    type Error = ConfigError;

    fn try_from(raw: RawLoggingConfig) -> Result<Self, Self::Error> {
        let format = match raw.format.as_deref() {
            Some("pretty") | None => LogFormat::Pretty,
            Some("json") => LogFormat::Json,
            Some(other) => {
                return Err(ConfigError::Invalid(format!(
                    "Unknown log format: {}",
                    other
                )))
            }
        };

        Ok(Self {
            level: raw.level.unwrap_or_else(|| "info".to_string()),
            format,
        })
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct RawTokenConfig {
    pub secret_env: Option<String>,
    pub issuer: Option<String>,
    pub audience: Option<String>,
    pub lifetime_secs: Option<u64>,
}

impl RawTokenConfig {
    /// Resolve the secret and env overrides into a validated token config
    pub fn resolve(self, env: &dyn Fn(&str) -> Option<String>) -> Result<TokenConfig, ConfigError> {
        let secret_env = self
            .secret_env
            .unwrap_or_else(|| DEFAULT_SECRET_ENV.to_string());

        let secret = env(&secret_env)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ConfigError::MissingEnv(secret_env.clone()))?;
        if secret.len() < MIN_SECRET_BYTES {
            return Err(ConfigError::WeakSecret {
                var: secret_env,
                min: MIN_SECRET_BYTES,
            });
        }

        let issuer = env(ISSUER_ENV)
            .or(self.issuer)
            .unwrap_or_else(|| DEFAULT_ISSUER.to_string());
        let audience = env(AUDIENCE_ENV)
            .or(self.audience)
            .unwrap_or_else(|| DEFAULT_AUDIENCE.to_string());

        let lifetime_secs = self.lifetime_secs.unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS);
        if lifetime_secs == 0 || lifetime_secs > MAX_TOKEN_LIFETIME_SECS {
            return Err(ConfigError::Invalid(format!(
                "token.lifetime_secs must be between 1 and {}",
                MAX_TOKEN_LIFETIME_SECS
            )));
        }

        Ok(TokenConfig {
            secret: SecretString::from(secret),
            secret_env,
            issuer,
            audience,
            lifetime: Duration::from_secs(lifetime_secs),
        })
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct RawAdmissionConfig {
    pub permit_limit: Option<u32>,
    pub window_secs: Option<u64>,
    pub queue_limit: Option<usize>,
    pub queue_order: Option<String>,
    pub key_by: Option<String>,
    pub queue_timeout_ms: Option<u64>,
    pub sweep_interval_secs: Option<u64>,
}

impl TryFrom<RawAdmissionConfig> for AdmissionConfig {
    type Error = ConfigError;

    fn try_from(raw: RawAdmissionConfig) -> Result<Self, Self::Error> {
        let defaults = AdmissionConfig::default();

        let permit_limit = raw.permit_limit.unwrap_or(defaults.limits.permit_limit);
        if permit_limit == 0 {
            return Err(ConfigError::Invalid(
                "admission.permit_limit must be at least 1".to_string(),
            ));
        }

        let window = match raw.window_secs {
            Some(0) => {
                return Err(ConfigError::Invalid(
                    "admission.window_secs must be at least 1".to_string(),
                ))
            }
            Some(secs) => Duration::from_secs(secs),
            None => defaults.limits.window,
        };

        let queue_order = match raw.queue_order.as_deref() {
            Some("oldest_first") | None => QueueOrder::OldestFirst,
            Some(other) => {
                return Err(ConfigError::Invalid(format!(
                    "Unsupported queue order: {}",
                    other
                )))
            }
        };

        let key_by = match raw.key_by.as_deref() {
            Some(name) => parse_key_by(name)?,
            None => defaults.key_by,
        };

        Ok(Self {
            limits: AdmissionLimits {
                permit_limit,
                window,
                queue_limit: raw.queue_limit.unwrap_or(defaults.limits.queue_limit),
                queue_order,
            },
            key_by,
            queue_timeout: raw.queue_timeout_ms.map(Duration::from_millis),
            sweep_interval: raw
                .sweep_interval_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.sweep_interval),
        })
    }
}

fn parse_key_by(name: &str) -> Result<KeyBy, ConfigError> {
    match name {
        "global" => Ok(KeyBy::Global),
        "ip" => Ok(KeyBy::Ip),
        "credential" => Ok(KeyBy::Credential),
        "route" => Ok(KeyBy::Route),
        other => Err(ConfigError::Invalid(format!(
            "Unknown admission key: {}",
            other
        ))),
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct RawUpstreamConfig {
    pub timeout_ms: Option<u64>,
    pub max_body_bytes: Option<usize>,
}

impl From<RawUpstreamConfig> for UpstreamConfig {
    fn from(raw: RawUpstreamConfig) -> Self {
        let defaults = UpstreamConfig::default();
        Self {
            timeout: raw
                .timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.timeout),
            max_body_bytes: raw.max_body_bytes.unwrap_or(defaults.max_body_bytes),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RawRoute {
    pub path: String,
    pub backend: String,
    pub policy: Option<String>,
    pub strip_prefix: Option<bool>,
    pub key_by: Option<String>,
}

impl TryFrom<RawRoute> for RouteRule {
    type Error = ConfigError;

    fn try_from(raw: RawRoute) -> Result<Self, Self::Error> {
        let backend = Url::parse(&raw.backend).map_err(|e| {
            ConfigError::Invalid(format!("Invalid backend for '{}': {}", raw.path, e))
        })?;

        let mut rule =
            RouteRule::new(&raw.path, backend).with_strip_prefix(raw.strip_prefix.unwrap_or(false));
        if let Some(policy) = raw.policy {
            rule = rule.with_policy(policy);
        }
        if let Some(key_by) = raw.key_by.as_deref() {
            rule = rule.with_key_by(parse_key_by(key_by)?);
        }
        Ok(rule)
    }
}

#[derive(Debug, Deserialize)]
pub struct RawPolicy {
    pub name: String,
    pub require: RawRequirement,
    pub description: Option<String>,
}

impl TryFrom<RawPolicy> for Policy {
    type Error = ConfigError;

    fn try_from(raw: RawPolicy) -> Result<Self, Self::Error> {
        let requirement = raw.require.try_into()?;
        let policy = Policy::new(raw.name, requirement);
        Ok(match raw.description {
            Some(description) => policy.with_description(description),
            None => policy,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum RawRequirement {
    Named(String),
    Role { role: String },
    AnyOf { any_of: Vec<String> },
    AllOf { all_of: Vec<String> },
}

impl TryFrom<RawRequirement> for RoleRequirement {
    type Error = ConfigError;

    fn try_from(raw: RawRequirement) -> Result<Self, Self::Error> {
        match raw {
            RawRequirement::Named(name) if name == "authenticated" => {
                Ok(RoleRequirement::Authenticated)
            }
            RawRequirement::Named(other) => Err(ConfigError::Invalid(format!(
                "Unknown policy requirement: {}",
                other
            ))),
            RawRequirement::Role { role } => Ok(RoleRequirement::Role(parse_role(&role)?)),
            RawRequirement::AnyOf { any_of } => Ok(RoleRequirement::AnyOf(parse_roles(&any_of)?)),
            RawRequirement::AllOf { all_of } => Ok(RoleRequirement::AllOf(parse_roles(&all_of)?)),
        }
    }
}

fn parse_role(name: &str) -> Result<Role, ConfigError> {
    name.parse()
        .map_err(|e: crate::auth::UnknownRole| ConfigError::Invalid(e.to_string()))
}

fn parse_roles(names: &[String]) -> Result<Vec<Role>, ConfigError> {
    names.iter().map(|n| parse_role(n)).collect()
}

#[derive(Debug, Deserialize)]
pub struct RawUser {
    pub email: String,
    pub password_hash: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

impl TryFrom<RawUser> for BootstrapUser {
    type Error = ConfigError;

    fn try_from(raw: RawUser) -> Result<Self, Self::Error> {
        if !is_valid_hash(&raw.password_hash) {
            return Err(ConfigError::Invalid(format!(
                "Bootstrap user '{}' has an invalid password hash",
                raw.email
            )));
        }

        Ok(Self {
            email: raw.email,
            password_hash: raw.password_hash,
            roles: parse_roles(&raw.roles)?,
        })
    }
}
