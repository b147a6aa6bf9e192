//! Signed bearer tokens
//!
//! Tokens are HS256 JWTs carrying the identity ID, email and roles. They are
//! never stored server-side: validation only needs the shared secret.

use super::types::{Claims, Identity};
use crate::config::TokenConfig;
use chrono::Utc;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use secrecy::ExposeSecret;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Token validation failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Missing authentication: Authorization header required")]
    MissingCredential,

    #[error("Invalid authentication scheme: expected 'Bearer'")]
    InvalidScheme,

    #[error("Token expired")]
    Expired,

    #[error("Token signature is invalid")]
    BadSignature,

    #[error("Token issuer is not trusted")]
    BadIssuer,

    #[error("Token audience does not match")]
    BadAudience,

    #[error("Token is malformed")]
    Malformed,

    #[error("Incorrect email or password")]
    InvalidCredentials,
}

impl From<jsonwebtoken::errors::Error> for AuthError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        match err.kind() {
            ErrorKind::ExpiredSignature => AuthError::Expired,
            ErrorKind::InvalidSignature => AuthError::BadSignature,
            ErrorKind::InvalidIssuer => AuthError::BadIssuer,
            ErrorKind::InvalidAudience => AuthError::BadAudience,
            _ => AuthError::Malformed,
        }
    }
}

/// Token issuing failures
#[derive(Error, Debug)]
pub enum TokenError {
    #[error("Failed to sign token: {0}")]
    Signing(#[from] jsonwebtoken::errors::Error),

    #[error("Token lifetime of {0}s is out of range")]
    LifetimeOutOfRange(u64),
}

/// A freshly issued token
#[derive(Debug, Clone, Serialize)]
pub struct IssuedToken {
    /// Encoded JWT
    pub token: String,
    /// Always "Bearer"
    pub token_type: &'static str,
    /// Seconds until expiry
    pub expires_in: u64,
}

/// Issues and validates bearer tokens
pub struct TokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    issuer: String,
    audience: String,
    lifetime: Duration,
}

impl TokenService {
    /// Create a token service from configuration
    pub fn new(config: &TokenConfig) -> Self {
        let secret = config.secret.expose_secret().as_bytes();
        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            issuer: config.issuer.clone(),
            audience: config.audience.clone(),
            lifetime: config.lifetime,
        }
    }

    /// Issue a token for an identity
    pub fn create(&self, identity: &Identity) -> Result<IssuedToken, TokenError> {
        let now = Utc::now().timestamp();
        let lifetime = self.lifetime.as_secs();
        let exp = i64::try_from(lifetime)
            .ok()
            .and_then(|secs| now.checked_add(secs))
            .ok_or(TokenError::LifetimeOutOfRange(lifetime))?;

        let claims = Claims {
            sub: identity.id.to_string(),
            email: identity.email.clone(),
            role: identity.roles().iter().copied().collect(),
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            iat: now,
            exp,
        };

        let token = self.sign(&claims)?;
        Ok(IssuedToken {
            token,
            token_type: "Bearer",
            expires_in: lifetime,
        })
    }

    /// Sign arbitrary claims with the configured secret
    pub fn sign(&self, claims: &Claims) -> Result<String, TokenError> {
        Ok(jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            claims,
            &self.encoding_key,
        )?)
    }

    /// Validate a token and return its claims
    ///
    /// Signature is checked first, then expiry, then issuer and audience.
    /// A token is valid only while `now < exp`; no leeway is applied.
    pub fn validate(&self, token: &str) -> Result<Claims, AuthError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.set_required_spec_claims(&["exp", "iss", "aud", "sub"]);

        let claims = jsonwebtoken::decode::<Claims>(token, &self.decoding_key, &validation)?.claims;

        if claims.exp <= Utc::now().timestamp() {
            return Err(AuthError::Expired);
        }
        if claims.iss != self.issuer {
            return Err(AuthError::BadIssuer);
        }
        if claims.aud != self.audience {
            return Err(AuthError::BadAudience);
        }
        Ok(claims)
    }

    /// Configured issuer
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Configured audience
    pub fn audience(&self) -> &str {
        &self.audience
    }

    /// Configured token lifetime
    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }
}
