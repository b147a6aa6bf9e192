//! Bearer credential extraction and validation
//!
//! Provides functions for:
//! - Extracting the bearer token from an Authorization header
//! - Validating it into claims

use super::token::{AuthError, TokenService};
use super::types::Claims;

/// Extract the bearer token from an Authorization header
///
/// Expected format: `Authorization: Bearer <token>`
pub fn extract_bearer_token(auth_header: Option<&str>) -> Result<&str, AuthError> {
    let header = auth_header.ok_or(AuthError::MissingCredential)?;

    let (scheme, token) = header
        .trim()
        .split_once(' ')
        .ok_or(AuthError::InvalidScheme)?;

    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AuthError::InvalidScheme);
    }

    Ok(token.trim())
}

/// Full authentication flow: extract the token from the header and validate it
pub fn authenticate(tokens: &TokenService, auth_header: Option<&str>) -> Result<Claims, AuthError> {
    let token = extract_bearer_token(auth_header)?;
    tokens.validate(token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Identity, Role};
    use crate::config::TokenConfig;
    use secrecy::SecretString;
    use std::time::Duration;

    fn tokens() -> TokenService {
        TokenService::new(&TokenConfig {
            secret: SecretString::from("0123456789abcdef0123456789abcdef".to_string()),
            secret_env: "JWT_SECRET_KEY".to_string(),
            issuer: "portcullis".to_string(),
            audience: "portcullis-clients".to_string(),
            lifetime: Duration::from_secs(60),
        })
    }

    #[test]
    fn test_extract_bearer_valid() {
        assert_eq!(extract_bearer_token(Some("Bearer abc.def.ghi")), Ok("abc.def.ghi"));
    }

    #[test]
    fn test_extract_bearer_case_insensitive() {
        assert_eq!(extract_bearer_token(Some("bearer abc")), Ok("abc"));
        assert_eq!(extract_bearer_token(Some("BEARER abc")), Ok("abc"));
    }

    #[test]
    fn test_extract_bearer_missing() {
        assert_eq!(extract_bearer_token(None), Err(AuthError::MissingCredential));
    }

    #[test]
    fn test_extract_bearer_wrong_scheme() {
        assert_eq!(
            extract_bearer_token(Some("Basic dXNlcjpwYXNz")),
            Err(AuthError::InvalidScheme)
        );
        assert_eq!(extract_bearer_token(Some("abc")), Err(AuthError::InvalidScheme));
    }

    #[test]
    fn test_extract_bearer_empty_token() {
        assert_eq!(extract_bearer_token(Some("Bearer   ")), Err(AuthError::InvalidScheme));
        assert_eq!(extract_bearer_token(Some("Bearer")), Err(AuthError::InvalidScheme));
    }

    #[test]
    fn test_authenticate() {
        let tokens = tokens();
        let mut identity = Identity::new("ada@example.com", "hash");
        identity.grant(Role::User);
        let issued = tokens.create(&identity).unwrap();

        let header = format!("Bearer {}", issued.token);
        let claims = authenticate(&tokens, Some(&header)).unwrap();
        assert_eq!(claims.email, "ada@example.com");

        assert_eq!(
            authenticate(&tokens, Some("Bearer garbage")),
            Err(AuthError::Malformed)
        );
    }
}
