//! Identity and role types for Portcullis RBAC
//!
//! Provides:
//! - Role enum, the closed process-wide role catalog
//! - Identity struct for registered principals
//! - Claims carried by bearer tokens

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Returned when a role name is not part of the catalog
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown role: {0}")]
pub struct UnknownRole(pub String);

/// Roles an identity can hold
///
/// The catalog is closed: an identity can never hold a role that is not
/// listed here. Names are matched case-insensitively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Role {
    /// Regular registered user
    User,
    /// Administrator
    Admin,
}

impl Role {
    /// Every role in the catalog
    pub fn all() -> HashSet<Role> {
        [Role::User, Role::Admin].into_iter().collect()
    }

    /// Canonical (upper-case) name of the role
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "USER",
            Role::Admin => "ADMIN",
        }
    }

    /// Parse multiple roles from a comma-separated string
    pub fn parse_many(s: &str) -> Result<BTreeSet<Role>, UnknownRole> {
        s.split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(Role::from_str)
            .collect()
    }
}

impl FromStr for Role {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "USER" => Ok(Role::User),
            "ADMIN" => Ok(Role::Admin),
            _ => Err(UnknownRole(s.to_string())),
        }
    }
}

impl TryFrom<String> for Role {
    type Error = UnknownRole;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Role> for String {
    fn from(role: Role) -> Self {
        role.as_str().to_string()
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A registered principal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    /// Opaque unique identifier
    pub id: Uuid,
    /// Email address, unique across identities (case-insensitive)
    pub email: String,
    /// Argon2 PHC string
    #[serde(skip_serializing)]
    pub password_hash: String,
    roles: BTreeSet<Role>,
}

impl Identity {
    /// Create an identity with a fresh ID and no roles
    pub fn new(email: impl Into<String>, password_hash: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            email: email.into(),
            password_hash: password_hash.into(),
            roles: BTreeSet::new(),
        }
    }

    /// Roles held by this identity
    pub fn roles(&self) -> &BTreeSet<Role> {
        &self.roles
    }

    /// Check whether this identity holds a role
    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }

    /// Add a role by name, rejecting names outside the catalog
    pub fn add_role(&mut self, name: &str) -> Result<Role, UnknownRole> {
        let role = name.parse::<Role>()?;
        self.roles.insert(role);
        Ok(role)
    }

    /// Add an already-validated role
    pub fn grant(&mut self, role: Role) {
        self.roles.insert(role);
    }

    /// Normalized form of the email used for uniqueness checks
    pub fn email_key(&self) -> String {
        normalize_email(&self.email)
    }
}

/// Normalize an email address for case-insensitive comparison
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Claims carried by a bearer token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Identity ID
    pub sub: String,
    /// Identity email
    pub email: String,
    /// Role names; a single role may arrive as a plain string
    #[serde(default, deserialize_with = "one_or_many")]
    pub role: Vec<Role>,
    /// Issuer
    pub iss: String,
    /// Audience
    pub aud: String,
    /// Issued at (unix seconds)
    pub iat: i64,
    /// Expires at (unix seconds)
    pub exp: i64,
}

impl Claims {
    /// Role set carried by the token
    pub fn roles(&self) -> HashSet<Role> {
        self.role.iter().copied().collect()
    }

    /// Check if the claims carry a role
    pub fn has_role(&self, role: Role) -> bool {
        self.role.contains(&role)
    }

    /// Subject parsed as an identity ID
    pub fn subject_id(&self) -> Option<Uuid> {
        Uuid::parse_str(&self.sub).ok()
    }
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<Role>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(Role),
        Many(Vec<Role>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(role) => vec![role],
        OneOrMany::Many(roles) => roles,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_parsing() {
        assert_eq!("USER".parse::<Role>(), Ok(Role::User));
        assert_eq!("admin".parse::<Role>(), Ok(Role::Admin));
        assert_eq!(" Admin ".parse::<Role>(), Ok(Role::Admin));
        assert_eq!(
            "superuser".parse::<Role>(),
            Err(UnknownRole("superuser".to_string()))
        );
    }

    #[test]
    fn test_role_parse_many() {
        let roles = Role::parse_many("user, ADMIN").unwrap();
        assert!(roles.contains(&Role::User));
        assert!(roles.contains(&Role::Admin));

        assert!(Role::parse_many("user,root").is_err());
        assert!(Role::parse_many("").unwrap().is_empty());
    }

    #[test]
    fn test_identity_add_role_rejects_unknown() {
        let mut identity = Identity::new("a@example.com", "hash");
        assert_eq!(identity.add_role("user"), Ok(Role::User));
        assert!(identity.add_role("owner").is_err());

        assert!(identity.has_role(Role::User));
        assert_eq!(identity.roles().len(), 1);
    }

    #[test]
    fn test_add_role_is_idempotent() {
        let mut identity = Identity::new("a@example.com", "hash");
        identity.add_role("ADMIN").unwrap();
        identity.add_role("admin").unwrap();
        assert_eq!(identity.roles().len(), 1);
    }

    #[test]
    fn test_identity_serialization_hides_hash() {
        let identity = Identity::new("a@example.com", "$argon2id$secret");
        let json = serde_json::to_string(&identity).unwrap();
        assert!(!json.contains("argon2"));
        assert!(json.contains("a@example.com"));
    }

    #[test]
    fn test_claims_accept_single_role_string() {
        let json = r#"{"sub":"s","email":"e","role":"ADMIN","iss":"i","aud":"a","iat":1,"exp":2}"#;
        let claims: Claims = serde_json::from_str(json).unwrap();
        assert_eq!(claims.role, vec![Role::Admin]);

        let json = r#"{"sub":"s","email":"e","role":["USER","admin"],"iss":"i","aud":"a","iat":1,"exp":2}"#;
        let claims: Claims = serde_json::from_str(json).unwrap();
        assert!(claims.has_role(Role::User));
        assert!(claims.has_role(Role::Admin));
    }

    #[test]
    fn test_claims_reject_unknown_role() {
        let json = r#"{"sub":"s","email":"e","role":["ROOT"],"iss":"i","aud":"a","iat":1,"exp":2}"#;
        assert!(serde_json::from_str::<Claims>(json).is_err());
    }
}
