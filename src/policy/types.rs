//! Policy data structures

use crate::auth::Role;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Name of the built-in policy requiring the ADMIN role
pub const POLICY_ADMIN_ONLY: &str = "AdminOnly";
/// Name of the built-in policy requiring the USER role
pub const POLICY_USER_ONLY: &str = "UserOnly";
/// Name of the built-in policy satisfied by any valid token
pub const POLICY_AUTHENTICATED: &str = "Authenticated";

/// A named authorization policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    /// Name routes refer to
    pub name: String,
    /// Predicate over the caller's role set
    pub requirement: RoleRequirement,
    /// Human-readable description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Predicates over a role set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoleRequirement {
    /// Any validated caller
    Authenticated,

    /// Caller must hold this role
    Role(Role),

    /// Caller must hold at least one of these roles
    AnyOf(Vec<Role>),

    /// Caller must hold every one of these roles
    AllOf(Vec<Role>),
}

impl RoleRequirement {
    /// Evaluate the predicate
    pub fn is_satisfied_by(&self, roles: &HashSet<Role>) -> bool {
        match self {
            RoleRequirement::Authenticated => true,
            RoleRequirement::Role(role) => roles.contains(role),
            RoleRequirement::AnyOf(required) => required.iter().any(|r| roles.contains(r)),
            RoleRequirement::AllOf(required) => required.iter().all(|r| roles.contains(r)),
        }
    }
}

impl Policy {
    /// Create a policy
    pub fn new(name: impl Into<String>, requirement: RoleRequirement) -> Self {
        Self {
            name: name.into(),
            requirement,
            description: None,
        }
    }

    /// Add a description to the policy
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Policy requiring a single role
    pub fn require_role(name: impl Into<String>, role: Role) -> Self {
        Self::new(name, RoleRequirement::Role(role))
    }
}

/// `AdminOnly`: claims must contain ADMIN
pub fn admin_only() -> Policy {
    Policy::require_role(POLICY_ADMIN_ONLY, Role::Admin)
        .with_description("Administrators only")
}

/// `UserOnly`: claims must contain USER
pub fn user_only() -> Policy {
    Policy::require_role(POLICY_USER_ONLY, Role::User)
        .with_description("Registered users")
}

/// `Authenticated`: any valid token
pub fn authenticated() -> Policy {
    Policy::new(POLICY_AUTHENTICATED, RoleRequirement::Authenticated)
        .with_description("Any authenticated caller")
}

/// The policies every engine starts with
pub fn builtin_policies() -> Vec<Policy> {
    vec![admin_only(), user_only(), authenticated()]
}
