//! Authorization engine for Portcullis
//!
//! Evaluates named role-based policies against validated token claims.
//! Policies are data registered once at startup; evaluation takes no locks.

mod types;

pub use types::*;

use crate::auth::Claims;
use std::collections::HashMap;
use thiserror::Error;

/// Authorization failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthorizationError {
    #[error("Denied by policy '{policy}': {reason}")]
    PolicyDenied { policy: String, reason: String },
}

/// Policy evaluation result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    /// Request is allowed
    Allow,
    /// Request is denied with reason
    Deny(String),
}

impl PolicyDecision {
    /// Convert into a result, attributing a denial to `policy`
    pub fn into_result(self, policy: &str) -> Result<(), AuthorizationError> {
        match self {
            PolicyDecision::Allow => Ok(()),
            PolicyDecision::Deny(reason) => Err(AuthorizationError::PolicyDenied {
                policy: policy.to_string(),
                reason,
            }),
        }
    }
}

/// Evaluates access decisions against registered policies
#[derive(Debug, Clone)]
pub struct AuthorizationEngine {
    policies: HashMap<String, Policy>,
}

impl AuthorizationEngine {
    /// Create an engine holding the built-in policies
    pub fn new() -> Self {
        let mut engine = Self {
            policies: HashMap::new(),
        };
        engine.load_policies(builtin_policies());
        engine
    }

    /// Register policies, replacing any with the same name
    pub fn load_policies(&mut self, policies: Vec<Policy>) {
        for policy in policies {
            self.policies.insert(policy.name.clone(), policy);
        }
    }

    /// Builder-style registration
    pub fn with_policies(mut self, policies: Vec<Policy>) -> Self {
        self.load_policies(policies);
        self
    }

    /// Check whether a policy is registered
    pub fn contains(&self, name: &str) -> bool {
        self.policies.contains_key(name)
    }

    /// Look up a policy by name
    pub fn get(&self, name: &str) -> Option<&Policy> {
        self.policies.get(name)
    }

    /// List all policies, sorted by name
    pub fn list_policies(&self) -> Vec<&Policy> {
        let mut policies: Vec<_> = self.policies.values().collect();
        policies.sort_by(|a, b| a.name.cmp(&b.name));
        policies
    }

    /// Evaluate claims against a named policy
    ///
    /// An unknown policy name denies.
    pub fn evaluate(&self, claims: &Claims, policy_name: &str) -> PolicyDecision {
        let Some(policy) = self.policies.get(policy_name) else {
            tracing::warn!(policy = %policy_name, "Unknown policy referenced; denying");
            return PolicyDecision::Deny(format!("unknown policy '{}'", policy_name));
        };

        if policy.requirement.is_satisfied_by(&claims.roles()) {
            PolicyDecision::Allow
        } else {
            PolicyDecision::Deny(format!(
                "caller lacks the roles required by '{}'",
                policy.name
            ))
        }
    }

    /// Evaluate and convert a denial into an error
    pub fn authorize(&self, claims: &Claims, policy_name: &str) -> Result<(), AuthorizationError> {
        self.evaluate(claims, policy_name).into_result(policy_name)
    }
}

impl Default for AuthorizationEngine {
    fn default() -> Self {
        Self::new()
    }
}
