//! Path-prefix route matching

use super::RoutingError;
use crate::admission::KeyBy;
use std::collections::HashSet;
use thiserror::Error;
use url::Url;

/// Problems building a route table
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RouteTableError {
    #[error("Duplicate route prefix: {0}")]
    DuplicatePrefix(String),

    #[error("Route prefix must start with '/': {0}")]
    InvalidPrefix(String),

    #[error("Backend for '{prefix}' must be an http(s) URL: {backend}")]
    InvalidBackend { prefix: String, backend: String },
}

/// A single routing rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteRule {
    /// Normalized prefix (leading '/', no trailing '/' except for the root)
    pub path_prefix: String,
    /// Base URI of the backend
    pub backend: Url,
    /// Policy a caller must satisfy, if any
    pub policy: Option<String>,
    /// Remove the prefix before forwarding
    pub strip_prefix: bool,
    /// Limiter key override for this route
    pub key_by: Option<KeyBy>,
}

impl RouteRule {
    pub fn new(path_prefix: &str, backend: Url) -> Self {
        Self {
            path_prefix: normalize_prefix(path_prefix),
            backend,
            policy: None,
            strip_prefix: false,
            key_by: None,
        }
    }

    pub fn with_policy(mut self, policy: impl Into<String>) -> Self {
        self.policy = Some(policy.into());
        self
    }

    pub fn with_strip_prefix(mut self, strip: bool) -> Self {
        self.strip_prefix = strip;
        self
    }

    pub fn with_key_by(mut self, key_by: KeyBy) -> Self {
        self.key_by = Some(key_by);
        self
    }

    /// The prefix without its trailing slash; empty for the root route
    fn bare_prefix(&self) -> &str {
        self.path_prefix.trim_end_matches('/')
    }

    /// Segment-aware prefix test: `/api` matches `/api` and `/api/x`, not `/apix`
    pub fn matches(&self, path: &str) -> bool {
        match path.strip_prefix(self.bare_prefix()) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }

    /// Backend URL for a request path and query
    pub fn target_url(&self, path: &str, query: Option<&str>) -> Url {
        let forwarded = if self.strip_prefix {
            match path.strip_prefix(self.bare_prefix()) {
                Some("") => "/",
                Some(rest) => rest,
                None => path,
            }
        } else {
            path
        };

        let mut url = self.backend.clone();
        let base = url.path().trim_end_matches('/').to_string();
        url.set_path(&format!("{}{}", base, forwarded));
        url.set_query(query);
        url
    }
}

fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Immutable set of routes, ordered longest prefix first
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    rules: Vec<RouteRule>,
}

impl RouteTable {
    /// Build a table, rejecting duplicate or malformed prefixes
    pub fn new(mut rules: Vec<RouteRule>) -> Result<Self, RouteTableError> {
        let mut seen = HashSet::new();
        for rule in &rules {
            if !rule.path_prefix.starts_with('/') {
                return Err(RouteTableError::InvalidPrefix(rule.path_prefix.clone()));
            }
            if !matches!(rule.backend.scheme(), "http" | "https") {
                return Err(RouteTableError::InvalidBackend {
                    prefix: rule.path_prefix.clone(),
                    backend: rule.backend.to_string(),
                });
            }
            if !seen.insert(rule.path_prefix.clone()) {
                return Err(RouteTableError::DuplicatePrefix(rule.path_prefix.clone()));
            }
        }

        rules.sort_by(|a, b| b.bare_prefix().len().cmp(&a.bare_prefix().len()));
        Ok(Self { rules })
    }

    /// Longest-prefix match
    pub fn match_path(&self, path: &str) -> Result<&RouteRule, RoutingError> {
        self.rules
            .iter()
            .find(|rule| rule.matches(path))
            .ok_or_else(|| RoutingError::NoMatchingRoute {
                path: path.to_string(),
            })
    }

    pub fn rules(&self) -> &[RouteRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
