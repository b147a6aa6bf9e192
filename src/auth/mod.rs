//! Authentication for Portcullis
//!
//! Provides:
//! - The closed role catalog and identity types
//! - Signed bearer tokens (issue and validate)
//! - Bearer credential extraction
//! - Password hashing and registration input rules

mod middleware;
mod password;
mod token;
mod types;

pub use middleware::{authenticate, extract_bearer_token};
pub use password::{
    check_email, check_password_rules, hash_password, is_valid_hash, verify_password,
    PasswordError,
};
pub use token::{AuthError, IssuedToken, TokenError, TokenService};
pub use types::{normalize_email, Claims, Identity, Role, UnknownRole};
