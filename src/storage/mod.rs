//! Identity storage for Portcullis
//!
//! Defines the credential store port and ships an in-memory implementation.

mod memory;

pub use memory::MemoryCredentialStore;

use crate::auth::Identity;
use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

/// Storage-related errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Email already registered: {0}")]
    EmailTaken(String),

    #[error("Identity not found: {0}")]
    IdentityNotFound(String),

    #[error("Unknown role: {0}")]
    UnknownRole(String),

    #[error("Password hash error: {0}")]
    Hashing(#[from] crate::auth::PasswordError),

    #[error("Storage backend unavailable: {0}")]
    Unavailable(String),
}

/// Persistence port for identities and their role assignments
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Store a new identity; fails with `EmailTaken` if the email is in use
    async fn create(&self, identity: &Identity) -> Result<(), StorageError>;

    /// Look up an identity by email (case-insensitive)
    async fn find_by_email(&self, email: &str) -> Result<Option<Identity>, StorageError>;

    /// Look up an identity by ID
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Identity>, StorageError>;

    /// Return the identity if `password` matches its stored hash
    async fn check_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Option<Identity>, StorageError>;

    /// Add a catalog role to an identity, returning the updated identity
    async fn add_role(&self, id: Uuid, role: &str) -> Result<Identity, StorageError>;

    /// Check if the store is available and healthy
    async fn health_check(&self) -> Result<(), StorageError>;
}
