//! In-memory credential store

use super::{CredentialStore, StorageError};
use crate::auth::{normalize_email, verify_password, Identity};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Default)]
struct Records {
    identities: HashMap<Uuid, Identity>,
    /// Index: normalized email -> identity ID
    email_index: HashMap<String, Uuid>,
}

/// Identities held in process memory
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    records: RwLock<Records>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored identities
    pub fn len(&self) -> usize {
        self.records.read().identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn create(&self, identity: &Identity) -> Result<(), StorageError> {
        let key = identity.email_key();
        let mut records = self.records.write();
        if records.email_index.contains_key(&key) {
            return Err(StorageError::EmailTaken(identity.email.clone()));
        }
        records.email_index.insert(key, identity.id);
        records.identities.insert(identity.id, identity.clone());
        Ok(())
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<Identity>, StorageError> {
        let records = self.records.read();
        Ok(records
            .email_index
            .get(&normalize_email(email))
            .and_then(|id| records.identities.get(id))
            .cloned())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Identity>, StorageError> {
        Ok(self.records.read().identities.get(&id).cloned())
    }

    async fn check_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Option<Identity>, StorageError> {
        let Some(identity) = self.find_by_email(email).await? else {
            return Ok(None);
        };

        let password = password.to_string();
        let hash = identity.password_hash.clone();
        let matches = tokio::task::spawn_blocking(move || verify_password(&password, &hash))
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))??;

        Ok(matches.then_some(identity))
    }

    async fn add_role(&self, id: Uuid, role: &str) -> Result<Identity, StorageError> {
        let mut records = self.records.write();
        let identity = records
            .identities
            .get_mut(&id)
            .ok_or_else(|| StorageError::IdentityNotFound(id.to_string()))?;
        identity
            .add_role(role)
            .map_err(|e| StorageError::UnknownRole(e.0))?;
        Ok(identity.clone())
    }

    async fn health_check(&self) -> Result<(), StorageError> {
        Ok(())
    }
}
