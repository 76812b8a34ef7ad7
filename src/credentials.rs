//! Hashed API-key credential storage.
//!
//! Only the SHA-256 digest of a raw key is ever persisted; lookup is by
//! digest, so presented bearers are hashed and matched without any raw-key
//! comparison. The store is one of the two pieces of shared mutable state in
//! the system (the other being the event log).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::RngCore;
use sha2::{Digest, Sha256};

use checkout_types::api_key::{ApiKey, KeyType};
use checkout_types::id::{ApiKeyId, MerchantId};

/// Generates a fresh raw key: type prefix plus 256 random bits in hex.
pub fn generate_raw_key(key_type: KeyType) -> String {
    let mut body = [0u8; 32];
    rand::rng().fill_bytes(&mut body);
    format!("{}{}", key_type.prefix(), hex::encode(body))
}

/// Hex SHA-256 digest of a raw key; the only form the platform stores.
pub fn hash_raw_key(raw: &str) -> String {
    hex::encode(Sha256::digest(raw.as_bytes()))
}

#[derive(Debug, thiserror::Error)]
pub enum CredentialStoreError {
    #[error("A key with this hash already exists")]
    DuplicateHash,
    #[error("Key not found")]
    NotFound,
    #[error("Storage failure: {0}")]
    Storage(String),
}

/// Persistent API-key records, keyed by digest.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn insert(&self, key: ApiKey) -> Result<(), CredentialStoreError>;

    /// Digest-keyed lookup for bearer validation.
    async fn find_by_hash(&self, key_hash: &str) -> Result<Option<ApiKey>, CredentialStoreError>;

    async fn find_by_id(&self, id: ApiKeyId) -> Result<Option<ApiKey>, CredentialStoreError>;

    async fn list_by_merchant(
        &self,
        merchant_id: MerchantId,
    ) -> Result<Vec<ApiKey>, CredentialStoreError>;

    /// Replaces a record in place (revocation, status changes).
    async fn update(&self, key: ApiKey) -> Result<(), CredentialStoreError>;

    /// Records a successful validation without rewriting the whole record.
    async fn touch_last_used(
        &self,
        id: ApiKeyId,
        at: DateTime<Utc>,
    ) -> Result<(), CredentialStoreError>;

    /// Domain-level cascade when a merchant is closed.
    async fn remove_merchant_keys(
        &self,
        merchant_id: MerchantId,
    ) -> Result<usize, CredentialStoreError>;
}

/// Concurrent in-memory credential store.
#[derive(Default)]
pub struct InMemoryCredentialStore {
    by_hash: DashMap<String, ApiKey>,
    hash_by_id: DashMap<ApiKeyId, String>,
}

impl InMemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn insert(&self, key: ApiKey) -> Result<(), CredentialStoreError> {
        if self.by_hash.contains_key(&key.key_hash) {
            return Err(CredentialStoreError::DuplicateHash);
        }
        self.hash_by_id.insert(key.id, key.key_hash.clone());
        self.by_hash.insert(key.key_hash.clone(), key);
        Ok(())
    }

    async fn find_by_hash(&self, key_hash: &str) -> Result<Option<ApiKey>, CredentialStoreError> {
        Ok(self.by_hash.get(key_hash).map(|entry| entry.clone()))
    }

    async fn find_by_id(&self, id: ApiKeyId) -> Result<Option<ApiKey>, CredentialStoreError> {
        let Some(hash) = self.hash_by_id.get(&id) else {
            return Ok(None);
        };
        Ok(self.by_hash.get(hash.value()).map(|entry| entry.clone()))
    }

    async fn list_by_merchant(
        &self,
        merchant_id: MerchantId,
    ) -> Result<Vec<ApiKey>, CredentialStoreError> {
        let mut keys: Vec<ApiKey> = self
            .by_hash
            .iter()
            .filter(|entry| entry.merchant_id == merchant_id)
            .map(|entry| entry.clone())
            .collect();
        keys.sort_by_key(|key| key.created_at);
        Ok(keys)
    }

    async fn update(&self, key: ApiKey) -> Result<(), CredentialStoreError> {
        match self.by_hash.get_mut(&key.key_hash) {
            Some(mut entry) => {
                *entry = key;
                Ok(())
            }
            None => Err(CredentialStoreError::NotFound),
        }
    }

    async fn touch_last_used(
        &self,
        id: ApiKeyId,
        at: DateTime<Utc>,
    ) -> Result<(), CredentialStoreError> {
        let hash = self
            .hash_by_id
            .get(&id)
            .ok_or(CredentialStoreError::NotFound)?;
        let mut entry = self
            .by_hash
            .get_mut(hash.value())
            .ok_or(CredentialStoreError::NotFound)?;
        entry.last_used_at = Some(at);
        Ok(())
    }

    async fn remove_merchant_keys(
        &self,
        merchant_id: MerchantId,
    ) -> Result<usize, CredentialStoreError> {
        let doomed: Vec<String> = self
            .by_hash
            .iter()
            .filter(|entry| entry.merchant_id == merchant_id)
            .map(|entry| entry.key_hash.clone())
            .collect();
        for hash in &doomed {
            if let Some((_, key)) = self.by_hash.remove(hash) {
                self.hash_by_id.remove(&key.id);
            }
        }
        Ok(doomed.len())
    }
}
