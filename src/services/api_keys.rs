//! API-key issuance, validation, and revocation.
//!
//! The raw key exists in memory exactly once, inside the creation response.
//! Validation collapses unknown, expired, and revoked keys into one uniform
//! failure for callers; the distinction is only logged.

use chrono::Utc;
use std::sync::Arc;
use tracing::instrument;

use checkout_types::api_key::{
    ApiKey, ApiKeyError, ApiKeyEvent, KeyType, PermissionSet, is_valid_raw_key_format,
};
use checkout_types::event::{EventEnvelope, EventMetadata};
use checkout_types::id::{ApiKeyId, MerchantId};

use crate::credentials::{CredentialStore, generate_raw_key, hash_raw_key};
use crate::event_bus::EventPublisher;
use crate::event_store::EventStore;
use crate::services::ServiceError;
use crate::services::merchants::MerchantService;

const PRODUCER: &str = "api-key-service";

/// The one-time creation result carrying the raw key.
#[derive(Debug, Clone)]
pub struct CreatedKey {
    pub key: ApiKey,
    pub raw_key: String,
}

/// Why a presented key failed validation. Logged, never returned to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InvalidKeyReason {
    Malformed,
    Unknown,
    Expired,
    Revoked,
}

pub struct ApiKeyService {
    publisher: Arc<EventPublisher>,
    credentials: Arc<dyn CredentialStore>,
    merchants: Arc<MerchantService>,
}

impl ApiKeyService {
    pub fn new(
        publisher: Arc<EventPublisher>,
        credentials: Arc<dyn CredentialStore>,
        merchants: Arc<MerchantService>,
    ) -> Self {
        ApiKeyService {
            publisher,
            credentials,
            merchants,
        }
    }

    /// Issues a key for an active merchant. The raw key is returned exactly
    /// once and never stored.
    #[instrument(skip_all, fields(merchant_id = %merchant_id, key_type = %key_type))]
    pub async fn create(
        &self,
        merchant_id: MerchantId,
        key_type: KeyType,
        permissions: PermissionSet,
        name: String,
        expires_at: Option<chrono::DateTime<Utc>>,
    ) -> Result<CreatedKey, ServiceError> {
        let merchant = self.merchants.get(merchant_id).await?;
        if !merchant.is_active() {
            return Err(ServiceError::conflict(
                "Only active merchants may create API keys",
            ));
        }
        let raw_key = generate_raw_key(key_type);
        let key = ApiKey::new(
            merchant_id,
            hash_raw_key(&raw_key),
            key_type,
            permissions,
            name,
            expires_at,
        )
        .map_err(|e| ServiceError::validation(e.to_string()))?;
        self.credentials
            .insert(key.clone())
            .await
            .map_err(ServiceError::internal)?;

        let event = ApiKeyEvent::Generated {
            api_key_id: key.id,
            merchant_id,
            key_type,
            name: key.name.clone(),
            at: key.created_at,
        };
        let envelope = EventEnvelope::record(
            key.id.to_string(),
            1,
            &event,
            EventMetadata::produced_by(PRODUCER),
        )
        .map_err(ServiceError::internal)?;
        self.publisher.append_and_publish(vec![envelope]).await?;

        Ok(CreatedKey { key, raw_key })
    }

    /// Validates a presented bearer.
    ///
    /// Every failure mode maps to the same authentication error; the internal
    /// reason is only traced. Successful validation touches `last_used_at`.
    #[instrument(skip_all)]
    pub async fn validate(&self, raw_key: &str) -> Result<ApiKey, ServiceError> {
        match self.validate_inner(raw_key).await? {
            Ok(key) => Ok(key),
            Err(reason) => {
                tracing::info!(reason = ?reason, "API key rejected");
                Err(ServiceError::Authentication)
            }
        }
    }

    async fn validate_inner(
        &self,
        raw_key: &str,
    ) -> Result<Result<ApiKey, InvalidKeyReason>, ServiceError> {
        if !is_valid_raw_key_format(raw_key) {
            return Ok(Err(InvalidKeyReason::Malformed));
        }
        let key_hash = hash_raw_key(raw_key);
        let Some(key) = self
            .credentials
            .find_by_hash(&key_hash)
            .await
            .map_err(ServiceError::internal)?
        else {
            return Ok(Err(InvalidKeyReason::Unknown));
        };
        debug_assert_eq!(key.key_hash, key_hash);
        let now = Utc::now();
        match key.effective_status(now) {
            checkout_types::api_key::ApiKeyStatus::Active => {
                self.credentials
                    .touch_last_used(key.id, now)
                    .await
                    .map_err(ServiceError::internal)?;
                Ok(Ok(key))
            }
            checkout_types::api_key::ApiKeyStatus::Expired => Ok(Err(InvalidKeyReason::Expired)),
            checkout_types::api_key::ApiKeyStatus::Revoked => Ok(Err(InvalidKeyReason::Revoked)),
        }
    }

    /// Revokes a key. Revoking twice is an error, not a no-op.
    #[instrument(skip_all, fields(api_key_id = %id))]
    pub async fn revoke(&self, id: ApiKeyId, reason: String) -> Result<ApiKey, ServiceError> {
        let mut key = self
            .credentials
            .find_by_id(id)
            .await
            .map_err(ServiceError::internal)?
            .ok_or_else(|| ServiceError::not_found(format!("API key {id}")))?;
        key.revoke(reason.clone()).map_err(|e| match e {
            ApiKeyError::AlreadyRevoked => ServiceError::conflict(e.to_string()),
            other => ServiceError::validation(other.to_string()),
        })?;
        self.credentials
            .update(key.clone())
            .await
            .map_err(ServiceError::internal)?;

        let version = self
            .publisher
            .store()
            .current_version(&key.id.to_string())
            .await?;
        let event = ApiKeyEvent::Revoked {
            api_key_id: key.id,
            merchant_id: key.merchant_id,
            reason,
            at: Utc::now(),
        };
        let envelope = EventEnvelope::record(
            key.id.to_string(),
            version + 1,
            &event,
            EventMetadata::produced_by(PRODUCER),
        )
        .map_err(ServiceError::internal)?;
        self.publisher.append_and_publish(vec![envelope]).await?;
        Ok(key)
    }

    pub async fn list(&self, merchant_id: MerchantId) -> Result<Vec<ApiKey>, ServiceError> {
        self.merchants.get(merchant_id).await?;
        self.credentials
            .list_by_merchant(merchant_id)
            .await
            .map_err(ServiceError::internal)
    }

    pub async fn get(&self, id: ApiKeyId) -> Result<ApiKey, ServiceError> {
        self.credentials
            .find_by_id(id)
            .await
            .map_err(ServiceError::internal)?
            .ok_or_else(|| ServiceError::not_found(format!("API key {id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::InMemoryCredentialStore;
    use crate::event_bus::{InMemoryEventBus, TopicMap};
    use crate::event_store::InMemoryEventStore;
    use checkout_types::merchant::MerchantSettings;
    use chrono::Duration;

    async fn setup() -> (ApiKeyService, Arc<MerchantService>, MerchantId) {
        let store = Arc::new(InMemoryEventStore::new());
        let bus = Arc::new(InMemoryEventBus::new());
        let publisher = Arc::new(EventPublisher::new(store, bus, TopicMap::standard()));
        let credentials = Arc::new(InMemoryCredentialStore::new());
        let merchants = Arc::new(MerchantService::new(
            publisher.clone(),
            credentials.clone(),
        ));
        let merchant = merchants
            .create(
                "Acme Widgets".into(),
                "ops@acme.test".into(),
                MerchantSettings::default(),
            )
            .await
            .unwrap();
        merchants.activate(merchant.id).await.unwrap();
        let service = ApiKeyService::new(publisher, credentials, merchants.clone());
        (service, merchants, merchant.id)
    }

    #[tokio::test]
    async fn test_create_returns_raw_key_once() {
        let (service, _merchants, merchant_id) = setup().await;
        let created = service
            .create(
                merchant_id,
                KeyType::Live,
                PermissionSet::wildcard(),
                "primary".into(),
                None,
            )
            .await
            .unwrap();
        assert!(created.raw_key.starts_with("ck_live_"));
        assert_eq!(created.key.key_hash, hash_raw_key(&created.raw_key));

        // The stored record never carries the raw key.
        let stored = service.get(created.key.id).await.unwrap();
        assert_eq!(stored.key_hash, created.key.key_hash);
    }

    #[tokio::test]
    async fn test_validate_accepts_live_key_and_touches_last_used() {
        let (service, _merchants, merchant_id) = setup().await;
        let created = service
            .create(
                merchant_id,
                KeyType::Live,
                PermissionSet::new(["invoices:read"]).unwrap(),
                "primary".into(),
                None,
            )
            .await
            .unwrap();
        let validated = service.validate(&created.raw_key).await.unwrap();
        assert_eq!(validated.id, created.key.id);

        let stored = service.get(created.key.id).await.unwrap();
        assert!(stored.last_used_at.is_some());
    }

    #[tokio::test]
    async fn test_validate_is_uniform_across_failure_modes() {
        let (service, _merchants, merchant_id) = setup().await;

        // Malformed.
        assert!(matches!(
            service.validate("not-a-key").await.unwrap_err(),
            ServiceError::Authentication
        ));
        // Unknown but well-formed.
        let unknown = generate_raw_key(KeyType::Live);
        assert!(matches!(
            service.validate(&unknown).await.unwrap_err(),
            ServiceError::Authentication
        ));
        // Expired.
        let expiring = service
            .create(
                merchant_id,
                KeyType::Test,
                PermissionSet::wildcard(),
                "short-lived".into(),
                Some(Utc::now() + Duration::milliseconds(1)),
            )
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert!(matches!(
            service.validate(&expiring.raw_key).await.unwrap_err(),
            ServiceError::Authentication
        ));
        // Revoked.
        let revoked = service
            .create(
                merchant_id,
                KeyType::Live,
                PermissionSet::wildcard(),
                "doomed".into(),
                None,
            )
            .await
            .unwrap();
        service
            .revoke(revoked.key.id, "rotation".into())
            .await
            .unwrap();
        assert!(matches!(
            service.validate(&revoked.raw_key).await.unwrap_err(),
            ServiceError::Authentication
        ));
    }

    #[tokio::test]
    async fn test_double_revoke_conflicts() {
        let (service, _merchants, merchant_id) = setup().await;
        let created = service
            .create(
                merchant_id,
                KeyType::Live,
                PermissionSet::wildcard(),
                "primary".into(),
                None,
            )
            .await
            .unwrap();
        service.revoke(created.key.id, "first".into()).await.unwrap();
        assert!(matches!(
            service
                .revoke(created.key.id, "second".into())
                .await
                .unwrap_err(),
            ServiceError::Conflict(_)
        ));
    }

    #[tokio::test]
    async fn test_inactive_merchant_cannot_create_keys() {
        let (service, merchants, merchant_id) = setup().await;
        merchants.suspend(merchant_id, None).await.unwrap();
        assert!(matches!(
            service
                .create(
                    merchant_id,
                    KeyType::Live,
                    PermissionSet::wildcard(),
                    "nope".into(),
                    None,
                )
                .await
                .unwrap_err(),
            ServiceError::Conflict(_)
        ));
    }
}
