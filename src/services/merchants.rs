//! Merchant administration: create, activate, suspend, close, settings.

use std::sync::Arc;
use tracing::instrument;

use checkout_types::event::{EventEnvelope, EventMetadata};
use checkout_types::id::MerchantId;
use checkout_types::merchant::{Merchant, MerchantError, MerchantEvent, MerchantSettings};

use crate::credentials::CredentialStore;
use crate::event_bus::EventPublisher;
use crate::event_store::EventStore;
use crate::services::{CONFLICT_RETRIES, ServiceError, decode_stream, is_version_race};

const PRODUCER: &str = "merchant-service";

pub struct MerchantService {
    publisher: Arc<EventPublisher>,
    credentials: Arc<dyn CredentialStore>,
}

impl MerchantService {
    pub fn new(publisher: Arc<EventPublisher>, credentials: Arc<dyn CredentialStore>) -> Self {
        MerchantService {
            publisher,
            credentials,
        }
    }

    /// Loads the aggregate and its current stream version.
    pub async fn load(&self, id: MerchantId) -> Result<(Merchant, u64), ServiceError> {
        let envelopes = self.publisher.store().load(&id.to_string(), 1).await?;
        if envelopes.is_empty() {
            return Err(ServiceError::not_found(format!("merchant {id}")));
        }
        let version = envelopes.len() as u64;
        let events: Vec<MerchantEvent> = decode_stream(&envelopes)?;
        let merchant =
            Merchant::from_events(events.iter()).map_err(ServiceError::internal)?;
        Ok((merchant, version))
    }

    pub async fn get(&self, id: MerchantId) -> Result<Merchant, ServiceError> {
        Ok(self.load(id).await?.0)
    }

    #[instrument(skip_all, fields(business_name = %business_name))]
    pub async fn create(
        &self,
        business_name: String,
        contact_email: String,
        settings: MerchantSettings,
    ) -> Result<Merchant, ServiceError> {
        let event = Merchant::create(business_name, contact_email, settings)
            .map_err(map_domain_error)?;
        let MerchantEvent::Created { merchant_id, .. } = &event else {
            return Err(ServiceError::internal("create produced unexpected event"));
        };
        let merchant_id = *merchant_id;
        let envelope = EventEnvelope::record(
            merchant_id.to_string(),
            1,
            &event,
            EventMetadata::produced_by(PRODUCER),
        )
        .map_err(ServiceError::internal)?;
        self.publisher.append_and_publish(vec![envelope]).await?;
        self.get(merchant_id).await
    }

    pub async fn activate(&self, id: MerchantId) -> Result<Merchant, ServiceError> {
        self.execute(id, |merchant| merchant.activate()).await
    }

    pub async fn suspend(
        &self,
        id: MerchantId,
        reason: Option<String>,
    ) -> Result<Merchant, ServiceError> {
        self.execute(id, move |merchant| merchant.suspend(reason.clone()))
            .await
    }

    /// Closes the merchant and cascades: its API keys are removed from the
    /// credential store.
    #[instrument(skip_all, fields(merchant_id = %id))]
    pub async fn close(&self, id: MerchantId) -> Result<Merchant, ServiceError> {
        let merchant = self.execute(id, |merchant| merchant.close()).await?;
        let removed = self
            .credentials
            .remove_merchant_keys(id)
            .await
            .map_err(ServiceError::internal)?;
        if removed > 0 {
            tracing::info!(merchant_id = %id, removed, "Removed keys of closed merchant");
        }
        Ok(merchant)
    }

    pub async fn update_settings(
        &self,
        id: MerchantId,
        settings: MerchantSettings,
    ) -> Result<Merchant, ServiceError> {
        self.execute(id, move |merchant| {
            merchant.update_settings(settings.clone())
        })
        .await
    }

    /// The load-decide-append loop with bounded conflict retry.
    async fn execute<F>(&self, id: MerchantId, command: F) -> Result<Merchant, ServiceError>
    where
        F: Fn(&Merchant) -> Result<MerchantEvent, MerchantError>,
    {
        let mut attempts = 0;
        loop {
            let (merchant, version) = self.load(id).await?;
            let event = command(&merchant).map_err(map_domain_error)?;
            let envelope = EventEnvelope::record(
                id.to_string(),
                version + 1,
                &event,
                EventMetadata::produced_by(PRODUCER),
            )
            .map_err(ServiceError::internal)?;
            match self.publisher.append_and_publish(vec![envelope]).await {
                Ok(_) => {
                    let mut merchant = merchant;
                    merchant.apply(&event);
                    return Ok(merchant);
                }
                Err(error) if is_version_race(&error) && attempts < CONFLICT_RETRIES => {
                    attempts += 1;
                    continue;
                }
                Err(error) => return Err(error.into()),
            }
        }
    }
}

fn map_domain_error(error: MerchantError) -> ServiceError {
    match error {
        MerchantError::IllegalTransition { .. } => ServiceError::conflict(error.to_string()),
        other => ServiceError::validation(other.to_string()),
    }
}
