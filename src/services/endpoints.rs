//! Webhook endpoint registry: merchant-facing CRUD and the subscription
//! lookups the delivery engine runs on every event.

use dashmap::DashMap;
use std::sync::Arc;
use tracing::instrument;

use chrono::Utc;

use checkout_types::event::{EventEnvelope, EventMetadata, EventType};
use checkout_types::id::{EndpointId, MerchantId};
use checkout_types::webhook::{
    EndpointConfig, EndpointStatus, WebhookEndpoint, WebhookEndpointError, WebhookEndpointEvent,
};

use crate::event_bus::EventPublisher;
use crate::event_store::EventStore;
use crate::services::ServiceError;
use crate::services::merchants::MerchantService;

const PRODUCER: &str = "webhook-endpoint-service";

/// Shared endpoint records, readable by the delivery engine without touching
/// the event log.
#[derive(Default)]
pub struct EndpointRegistry {
    endpoints: DashMap<EndpointId, WebhookEndpoint>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: EndpointId) -> Option<WebhookEndpoint> {
        self.endpoints.get(&id).map(|entry| entry.clone())
    }

    pub fn insert(&self, endpoint: WebhookEndpoint) {
        self.endpoints.insert(endpoint.id, endpoint);
    }

    pub fn remove(&self, id: EndpointId) -> Option<WebhookEndpoint> {
        self.endpoints.remove(&id).map(|(_, endpoint)| endpoint)
    }

    pub fn list_by_merchant(&self, merchant_id: MerchantId) -> Vec<WebhookEndpoint> {
        let mut endpoints: Vec<WebhookEndpoint> = self
            .endpoints
            .iter()
            .filter(|entry| entry.merchant_id == merchant_id)
            .map(|entry| entry.clone())
            .collect();
        endpoints.sort_by_key(|endpoint| endpoint.created_at);
        endpoints
    }

    /// Active endpoints subscribed to `event_type`.
    pub fn subscribed_to(&self, event_type: EventType) -> Vec<WebhookEndpoint> {
        self.endpoints
            .iter()
            .filter(|entry| entry.is_active() && entry.subscribes_to(event_type))
            .map(|entry| entry.clone())
            .collect()
    }

    /// Applies a delivery outcome to the endpoint's health counters.
    /// Returns the new status when the outcome flipped the endpoint.
    pub fn record_outcome(&self, id: EndpointId, success: bool) -> Option<EndpointStatus> {
        let mut entry = self.endpoints.get_mut(&id)?;
        if success {
            entry.record_success();
            None
        } else if entry.record_terminal_failure() {
            Some(entry.status)
        } else {
            None
        }
    }
}

pub struct WebhookEndpointService {
    publisher: Arc<EventPublisher>,
    registry: Arc<EndpointRegistry>,
    merchants: Arc<MerchantService>,
}

impl WebhookEndpointService {
    pub fn new(
        publisher: Arc<EventPublisher>,
        registry: Arc<EndpointRegistry>,
        merchants: Arc<MerchantService>,
    ) -> Self {
        WebhookEndpointService {
            publisher,
            registry,
            merchants,
        }
    }

    pub fn registry(&self) -> &Arc<EndpointRegistry> {
        &self.registry
    }

    #[instrument(skip_all, fields(merchant_id = %merchant_id))]
    pub async fn create(
        &self,
        merchant_id: MerchantId,
        config: EndpointConfig,
    ) -> Result<WebhookEndpoint, ServiceError> {
        let merchant = self.merchants.get(merchant_id).await?;
        if !merchant.is_active() {
            return Err(ServiceError::conflict(
                "Only active merchants may register webhook endpoints",
            ));
        }
        let endpoint = WebhookEndpoint::new(merchant_id, config).map_err(map_domain_error)?;
        self.registry.insert(endpoint.clone());
        self.publish_lifecycle(
            &endpoint,
            WebhookEndpointEvent::Created {
                endpoint_id: endpoint.id,
                merchant_id,
                url: endpoint.url.clone(),
                events: endpoint.events.clone(),
                at: endpoint.created_at,
            },
        )
        .await?;
        Ok(endpoint)
    }

    pub async fn update(
        &self,
        id: EndpointId,
        merchant_id: MerchantId,
        config: EndpointConfig,
    ) -> Result<WebhookEndpoint, ServiceError> {
        let mut endpoint = self.owned(id, merchant_id)?;
        endpoint.reconfigure(config).map_err(map_domain_error)?;
        self.registry.insert(endpoint.clone());
        self.publish_lifecycle(
            &endpoint,
            WebhookEndpointEvent::Updated {
                endpoint_id: endpoint.id,
                merchant_id,
                at: Utc::now(),
            },
        )
        .await?;
        Ok(endpoint)
    }

    pub async fn delete(&self, id: EndpointId, merchant_id: MerchantId) -> Result<(), ServiceError> {
        let endpoint = self.owned(id, merchant_id)?;
        self.registry.remove(endpoint.id);
        self.publish_lifecycle(
            &endpoint,
            WebhookEndpointEvent::Deleted {
                endpoint_id: endpoint.id,
                merchant_id,
                at: Utc::now(),
            },
        )
        .await?;
        Ok(())
    }

    pub async fn enable(
        &self,
        id: EndpointId,
        merchant_id: MerchantId,
    ) -> Result<WebhookEndpoint, ServiceError> {
        let mut endpoint = self.owned(id, merchant_id)?;
        endpoint.enable().map_err(map_domain_error)?;
        self.registry.insert(endpoint.clone());
        self.publish_lifecycle(
            &endpoint,
            WebhookEndpointEvent::Enabled {
                endpoint_id: endpoint.id,
                merchant_id,
                at: endpoint.updated_at,
            },
        )
        .await?;
        Ok(endpoint)
    }

    pub async fn disable(
        &self,
        id: EndpointId,
        merchant_id: MerchantId,
    ) -> Result<WebhookEndpoint, ServiceError> {
        let mut endpoint = self.owned(id, merchant_id)?;
        endpoint.disable().map_err(map_domain_error)?;
        self.registry.insert(endpoint.clone());
        self.publish_lifecycle(
            &endpoint,
            WebhookEndpointEvent::Disabled {
                endpoint_id: endpoint.id,
                merchant_id,
                at: endpoint.updated_at,
            },
        )
        .await?;
        Ok(endpoint)
    }

    pub async fn get(
        &self,
        id: EndpointId,
        merchant_id: MerchantId,
    ) -> Result<WebhookEndpoint, ServiceError> {
        self.owned(id, merchant_id)
    }

    pub async fn list(&self, merchant_id: MerchantId) -> Result<Vec<WebhookEndpoint>, ServiceError> {
        self.merchants.get(merchant_id).await?;
        Ok(self.registry.list_by_merchant(merchant_id))
    }

    fn owned(
        &self,
        id: EndpointId,
        merchant_id: MerchantId,
    ) -> Result<WebhookEndpoint, ServiceError> {
        let endpoint = self
            .registry
            .get(id)
            .ok_or_else(|| ServiceError::not_found(format!("webhook endpoint {id}")))?;
        if endpoint.merchant_id != merchant_id {
            return Err(ServiceError::Authorization(
                "Webhook endpoint belongs to a different merchant".into(),
            ));
        }
        Ok(endpoint)
    }

    async fn publish_lifecycle(
        &self,
        endpoint: &WebhookEndpoint,
        event: WebhookEndpointEvent,
    ) -> Result<(), ServiceError> {
        let version = self
            .publisher
            .store()
            .current_version(&endpoint.id.to_string())
            .await?;
        let envelope = EventEnvelope::record(
            endpoint.id.to_string(),
            version + 1,
            &event,
            EventMetadata::produced_by(PRODUCER),
        )
        .map_err(ServiceError::internal)?;
        self.publisher.append_and_publish(vec![envelope]).await?;
        Ok(())
    }
}

fn map_domain_error(error: WebhookEndpointError) -> ServiceError {
    match error {
        WebhookEndpointError::WrongStatus(_) => ServiceError::conflict(error.to_string()),
        other => ServiceError::validation(other.to_string()),
    }
}
