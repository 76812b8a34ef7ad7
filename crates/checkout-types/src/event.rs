//! Domain event envelope and the event-type registry.
//!
//! Aggregates emit typed events (see the per-aggregate modules); the service
//! layer wraps them into an [`EventEnvelope`] carrying the stream position
//! and tracing metadata, which is what the event log persists and the bus
//! publishes. Envelopes are immutable once recorded.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::id::EventId;

/// The consistency boundary a stream of events belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateType {
    Merchant,
    Invoice,
    Payment,
    Settlement,
    ApiKey,
    WebhookEndpoint,
    WebhookDelivery,
}

impl fmt::Display for AggregateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AggregateType::Merchant => "merchant",
            AggregateType::Invoice => "invoice",
            AggregateType::Payment => "payment",
            AggregateType::Settlement => "settlement",
            AggregateType::ApiKey => "api_key",
            AggregateType::WebhookEndpoint => "webhook_endpoint",
            AggregateType::WebhookDelivery => "webhook_delivery",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Unknown event type: {0}")]
pub struct EventTypeParseError(String);

macro_rules! event_types {
    ($($variant:ident => $wire:literal),+ $(,)?) => {
        /// Every event type the system emits, in its dotted wire form.
        ///
        /// Webhook subscription sets and the bus topic map are keyed by these
        /// strings.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum EventType {
            $($variant,)+
        }

        impl EventType {
            pub const ALL: &'static [EventType] = &[$(EventType::$variant,)+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $(EventType::$variant => $wire,)+
                }
            }
        }

        impl FromStr for EventType {
            type Err = EventTypeParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($wire => Ok(EventType::$variant),)+
                    other => Err(EventTypeParseError(other.to_string())),
                }
            }
        }
    };
}

event_types! {
    MerchantCreated => "merchant.created",
    MerchantActivated => "merchant.activated",
    MerchantSuspended => "merchant.suspended",
    MerchantReactivated => "merchant.reactivated",
    MerchantClosed => "merchant.closed",
    MerchantSettingsUpdated => "merchant.settings_updated",
    InvoiceCreated => "invoice.created",
    InvoiceViewed => "invoice.viewed",
    InvoicePaymentAddressAssigned => "invoice.payment_address_assigned",
    InvoicePartial => "invoice.partial",
    InvoicePaid => "invoice.paid",
    InvoiceOverpaid => "invoice.overpaid",
    InvoiceExpired => "invoice.expired",
    InvoiceCancelled => "invoice.cancelled",
    PaymentDetected => "payment.detected",
    PaymentConfirming => "payment.confirming",
    PaymentConfirmed => "payment.confirmed",
    PaymentAttributed => "payment.attributed",
    PaymentFailed => "payment.failed",
    PaymentOrphaned => "payment.orphaned",
    PaymentUnmatched => "payment.unmatched",
    SettlementCompleted => "settlement.completed",
    SettlementFailed => "settlement.failed",
    ApiKeyGenerated => "api_key.generated",
    ApiKeyRevoked => "api_key.revoked",
    WebhookEndpointCreated => "webhook_endpoint.created",
    WebhookEndpointUpdated => "webhook_endpoint.updated",
    WebhookEndpointEnabled => "webhook_endpoint.enabled",
    WebhookEndpointDisabled => "webhook_endpoint.disabled",
    WebhookEndpointDeleted => "webhook_endpoint.deleted",
    WebhookDeliveryAttempted => "webhook_delivery.attempted",
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Serialize for EventType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        EventType::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// Tracing metadata attached to every recorded event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Groups events caused by one external request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// The event that directly caused this one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,
    /// The component that recorded the event.
    #[serde(default)]
    pub producer: String,
}

impl EventMetadata {
    pub fn produced_by(producer: impl Into<String>) -> Self {
        EventMetadata {
            correlation_id: None,
            causation_id: None,
            producer: producer.into(),
        }
    }

    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_causation(mut self, causation_id: impl Into<String>) -> Self {
        self.causation_id = Some(causation_id.into());
        self
    }
}

/// A typed aggregate event that can be recorded into an [`EventEnvelope`].
pub trait DomainEvent: Serialize {
    /// Wire event type of this particular value.
    fn event_type(&self) -> EventType;

    /// The aggregate family this event belongs to.
    fn aggregate_type() -> AggregateType;
}

/// The persisted and published form of a domain event.
///
/// `event_version` positions the event inside its aggregate stream (1-based,
/// strictly monotonic, no gaps); `sequence_number` is the store-assigned
/// global position, 0 until the log accepts the envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub id: EventId,
    pub aggregate_id: String,
    pub aggregate_type: AggregateType,
    pub event_type: EventType,
    pub event_version: u64,
    pub occurred_at: DateTime<Utc>,
    pub data: serde_json::Value,
    #[serde(default)]
    pub metadata: EventMetadata,
    #[serde(default)]
    pub sequence_number: u64,
}

impl EventEnvelope {
    /// Wraps a typed event at the given stream position.
    pub fn record<E: DomainEvent>(
        aggregate_id: impl Into<String>,
        event_version: u64,
        event: &E,
        metadata: EventMetadata,
    ) -> Result<Self, serde_json::Error> {
        Ok(EventEnvelope {
            id: EventId::generate(),
            aggregate_id: aggregate_id.into(),
            aggregate_type: E::aggregate_type(),
            event_type: event.event_type(),
            event_version,
            occurred_at: Utc::now(),
            data: serde_json::to_value(event)?,
            metadata,
            sequence_number: 0,
        })
    }

    /// Decodes the payload back into its typed form.
    pub fn decode<E: DeserializeOwned>(&self) -> Result<E, serde_json::Error> {
        serde_json::from_value(self.data.clone())
    }
}
