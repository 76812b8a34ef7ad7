//! Application services: load-replay-decide-append loops over the event log.
//!
//! Each service loads its aggregate by replaying the stream, runs a pure
//! domain command, and appends the resulting events through the
//! [`EventPublisher`](crate::event_bus::EventPublisher). Optimistic
//! concurrency conflicts are retried a small fixed number of times by
//! reloading; exhaustion surfaces as a conflict to the caller.

pub mod api_keys;
pub mod endpoints;
pub mod invoices;
pub mod matcher;
pub mod merchants;
pub mod payments;
pub mod settlements;

use serde::de::DeserializeOwned;

use checkout_types::event::EventEnvelope;

use crate::event_store::EventStoreError;

/// In-service retries for `ConcurrencyConflict` before giving up.
pub const CONFLICT_RETRIES: usize = 3;

/// The error surface services expose to the HTTP layer.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("{0}")]
    Validation(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("Authentication failed")]
    Authentication,
    #[error("{0}")]
    Authorization(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    pub fn validation(message: impl Into<String>) -> Self {
        ServiceError::Validation(message.into())
    }

    pub fn not_found(resource: impl Into<String>) -> Self {
        ServiceError::NotFound(resource.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        ServiceError::Conflict(message.into())
    }

    pub fn internal(message: impl std::fmt::Display) -> Self {
        ServiceError::Internal(message.to_string())
    }
}

impl From<EventStoreError> for ServiceError {
    fn from(error: EventStoreError) -> Self {
        match error {
            EventStoreError::ConcurrencyConflict { aggregate_id, .. } => {
                ServiceError::Conflict(format!("Concurrent update on {aggregate_id}"))
            }
            other => ServiceError::Internal(other.to_string()),
        }
    }
}

/// Decodes a stream of envelopes into typed aggregate events.
pub(crate) fn decode_stream<E: DeserializeOwned>(
    envelopes: &[EventEnvelope],
) -> Result<Vec<E>, ServiceError> {
    envelopes
        .iter()
        .map(|envelope| envelope.decode::<E>().map_err(ServiceError::internal))
        .collect()
}

/// True when the error is a store-level version race worth retrying.
pub(crate) fn is_version_race(error: &EventStoreError) -> bool {
    matches!(error, EventStoreError::ConcurrencyConflict { .. })
}
