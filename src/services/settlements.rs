//! Settlement bookkeeping, invoked when an invoice reaches `paid` or
//! `overpaid`.
//!
//! The fee rate is read from merchant settings at the instant of settlement;
//! the merchant aggregate keeps the audited rate history. One settlement per
//! invoice: repeated triggers (outbox replays, matcher retries) are absorbed
//! by the invoice index.

use dashmap::DashMap;
use std::sync::Arc;
use tracing::instrument;

use checkout_types::event::{AggregateType, EventEnvelope, EventMetadata};
use checkout_types::id::{InvoiceId, SettlementId};
use checkout_types::invoice::Invoice;
use checkout_types::settlement::{Settlement, SettlementError, SettlementEvent};

use crate::event_bus::EventPublisher;
use crate::event_store::Projection;
use crate::services::ServiceError;
use crate::services::merchants::MerchantService;

const PRODUCER: &str = "settlement-engine";

/// Read model over settlement streams.
#[derive(Default)]
pub struct SettlementIndex {
    by_invoice: DashMap<InvoiceId, SettlementId>,
    records: DashMap<SettlementId, Settlement>,
}

impl SettlementIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_invoice(&self, invoice_id: InvoiceId) -> Option<Settlement> {
        let id = self.by_invoice.get(&invoice_id)?;
        self.records.get(&id).map(|entry| entry.clone())
    }

    pub fn get(&self, id: SettlementId) -> Option<Settlement> {
        self.records.get(&id).map(|entry| entry.clone())
    }
}

impl Projection for SettlementIndex {
    fn apply(&self, envelope: &EventEnvelope) {
        if envelope.aggregate_type != AggregateType::Settlement {
            return;
        }
        let Ok(event) = envelope.decode::<SettlementEvent>() else {
            tracing::warn!(
                aggregate_id = %envelope.aggregate_id,
                "Settlement projection skipped undecodable event"
            );
            return;
        };
        if let Some(settlement) = Settlement::from_event(&event) {
            self.by_invoice.insert(settlement.invoice_id, settlement.id);
            self.records.insert(settlement.id, settlement);
        }
    }
}

pub struct SettlementService {
    publisher: Arc<EventPublisher>,
    merchants: Arc<MerchantService>,
    index: Arc<SettlementIndex>,
}

impl SettlementService {
    pub fn new(
        publisher: Arc<EventPublisher>,
        merchants: Arc<MerchantService>,
        index: Arc<SettlementIndex>,
    ) -> Self {
        SettlementService {
            publisher,
            merchants,
            index,
        }
    }

    pub fn index(&self) -> &Arc<SettlementIndex> {
        &self.index
    }

    /// Records the settlement for a just-paid invoice. Idempotent per
    /// invoice: a second trigger returns the existing record.
    #[instrument(skip_all, fields(invoice_id = %invoice.id))]
    pub async fn settle(&self, invoice: &Invoice) -> Result<Settlement, ServiceError> {
        if let Some(existing) = self.index.for_invoice(invoice.id) {
            tracing::debug!(invoice_id = %invoice.id, "Invoice already settled");
            return Ok(existing);
        }
        let merchant = self.merchants.get(invoice.merchant_id).await?;
        let event = Settlement::compute(invoice, merchant.settings.fee_rate)
            .map_err(map_domain_error)?;
        let SettlementEvent::Completed { settlement_id, .. } = &event else {
            return Err(ServiceError::internal("compute produced unexpected event"));
        };
        let envelope = EventEnvelope::record(
            settlement_id.to_string(),
            1,
            &event,
            EventMetadata::produced_by(PRODUCER),
        )
        .map_err(ServiceError::internal)?;
        self.publisher.append_and_publish(vec![envelope]).await?;
        Settlement::from_event(&event)
            .ok_or_else(|| ServiceError::internal("settlement event carried no record"))
    }

    pub async fn for_invoice(
        &self,
        invoice_id: InvoiceId,
    ) -> Result<Option<Settlement>, ServiceError> {
        Ok(self.index.for_invoice(invoice_id))
    }
}

fn map_domain_error(error: SettlementError) -> ServiceError {
    match error {
        SettlementError::InvoiceNotSettleable(_) => ServiceError::conflict(error.to_string()),
        other => ServiceError::validation(other.to_string()),
    }
}
