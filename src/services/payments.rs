//! Payment intake: materializes observed transactions, tracks confirmations,
//! and hands confirmed payments to the matcher.
//!
//! `tx_hash` is the natural key. A repeated observation of a known hash can
//! only raise the confirmation count; anything else is a no-op. The
//! confirmation requirement is resolved once at detection time from the
//! target merchant's settings (when the address matches an invoice) or the
//! amount-based default tiers.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::instrument;

use checkout_types::event::{AggregateType, EventEnvelope, EventMetadata};
use checkout_types::id::PaymentId;
use checkout_types::payment::{
    Payment, PaymentEvent, PaymentObserved, PaymentStatus, TxHash, required_confirmations,
};

use crate::event_bus::EventPublisher;
use crate::event_store::{EventStore, Projection};
use crate::services::invoices::InvoiceIndex;
use crate::services::matcher::{Attribution, MatcherService};
use crate::services::merchants::MerchantService;
use crate::services::{ServiceError, decode_stream};

const PRODUCER: &str = "payment-service";

/// Compact payment facts maintained as a projection.
#[derive(Debug, Clone)]
pub struct PaymentSummary {
    pub payment_id: PaymentId,
    pub tx_hash: TxHash,
    pub status: PaymentStatus,
    pub detected_at: DateTime<Utc>,
}

/// Read model over payment streams: by transaction hash and by id.
#[derive(Default)]
pub struct PaymentIndex {
    by_hash: DashMap<TxHash, PaymentId>,
    by_id: DashMap<PaymentId, PaymentSummary>,
}

impl PaymentIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find_by_hash(&self, tx_hash: &TxHash) -> Option<PaymentId> {
        self.by_hash.get(tx_hash).map(|entry| *entry)
    }

    pub fn summary(&self, id: PaymentId) -> Option<PaymentSummary> {
        self.by_id.get(&id).map(|entry| entry.clone())
    }

    /// Payments stuck in `confirming` whose deadline has passed.
    pub fn confirmation_overdue(&self, now: DateTime<Utc>, deadline: Duration) -> Vec<PaymentId> {
        self.by_id
            .iter()
            .filter(|entry| {
                entry.status == PaymentStatus::Confirming && entry.detected_at + deadline < now
            })
            .map(|entry| entry.payment_id)
            .collect()
    }
}

impl Projection for PaymentIndex {
    fn apply(&self, envelope: &EventEnvelope) {
        if envelope.aggregate_type != AggregateType::Payment {
            return;
        }
        let Ok(event) = envelope.decode::<PaymentEvent>() else {
            tracing::warn!(
                aggregate_id = %envelope.aggregate_id,
                "Payment projection skipped undecodable event"
            );
            return;
        };
        match event {
            PaymentEvent::Detected {
                payment_id,
                tx_hash,
                detected_at,
                ..
            } => {
                self.by_hash.insert(tx_hash.clone(), payment_id);
                self.by_id.insert(
                    payment_id,
                    PaymentSummary {
                        payment_id,
                        tx_hash,
                        status: PaymentStatus::Detected,
                        detected_at,
                    },
                );
            }
            other => {
                let Ok(payment_id) = envelope.aggregate_id.parse::<PaymentId>() else {
                    return;
                };
                let Some(mut summary) = self.by_id.get_mut(&payment_id) else {
                    return;
                };
                match other {
                    PaymentEvent::Confirming { .. } => {
                        summary.status = PaymentStatus::Confirming
                    }
                    PaymentEvent::Confirmed { .. } => summary.status = PaymentStatus::Confirmed,
                    PaymentEvent::Failed { .. } => summary.status = PaymentStatus::Failed,
                    PaymentEvent::Orphaned { .. } => summary.status = PaymentStatus::Orphaned,
                    PaymentEvent::Detected { .. }
                    | PaymentEvent::Attributed { .. }
                    | PaymentEvent::Unmatched { .. } => {}
                }
            }
        }
    }
}

pub struct PaymentService {
    publisher: Arc<EventPublisher>,
    index: Arc<PaymentIndex>,
    invoice_index: Arc<InvoiceIndex>,
    merchants: Arc<MerchantService>,
    matcher: Arc<MatcherService>,
}

impl PaymentService {
    pub fn new(
        publisher: Arc<EventPublisher>,
        index: Arc<PaymentIndex>,
        invoice_index: Arc<InvoiceIndex>,
        merchants: Arc<MerchantService>,
        matcher: Arc<MatcherService>,
    ) -> Self {
        PaymentService {
            publisher,
            index,
            invoice_index,
            merchants,
            matcher,
        }
    }

    pub fn index(&self) -> &Arc<PaymentIndex> {
        &self.index
    }

    /// Loads the aggregate and its current stream version.
    pub async fn load(&self, id: PaymentId) -> Result<(Payment, u64), ServiceError> {
        let envelopes = self.publisher.store().load(&id.to_string(), 1).await?;
        if envelopes.is_empty() {
            return Err(ServiceError::not_found(format!("payment {id}")));
        }
        let version = envelopes.len() as u64;
        let events: Vec<PaymentEvent> = decode_stream(&envelopes)?;
        let payment = Payment::from_events(events.iter()).map_err(ServiceError::internal)?;
        Ok((payment, version))
    }

    /// Entry point for the blockchain watcher's `PaymentObserved` signal.
    ///
    /// Idempotent on `tx_hash`. When the observation pushes the payment to
    /// `confirmed`, the matcher runs before this returns.
    #[instrument(skip_all, fields(tx_hash = %observed.tx_hash, confirmations = observed.confirmations))]
    pub async fn observe(&self, observed: PaymentObserved) -> Result<Payment, ServiceError> {
        match self.index.find_by_hash(&observed.tx_hash) {
            Some(payment_id) => self.advance_existing(payment_id, &observed).await,
            None => self.detect_new(&observed).await,
        }
    }

    async fn detect_new(&self, observed: &PaymentObserved) -> Result<Payment, ServiceError> {
        let required = self.resolve_required_confirmations(observed).await?;
        let detected = Payment::detect(observed, required);
        let mut payment =
            Payment::from_events([&detected]).map_err(ServiceError::internal)?;
        let mut events = vec![detected];
        // The first sighting may already carry confirmations; fold the
        // resulting transitions into the same commit.
        for event in payment.update_confirmations(observed.confirmations, observed.block_number) {
            payment.apply(&event);
            events.push(event);
        }
        let payment_id = payment.id;
        let metadata = EventMetadata::produced_by(PRODUCER);
        let envelopes: Vec<EventEnvelope> = events
            .iter()
            .enumerate()
            .map(|(offset, event)| {
                EventEnvelope::record(
                    payment_id.to_string(),
                    offset as u64 + 1,
                    event,
                    metadata.clone(),
                )
            })
            .collect::<Result<_, _>>()
            .map_err(ServiceError::internal)?;
        self.publisher.append_and_publish(envelopes).await?;

        if payment.status == PaymentStatus::Confirmed {
            self.run_matcher(&mut payment).await?;
        }
        Ok(payment)
    }

    async fn advance_existing(
        &self,
        payment_id: PaymentId,
        observed: &PaymentObserved,
    ) -> Result<Payment, ServiceError> {
        let (mut payment, version) = self.load(payment_id).await?;
        let events =
            payment.update_confirmations(observed.confirmations, observed.block_number);
        if events.is_empty() {
            // Repeated observation with nothing new: idempotent no-op.
            return Ok(payment);
        }
        let metadata = EventMetadata::produced_by(PRODUCER);
        let envelopes: Vec<EventEnvelope> = events
            .iter()
            .enumerate()
            .map(|(offset, event)| {
                EventEnvelope::record(
                    payment_id.to_string(),
                    version + offset as u64 + 1,
                    event,
                    metadata.clone(),
                )
            })
            .collect::<Result<_, _>>()
            .map_err(ServiceError::internal)?;
        self.publisher.append_and_publish(envelopes).await?;
        let newly_confirmed = events
            .iter()
            .any(|event| matches!(event, PaymentEvent::Confirmed { .. }));
        for event in &events {
            payment.apply(event);
        }
        if newly_confirmed {
            self.run_matcher(&mut payment).await?;
        }
        Ok(payment)
    }

    async fn run_matcher(&self, payment: &mut Payment) -> Result<(), ServiceError> {
        match self.matcher.attribute(payment).await? {
            Attribution::Attributed { invoice_id, .. } => {
                payment.invoice_id = Some(invoice_id);
            }
            Attribution::Unmatched { .. } => {}
        }
        Ok(())
    }

    /// The merchant override applies when the payment address resolves to an
    /// invoice; otherwise the amount-based tiers decide.
    async fn resolve_required_confirmations(
        &self,
        observed: &PaymentObserved,
    ) -> Result<u32, ServiceError> {
        let invoice_id = observed.invoice_id.or_else(|| {
            self.invoice_index
                .find_by_address(observed.to_address.as_str())
        });
        let merchant_override = match invoice_id.and_then(|id| self.invoice_index.summary(id)) {
            Some(summary) => match self.merchants.get(summary.merchant_id).await {
                Ok(merchant) => merchant.settings.required_confirmations,
                Err(_) => None,
            },
            None => None,
        };
        Ok(required_confirmations(
            observed.amount.amount(),
            merchant_override,
        ))
    }

    /// Watcher signal: the containing block was reorged out.
    #[instrument(skip_all, fields(tx_hash = %tx_hash))]
    pub async fn orphan(&self, tx_hash: &TxHash) -> Result<Payment, ServiceError> {
        let payment_id = self
            .index
            .find_by_hash(tx_hash)
            .ok_or_else(|| ServiceError::not_found(format!("payment {tx_hash}")))?;
        let (mut payment, version) = self.load(payment_id).await?;
        let event = payment
            .orphan()
            .map_err(|e| ServiceError::conflict(e.to_string()))?;
        let envelope = EventEnvelope::record(
            payment_id.to_string(),
            version + 1,
            &event,
            EventMetadata::produced_by(PRODUCER),
        )
        .map_err(ServiceError::internal)?;
        self.publisher.append_and_publish(vec![envelope]).await?;
        payment.apply(&event);
        Ok(payment)
    }

    /// Confirmation-timeout sweep: fails payments stuck in `confirming`.
    #[instrument(skip_all)]
    pub async fn fail_confirmation_timeouts(
        &self,
        now: DateTime<Utc>,
        deadline: Duration,
    ) -> Result<usize, ServiceError> {
        let mut failed = 0;
        for payment_id in self.index.confirmation_overdue(now, deadline) {
            let (payment, version) = match self.load(payment_id).await {
                Ok(loaded) => loaded,
                Err(error) => {
                    tracing::warn!(payment_id = %payment_id, error = %error, "Timeout load failed");
                    continue;
                }
            };
            let event = match payment.fail_on_timeout(now, deadline) {
                Ok(event) => event,
                Err(_) => continue,
            };
            let envelope = EventEnvelope::record(
                payment_id.to_string(),
                version + 1,
                &event,
                EventMetadata::produced_by("confirmation-timeout-sweeper"),
            )
            .map_err(ServiceError::internal)?;
            match self.publisher.append_and_publish(vec![envelope]).await {
                Ok(_) => failed += 1,
                Err(error) => {
                    tracing::warn!(payment_id = %payment_id, error = %error, "Timeout append failed");
                }
            }
        }
        Ok(failed)
    }
}
