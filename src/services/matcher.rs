//! Payment-to-invoice attribution.
//!
//! A confirmed payment is bound to its invoice by payment address, with an
//! explicit invoice hint from the watcher taking precedence. The invoice
//! status transition commits through the invoice's own stream append, so
//! attribution and the resulting state change share one commit point; the
//! payment's `Attributed` marker follows on its own stream. Payments that
//! match nothing, or land on an already-terminal invoice, are recorded as
//! `payment.unmatched` and never dropped.

use std::sync::Arc;
use tracing::instrument;

use chrono::Utc;

use checkout_types::event::{EventEnvelope, EventMetadata};
use checkout_types::id::InvoiceId;
use checkout_types::invoice::{InvoiceError, InvoiceEvent, InvoiceStatus};
use checkout_types::payment::{Payment, PaymentEvent};

use crate::event_bus::EventPublisher;
use crate::event_store::EventStore;
use crate::services::{CONFLICT_RETRIES, ServiceError, is_version_race};
use crate::services::invoices::InvoiceService;
use crate::services::settlements::SettlementService;

const PRODUCER: &str = "payment-matcher";

/// Where a confirmed payment ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attribution {
    Attributed {
        invoice_id: InvoiceId,
        invoice_status: InvoiceStatus,
    },
    Unmatched {
        reason: String,
    },
}

pub struct MatcherService {
    publisher: Arc<EventPublisher>,
    invoices: Arc<InvoiceService>,
    settlements: Arc<SettlementService>,
}

impl MatcherService {
    pub fn new(
        publisher: Arc<EventPublisher>,
        invoices: Arc<InvoiceService>,
        settlements: Arc<SettlementService>,
    ) -> Self {
        MatcherService {
            publisher,
            invoices,
            settlements,
        }
    }

    /// Attributes a confirmed payment, drives the invoice status machine,
    /// and triggers settlement when the invoice completes.
    #[instrument(skip_all, fields(payment_id = %payment.id, tx_hash = %payment.tx_hash))]
    pub async fn attribute(&self, payment: &Payment) -> Result<Attribution, ServiceError> {
        let target = payment.invoice_hint.or_else(|| {
            self.invoices
                .index()
                .find_by_address(payment.to_address.as_str())
        });
        let Some(invoice_id) = target else {
            return self
                .record_unmatched(payment, "no invoice for payment address")
                .await;
        };

        let mut attempts = 0;
        loop {
            let (invoice, version) = match self.invoices.load(invoice_id).await {
                Ok(loaded) => loaded,
                Err(ServiceError::NotFound(_)) => {
                    return self
                        .record_unmatched(payment, "hinted invoice does not exist")
                        .await;
                }
                Err(error) => return Err(error),
            };
            let event = match invoice.attribute_payment(payment.id, payment.amount) {
                Ok(event) => event,
                Err(InvoiceError::NotOpen(status)) => {
                    // Late payment against a settled/expired/cancelled
                    // invoice: keep the money trail, leave the invoice alone.
                    return self
                        .record_unmatched(payment, &format!("invoice is {status}"))
                        .await;
                }
                Err(error) => return Err(ServiceError::validation(error.to_string())),
            };
            let envelope = EventEnvelope::record(
                invoice_id.to_string(),
                version + 1,
                &event,
                EventMetadata::produced_by(PRODUCER)
                    .with_causation(payment.id.to_string()),
            )
            .map_err(ServiceError::internal)?;
            match self.publisher.append_and_publish(vec![envelope]).await {
                Ok(_) => {
                    let mut invoice = invoice;
                    invoice.apply(&event);
                    self.mark_payment_attributed(payment, invoice_id).await;
                    if matches!(
                        event,
                        InvoiceEvent::Paid { .. } | InvoiceEvent::Overpaid { .. }
                    ) {
                        self.settlements.settle(&invoice).await?;
                    }
                    return Ok(Attribution::Attributed {
                        invoice_id,
                        invoice_status: invoice.status,
                    });
                }
                Err(error) if is_version_race(&error) && attempts < CONFLICT_RETRIES => {
                    attempts += 1;
                    continue;
                }
                Err(error) => return Err(error.into()),
            }
        }
    }

    /// Best-effort `Attributed` marker on the payment's own stream. The
    /// invoice-side commit is authoritative; a failure here only costs the
    /// back-reference.
    async fn mark_payment_attributed(&self, payment: &Payment, invoice_id: InvoiceId) {
        let event = match payment.attribute(invoice_id) {
            Ok(event) => event,
            Err(error) => {
                tracing::warn!(payment_id = %payment.id, error = %error, "Attribution marker skipped");
                return;
            }
        };
        let version = match self
            .publisher
            .store()
            .current_version(&payment.id.to_string())
            .await
        {
            Ok(version) => version,
            Err(error) => {
                tracing::warn!(payment_id = %payment.id, error = %error, "Attribution marker skipped");
                return;
            }
        };
        let envelope = match EventEnvelope::record(
            payment.id.to_string(),
            version + 1,
            &event,
            EventMetadata::produced_by(PRODUCER).with_causation(invoice_id.to_string()),
        ) {
            Ok(envelope) => envelope,
            Err(error) => {
                tracing::warn!(payment_id = %payment.id, error = %error, "Attribution marker skipped");
                return;
            }
        };
        if let Err(error) = self.publisher.append_and_publish(vec![envelope]).await {
            tracing::warn!(payment_id = %payment.id, error = %error, "Attribution marker append failed");
        }
    }

    /// Surfaces an unattributable payment as an operational event.
    async fn record_unmatched(
        &self,
        payment: &Payment,
        reason: &str,
    ) -> Result<Attribution, ServiceError> {
        tracing::warn!(
            payment_id = %payment.id,
            tx_hash = %payment.tx_hash,
            to_address = %payment.to_address,
            reason,
            "Payment left unattributed"
        );
        let event = PaymentEvent::Unmatched {
            reason: reason.to_string(),
            at: Utc::now(),
        };
        let version = self
            .publisher
            .store()
            .current_version(&payment.id.to_string())
            .await?;
        let envelope = EventEnvelope::record(
            payment.id.to_string(),
            version + 1,
            &event,
            EventMetadata::produced_by(PRODUCER),
        )
        .map_err(ServiceError::internal)?;
        self.publisher.append_and_publish(vec![envelope]).await?;
        Ok(Attribution::Unmatched {
            reason: reason.to_string(),
        })
    }
}
