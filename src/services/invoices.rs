//! Invoice operations: creation, public viewing, cancellation, listing, and
//! the expiration sweep entry point.
//!
//! The service keeps a read-through index (a store projection) mapping
//! payment addresses and merchants to invoice ids and tracking which open
//! invoices are due to expire. The index updates under the same commit point
//! as the append, so it never observes uncommitted state.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::Rng;
use std::sync::Arc;
use tracing::instrument;

use checkout_types::event::{AggregateType, EventEnvelope, EventMetadata};
use checkout_types::id::{InvoiceId, MerchantId};
use checkout_types::invoice::{
    Invoice, InvoiceError, InvoiceEvent, InvoiceStatus, NewInvoice,
};
use checkout_types::payment::TronAddress;

use crate::event_bus::EventPublisher;
use crate::event_store::{EventStore, Projection};
use crate::services::{CONFLICT_RETRIES, ServiceError, decode_stream, is_version_race};

const PRODUCER: &str = "invoice-service";

/// Compact invoice facts maintained as a projection for lookups the full
/// replay would make needlessly expensive.
#[derive(Debug, Clone)]
pub struct InvoiceSummary {
    pub invoice_id: InvoiceId,
    pub merchant_id: MerchantId,
    pub status: InvoiceStatus,
    pub expires_at: DateTime<Utc>,
    pub payment_address: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Read model over invoice streams: by id, by payment address, by merchant.
#[derive(Default)]
pub struct InvoiceIndex {
    by_id: DashMap<InvoiceId, InvoiceSummary>,
    by_address: DashMap<String, InvoiceId>,
    by_merchant: DashMap<MerchantId, Vec<InvoiceId>>,
}

impl InvoiceIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find_by_address(&self, address: &str) -> Option<InvoiceId> {
        self.by_address.get(address).map(|entry| *entry)
    }

    pub fn summary(&self, id: InvoiceId) -> Option<InvoiceSummary> {
        self.by_id.get(&id).map(|entry| entry.clone())
    }

    pub fn merchant_invoices(&self, merchant_id: MerchantId) -> Vec<InvoiceId> {
        self.by_merchant
            .get(&merchant_id)
            .map(|entry| entry.clone())
            .unwrap_or_default()
    }

    /// Open invoices whose deadline passed before `now`.
    pub fn expirable(&self, now: DateTime<Utc>) -> Vec<InvoiceId> {
        self.by_id
            .iter()
            .filter(|entry| entry.status.is_open() && entry.expires_at < now)
            .map(|entry| entry.invoice_id)
            .collect()
    }
}

impl Projection for InvoiceIndex {
    fn apply(&self, envelope: &EventEnvelope) {
        if envelope.aggregate_type != AggregateType::Invoice {
            return;
        }
        let Ok(event) = envelope.decode::<InvoiceEvent>() else {
            tracing::warn!(
                aggregate_id = %envelope.aggregate_id,
                "Invoice projection skipped undecodable event"
            );
            return;
        };
        match event {
            InvoiceEvent::Created {
                invoice_id,
                merchant_id,
                expires_at,
                created_at,
                ..
            } => {
                self.by_id.insert(
                    invoice_id,
                    InvoiceSummary {
                        invoice_id,
                        merchant_id,
                        status: InvoiceStatus::Created,
                        expires_at,
                        payment_address: None,
                        created_at,
                    },
                );
                self.by_merchant
                    .entry(merchant_id)
                    .or_default()
                    .push(invoice_id);
            }
            InvoiceEvent::PaymentAddressAssigned { address, .. } => {
                if let Ok(invoice_id) = envelope.aggregate_id.parse::<InvoiceId>() {
                    self.by_address.insert(address.clone(), invoice_id);
                    if let Some(mut summary) = self.by_id.get_mut(&invoice_id) {
                        summary.payment_address = Some(address);
                    }
                }
            }
            other => {
                let Ok(invoice_id) = envelope.aggregate_id.parse::<InvoiceId>() else {
                    return;
                };
                let Some(mut summary) = self.by_id.get_mut(&invoice_id) else {
                    return;
                };
                match other {
                    InvoiceEvent::Viewed { .. } => {
                        if summary.status == InvoiceStatus::Created {
                            summary.status = InvoiceStatus::Pending;
                        }
                    }
                    InvoiceEvent::PartialPayment { .. } => {
                        summary.status = InvoiceStatus::Partial
                    }
                    InvoiceEvent::Paid { .. } => summary.status = InvoiceStatus::Paid,
                    InvoiceEvent::Overpaid { .. } => summary.status = InvoiceStatus::Overpaid,
                    InvoiceEvent::Expired { .. } => summary.status = InvoiceStatus::Expired,
                    InvoiceEvent::Cancelled { .. } => {
                        summary.status = InvoiceStatus::Cancelled
                    }
                    InvoiceEvent::Created { .. }
                    | InvoiceEvent::PaymentAddressAssigned { .. } => {}
                }
            }
        }
    }
}

/// Source of unique per-invoice deposit addresses. The production
/// implementation fronts the custody wallet; the local one fabricates
/// well-formed addresses.
#[async_trait]
pub trait AddressAllocator: Send + Sync {
    async fn allocate(&self) -> Result<TronAddress, ServiceError>;
}

const BASE58_ALPHABET: &[u8] = b"123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

/// Fabricates syntactically valid, effectively unique Tron addresses.
#[derive(Default)]
pub struct RandomAddressAllocator;

#[async_trait]
impl AddressAllocator for RandomAddressAllocator {
    async fn allocate(&self) -> Result<TronAddress, ServiceError> {
        let mut rng = rand::rng();
        let body: String = (0..33)
            .map(|_| {
                let idx = rng.random_range(0..BASE58_ALPHABET.len());
                BASE58_ALPHABET[idx] as char
            })
            .collect();
        format!("T{body}")
            .parse()
            .map_err(ServiceError::internal)
    }
}

/// A page of a merchant's invoices.
#[derive(Debug)]
pub struct InvoicePage {
    pub invoices: Vec<Invoice>,
    pub total: usize,
    pub page: usize,
    pub limit: usize,
}

pub struct InvoiceService {
    publisher: Arc<EventPublisher>,
    merchants: Arc<crate::services::merchants::MerchantService>,
    index: Arc<InvoiceIndex>,
    allocator: Arc<dyn AddressAllocator>,
}

impl InvoiceService {
    pub fn new(
        publisher: Arc<EventPublisher>,
        merchants: Arc<crate::services::merchants::MerchantService>,
        index: Arc<InvoiceIndex>,
        allocator: Arc<dyn AddressAllocator>,
    ) -> Self {
        InvoiceService {
            publisher,
            merchants,
            index,
            allocator,
        }
    }

    pub fn index(&self) -> &Arc<InvoiceIndex> {
        &self.index
    }

    /// Loads the aggregate and its current stream version.
    pub async fn load(&self, id: InvoiceId) -> Result<(Invoice, u64), ServiceError> {
        let envelopes = self.publisher.store().load(&id.to_string(), 1).await?;
        if envelopes.is_empty() {
            return Err(ServiceError::not_found(format!("invoice {id}")));
        }
        let version = envelopes.len() as u64;
        let events: Vec<InvoiceEvent> = decode_stream(&envelopes)?;
        let invoice = Invoice::from_events(events.iter()).map_err(ServiceError::internal)?;
        Ok((invoice, version))
    }

    /// Creates an invoice and assigns its payment address in one commit.
    #[instrument(skip_all, fields(merchant_id = %merchant_id))]
    pub async fn create(
        &self,
        merchant_id: MerchantId,
        new: NewInvoice,
    ) -> Result<Invoice, ServiceError> {
        let merchant = self.merchants.get(merchant_id).await?;
        let created = Invoice::create(&merchant, new).map_err(map_domain_error)?;
        let InvoiceEvent::Created { invoice_id, .. } = &created else {
            return Err(ServiceError::internal("create produced unexpected event"));
        };
        let invoice_id = *invoice_id;
        let invoice = Invoice::from_events([&created]).map_err(ServiceError::internal)?;
        let address = self.allocator.allocate().await?;
        let assigned = invoice
            .assign_payment_address(address.as_str())
            .map_err(map_domain_error)?;

        let metadata = EventMetadata::produced_by(PRODUCER);
        let envelopes = vec![
            EventEnvelope::record(invoice_id.to_string(), 1, &created, metadata.clone())
                .map_err(ServiceError::internal)?,
            EventEnvelope::record(invoice_id.to_string(), 2, &assigned, metadata)
                .map_err(ServiceError::internal)?,
        ];
        self.publisher.append_and_publish(envelopes).await?;
        Ok(self.load(invoice_id).await?.0)
    }

    /// Public fetch: the first view moves `created -> pending`.
    #[instrument(skip_all, fields(invoice_id = %id))]
    pub async fn view(&self, id: InvoiceId) -> Result<Invoice, ServiceError> {
        let mut attempts = 0;
        loop {
            let (invoice, version) = self.load(id).await?;
            let Some(event) = invoice.view() else {
                return Ok(invoice);
            };
            let envelope = EventEnvelope::record(
                id.to_string(),
                version + 1,
                &event,
                EventMetadata::produced_by(PRODUCER),
            )
            .map_err(ServiceError::internal)?;
            match self.publisher.append_and_publish(vec![envelope]).await {
                Ok(_) => {
                    let mut invoice = invoice;
                    invoice.apply(&event);
                    return Ok(invoice);
                }
                Err(error) if is_version_race(&error) && attempts < CONFLICT_RETRIES => {
                    attempts += 1;
                    continue;
                }
                Err(error) => return Err(error.into()),
            }
        }
    }

    /// Merchant-facing fetch with ownership enforcement.
    pub async fn get_for_merchant(
        &self,
        id: InvoiceId,
        merchant_id: MerchantId,
    ) -> Result<Invoice, ServiceError> {
        let (invoice, _) = self.load(id).await?;
        if invoice.merchant_id != merchant_id {
            return Err(ServiceError::Authorization(
                "Invoice belongs to a different merchant".into(),
            ));
        }
        Ok(invoice)
    }

    #[instrument(skip_all, fields(invoice_id = %id))]
    pub async fn cancel(
        &self,
        id: InvoiceId,
        merchant_id: MerchantId,
        reason: String,
    ) -> Result<Invoice, ServiceError> {
        let mut attempts = 0;
        loop {
            let (invoice, version) = self.load(id).await?;
            if invoice.merchant_id != merchant_id {
                return Err(ServiceError::Authorization(
                    "Invoice belongs to a different merchant".into(),
                ));
            }
            let event = invoice.cancel(reason.clone()).map_err(map_domain_error)?;
            let envelope = EventEnvelope::record(
                id.to_string(),
                version + 1,
                &event,
                EventMetadata::produced_by(PRODUCER),
            )
            .map_err(ServiceError::internal)?;
            match self.publisher.append_and_publish(vec![envelope]).await {
                Ok(_) => {
                    let mut invoice = invoice;
                    invoice.apply(&event);
                    return Ok(invoice);
                }
                Err(error) if is_version_race(&error) && attempts < CONFLICT_RETRIES => {
                    attempts += 1;
                    continue;
                }
                Err(error) => return Err(error.into()),
            }
        }
    }

    /// Newest-first page of a merchant's invoices.
    pub async fn list(
        &self,
        merchant_id: MerchantId,
        status: Option<InvoiceStatus>,
        page: usize,
        limit: usize,
    ) -> Result<InvoicePage, ServiceError> {
        self.merchants.get(merchant_id).await?;
        let page = page.max(1);
        let limit = limit.clamp(1, 100);

        let mut summaries: Vec<InvoiceSummary> = self
            .index
            .merchant_invoices(merchant_id)
            .into_iter()
            .filter_map(|id| self.index.summary(id))
            .filter(|summary| status.is_none_or(|wanted| summary.status == wanted))
            .collect();
        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let total = summaries.len();

        let mut invoices = Vec::new();
        for summary in summaries.into_iter().skip((page - 1) * limit).take(limit) {
            invoices.push(self.load(summary.invoice_id).await?.0);
        }
        Ok(InvoicePage {
            invoices,
            total,
            page,
            limit,
        })
    }

    /// Expiration sweep: transitions every overdue open invoice. Races with
    /// concurrent payment attribution are resolved by the version gate; the
    /// loser of the race simply skips the invoice.
    #[instrument(skip_all)]
    pub async fn expire_due(&self, now: DateTime<Utc>) -> Result<usize, ServiceError> {
        let mut expired = 0;
        for invoice_id in self.index.expirable(now) {
            let (invoice, version) = match self.load(invoice_id).await {
                Ok(loaded) => loaded,
                Err(error) => {
                    tracing::warn!(invoice_id = %invoice_id, error = %error, "Expiry load failed");
                    continue;
                }
            };
            let event = match invoice.expire(now) {
                Ok(event) => event,
                // Already terminal or not yet due: nothing to do.
                Err(InvoiceError::NotOpen(_)) | Err(InvoiceError::NotYetExpired) => continue,
                Err(error) => {
                    tracing::warn!(invoice_id = %invoice_id, error = %error, "Expiry rejected");
                    continue;
                }
            };
            let envelope = EventEnvelope::record(
                invoice_id.to_string(),
                version + 1,
                &event,
                EventMetadata::produced_by("expiration-sweeper"),
            )
            .map_err(ServiceError::internal)?;
            match self.publisher.append_and_publish(vec![envelope]).await {
                Ok(_) => expired += 1,
                Err(error) if is_version_race(&error) => {
                    tracing::debug!(
                        invoice_id = %invoice_id,
                        "Expiry lost a version race; a payment landed first"
                    );
                }
                Err(error) => {
                    tracing::warn!(invoice_id = %invoice_id, error = %error, "Expiry append failed");
                }
            }
        }
        Ok(expired)
    }
}

fn map_domain_error(error: InvoiceError) -> ServiceError {
    match error {
        InvoiceError::NotOpen(_) | InvoiceError::IllegalTransition { .. } => {
            ServiceError::conflict(error.to_string())
        }
        other => ServiceError::validation(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::InMemoryCredentialStore;
    use crate::event_bus::{InMemoryEventBus, TopicMap};
    use crate::event_store::InMemoryEventStore;
    use crate::services::merchants::MerchantService;
    use checkout_types::invoice::{InvoiceItem, Tax};
    use checkout_types::merchant::MerchantSettings;
    use checkout_types::money::{Currency, Money};
    use chrono::Duration;
    use rust_decimal_macros::dec;

    struct Fixture {
        service: InvoiceService,
        merchant_id: MerchantId,
    }

    async fn setup() -> Fixture {
        let index = Arc::new(InvoiceIndex::new());
        let store = Arc::new(InMemoryEventStore::new().with_projection(index.clone()));
        let bus = Arc::new(InMemoryEventBus::new());
        let publisher = Arc::new(EventPublisher::new(store, bus, TopicMap::standard()));
        let merchants = Arc::new(MerchantService::new(
            publisher.clone(),
            Arc::new(InMemoryCredentialStore::new()),
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
        let service = InvoiceService::new(
            publisher,
            merchants,
            index,
            Arc::new(RandomAddressAllocator),
        );
        Fixture {
            service,
            merchant_id: merchant.id,
        }
    }

    fn new_invoice(total: rust_decimal::Decimal) -> NewInvoice {
        NewInvoice {
            title: "Order".into(),
            description: String::new(),
            items: vec![InvoiceItem::new(
                "Widget",
                Money::new(total, Currency::Usd).unwrap(),
                1,
            )
            .unwrap()],
            tax: Tax::None,
            crypto_currency: Currency::Usdt,
            tolerance: None,
            expires_in_minutes: None,
        }
    }

    #[tokio::test]
    async fn test_create_assigns_address_and_indexes_it() {
        let fixture = setup().await;
        let invoice = fixture
            .service
            .create(fixture.merchant_id, new_invoice(dec!(9.99)))
            .await
            .unwrap();
        let address = invoice.payment_address.clone().unwrap();
        assert!(address.starts_with('T'));
        assert_eq!(
            fixture.service.index().find_by_address(&address),
            Some(invoice.id)
        );
    }

    #[tokio::test]
    async fn test_view_transitions_once() {
        let fixture = setup().await;
        let invoice = fixture
            .service
            .create(fixture.merchant_id, new_invoice(dec!(9.99)))
            .await
            .unwrap();
        assert_eq!(invoice.status, InvoiceStatus::Created);

        let viewed = fixture.service.view(invoice.id).await.unwrap();
        assert_eq!(viewed.status, InvoiceStatus::Pending);

        let viewed_again = fixture.service.view(invoice.id).await.unwrap();
        assert_eq!(viewed_again.status, InvoiceStatus::Pending);
        // Only one Viewed event landed in the stream.
        let (_, version) = fixture.service.load(invoice.id).await.unwrap();
        assert_eq!(version, 3);
    }

    #[tokio::test]
    async fn test_merchant_mismatch_is_authorization_error() {
        let fixture = setup().await;
        let invoice = fixture
            .service
            .create(fixture.merchant_id, new_invoice(dec!(9.99)))
            .await
            .unwrap();
        let stranger = MerchantId::generate();
        assert!(matches!(
            fixture
                .service
                .get_for_merchant(invoice.id, stranger)
                .await
                .unwrap_err(),
            ServiceError::Authorization(_)
        ));
        assert!(matches!(
            fixture
                .service
                .cancel(invoice.id, stranger, "not yours".into())
                .await
                .unwrap_err(),
            ServiceError::Authorization(_)
        ));
    }

    #[tokio::test]
    async fn test_cancel_sets_reason() {
        let fixture = setup().await;
        let invoice = fixture
            .service
            .create(fixture.merchant_id, new_invoice(dec!(9.99)))
            .await
            .unwrap();
        let cancelled = fixture
            .service
            .cancel(invoice.id, fixture.merchant_id, "out of stock".into())
            .await
            .unwrap();
        assert_eq!(cancelled.status, InvoiceStatus::Cancelled);
        assert_eq!(cancelled.cancellation_reason.as_deref(), Some("out of stock"));
    }

    #[tokio::test]
    async fn test_list_paginates_newest_first() {
        let fixture = setup().await;
        for cents in 1..=5u32 {
            fixture
                .service
                .create(
                    fixture.merchant_id,
                    new_invoice(rust_decimal::Decimal::new(cents as i64, 2)),
                )
                .await
                .unwrap();
        }
        let page = fixture
            .service
            .list(fixture.merchant_id, None, 1, 2)
            .await
            .unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.invoices.len(), 2);
        assert!(page.invoices[0].created_at >= page.invoices[1].created_at);

        let last = fixture
            .service
            .list(fixture.merchant_id, None, 3, 2)
            .await
            .unwrap();
        assert_eq!(last.invoices.len(), 1);

        let cancelled_only = fixture
            .service
            .list(fixture.merchant_id, Some(InvoiceStatus::Cancelled), 1, 10)
            .await
            .unwrap();
        assert_eq!(cancelled_only.total, 0);
    }

    #[tokio::test]
    async fn test_expire_due_sweeps_overdue_open_invoices() {
        let fixture = setup().await;
        let mut new = new_invoice(dec!(9.99));
        new.expires_in_minutes = Some(1);
        let invoice = fixture
            .service
            .create(fixture.merchant_id, new)
            .await
            .unwrap();

        // Not yet due.
        let expired = fixture.service.expire_due(Utc::now()).await.unwrap();
        assert_eq!(expired, 0);

        let later = invoice.expires_at + Duration::seconds(1);
        let expired = fixture.service.expire_due(later).await.unwrap();
        assert_eq!(expired, 1);
        let (reloaded, _) = fixture.service.load(invoice.id).await.unwrap();
        assert_eq!(reloaded.status, InvoiceStatus::Expired);

        // Terminal invoices are skipped on the next pass.
        let expired = fixture.service.expire_due(later).await.unwrap();
        assert_eq!(expired, 0);
    }
}
