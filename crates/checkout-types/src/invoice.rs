//! Invoice aggregate: pricing, expiration, tolerance policy, and the status
//! machine.
//!
//! The status machine is encoded as a declared transition table. Tolerance
//! resolution is a pure function over `(total, paid)` decimals so that the
//! band arithmetic is testable without any aggregate scaffolding. All band
//! comparisons happen after banker's rounding at [`MAX_SCALE`] digits.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::event::{AggregateType, DomainEvent, EventType};
use crate::id::{InvoiceId, MerchantId, PaymentId};
use crate::merchant::Merchant;
use crate::money::{Currency, Money, MoneyError, MAX_SCALE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Created,
    Pending,
    Partial,
    Paid,
    Overpaid,
    Expired,
    Cancelled,
}

impl InvoiceStatus {
    /// Open invoices can still receive attributed payments or expire.
    pub fn is_open(&self) -> bool {
        matches!(
            self,
            InvoiceStatus::Created | InvoiceStatus::Pending | InvoiceStatus::Partial
        )
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_open()
    }
}

impl fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InvoiceStatus::Created => "created",
            InvoiceStatus::Pending => "pending",
            InvoiceStatus::Partial => "partial",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::Overpaid => "overpaid",
            InvoiceStatus::Expired => "expired",
            InvoiceStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Legal invoice status transitions. `partial -> partial` self-loops on each
/// additional payment and is implied.
pub const INVOICE_TRANSITIONS: &[(InvoiceStatus, InvoiceStatus)] = &[
    (InvoiceStatus::Created, InvoiceStatus::Pending),
    (InvoiceStatus::Created, InvoiceStatus::Partial),
    (InvoiceStatus::Created, InvoiceStatus::Paid),
    (InvoiceStatus::Created, InvoiceStatus::Overpaid),
    (InvoiceStatus::Created, InvoiceStatus::Expired),
    (InvoiceStatus::Created, InvoiceStatus::Cancelled),
    (InvoiceStatus::Pending, InvoiceStatus::Partial),
    (InvoiceStatus::Pending, InvoiceStatus::Paid),
    (InvoiceStatus::Pending, InvoiceStatus::Overpaid),
    (InvoiceStatus::Pending, InvoiceStatus::Expired),
    (InvoiceStatus::Pending, InvoiceStatus::Cancelled),
    (InvoiceStatus::Partial, InvoiceStatus::Paid),
    (InvoiceStatus::Partial, InvoiceStatus::Overpaid),
    (InvoiceStatus::Partial, InvoiceStatus::Expired),
    (InvoiceStatus::Partial, InvoiceStatus::Cancelled),
];

pub fn can_transition(from: InvoiceStatus, to: InvoiceStatus) -> bool {
    (from == InvoiceStatus::Partial && to == InvoiceStatus::Partial)
        || INVOICE_TRANSITIONS.contains(&(from, to))
}

/// What a merchant wants done with funds beyond the overpayment threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverpaymentAction {
    CreditAccount,
    Refund,
    Accept,
}

/// The acceptable under/overpayment band around the invoice total.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentTolerance {
    /// Accepted shortfall as a fraction of the total, in `[0, 1]`.
    pub underpayment_threshold: Decimal,
    /// Accepted excess as an absolute amount in the invoice currency.
    pub overpayment_threshold: Decimal,
    pub overpayment_action: OverpaymentAction,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ToleranceError {
    #[error("Underpayment threshold {0} outside [0, 1]")]
    UnderpaymentOutOfBounds(Decimal),
    #[error("Overpayment threshold must be non-negative, got {0}")]
    NegativeOverpayment(Decimal),
}

/// Outcome of resolving a paid amount against the tolerance band.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentResolution {
    /// Below the band: the invoice stays (or becomes) partially paid.
    Partial,
    /// Within the band, or above it with `overpayment_action = accept`.
    Paid,
    /// Above the band and the merchant wants the excess handled.
    Overpaid,
}

impl PaymentTolerance {
    pub fn validate(&self) -> Result<(), ToleranceError> {
        if self.underpayment_threshold < Decimal::ZERO
            || self.underpayment_threshold > Decimal::ONE
        {
            return Err(ToleranceError::UnderpaymentOutOfBounds(
                self.underpayment_threshold,
            ));
        }
        if self.overpayment_threshold < Decimal::ZERO {
            return Err(ToleranceError::NegativeOverpayment(
                self.overpayment_threshold,
            ));
        }
        Ok(())
    }

    /// Places `paid` relative to the band `[total·(1−U), total+O]`.
    ///
    /// Exact equality with either bound lands inside the band. `paid = total`
    /// is always `Paid` since `total` lies inside every valid band.
    pub fn resolve(&self, total: Decimal, paid: Decimal) -> PaymentResolution {
        let round =
            |d: Decimal| d.round_dp_with_strategy(MAX_SCALE, RoundingStrategy::MidpointNearestEven);
        let paid = round(paid);
        let lower = round(total * (Decimal::ONE - self.underpayment_threshold));
        let upper = round(total + self.overpayment_threshold);
        if paid < lower {
            PaymentResolution::Partial
        } else if paid <= upper {
            PaymentResolution::Paid
        } else if self.overpayment_action == OverpaymentAction::Accept {
            PaymentResolution::Paid
        } else {
            PaymentResolution::Overpaid
        }
    }
}

impl Default for PaymentTolerance {
    fn default() -> Self {
        PaymentTolerance {
            underpayment_threshold: Decimal::new(1, 2), // 1%
            overpayment_threshold: Decimal::ZERO,
            overpayment_action: OverpaymentAction::CreditAccount,
        }
    }
}

/// A priced line on the invoice.
///
/// `line_total` is always derived from `unit_price × quantity`; wire input
/// never supplies it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InvoiceItem {
    pub description: String,
    pub unit_price: Money,
    pub quantity: u32,
    pub line_total: Money,
}

impl<'de> Deserialize<'de> for InvoiceItem {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct ItemWire {
            description: String,
            unit_price: Money,
            quantity: u32,
        }
        let wire = ItemWire::deserialize(deserializer)?;
        InvoiceItem::new(wire.description, wire.unit_price, wire.quantity)
            .map_err(serde::de::Error::custom)
    }
}

impl InvoiceItem {
    pub fn new(
        description: impl Into<String>,
        unit_price: Money,
        quantity: u32,
    ) -> Result<Self, InvoiceError> {
        let description = description.into();
        if description.trim().is_empty() {
            return Err(InvoiceError::EmptyItemDescription);
        }
        if quantity == 0 {
            return Err(InvoiceError::ZeroQuantity);
        }
        let line_total = unit_price.mul_rate(Decimal::from(quantity))?;
        Ok(InvoiceItem {
            description,
            unit_price,
            quantity,
            line_total,
        })
    }
}

/// How tax is levied on the subtotal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Tax {
    None,
    /// Non-negative rate applied to the subtotal, rounded half-away at cents.
    Rate { rate: Decimal },
    /// A fixed amount in the invoice currency.
    Amount { amount: Money },
}

/// Subtotal, tax and total, all in one fiat currency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pricing {
    pub subtotal: Money,
    pub tax: Money,
    pub total: Money,
}

impl Pricing {
    /// Computes pricing from line items and the tax mode. All items must be
    /// in the same fiat currency.
    pub fn compute(items: &[InvoiceItem], tax: &Tax) -> Result<Pricing, InvoiceError> {
        let first = items.first().ok_or(InvoiceError::EmptyItems)?;
        let currency = first.unit_price.currency();
        if !currency.is_fiat() {
            return Err(InvoiceError::NonFiatPricing(currency));
        }
        let mut subtotal = Money::zero(currency);
        for item in items {
            subtotal = subtotal.checked_add(&item.line_total)?;
        }
        let tax = match tax {
            Tax::None => Money::zero(currency),
            Tax::Rate { rate } => {
                if rate.is_sign_negative() {
                    return Err(InvoiceError::NegativeTaxRate(*rate));
                }
                subtotal.mul_rate(*rate)?.round_half_away(2)
            }
            Tax::Amount { amount } => {
                if amount.currency() != currency {
                    return Err(InvoiceError::Money(MoneyError::CurrencyMismatch {
                        left: currency,
                        right: amount.currency(),
                    }));
                }
                *amount
            }
        };
        let total = subtotal.checked_add(&tax)?;
        Ok(Pricing {
            subtotal,
            tax,
            total,
        })
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum InvoiceError {
    #[error("Merchant is not active")]
    MerchantNotActive,
    #[error("Invoice title must not be empty")]
    EmptyTitle,
    #[error("Invoice requires at least one item")]
    EmptyItems,
    #[error("Item description must not be empty")]
    EmptyItemDescription,
    #[error("Item quantity must be at least 1")]
    ZeroQuantity,
    #[error("Pricing currency {0} is not fiat")]
    NonFiatPricing(Currency),
    #[error("Tax rate must be non-negative, got {0}")]
    NegativeTaxRate(Decimal),
    #[error("Unsupported settlement currency {0}; only USDT is quoted 1:1")]
    UnsupportedCryptoCurrency(Currency),
    #[error(transparent)]
    Money(#[from] MoneyError),
    #[error(transparent)]
    Tolerance(#[from] ToleranceError),
    #[error("Invoice is {0}; operation requires an open invoice")]
    NotOpen(InvoiceStatus),
    #[error("Illegal status transition: {from} -> {to}")]
    IllegalTransition {
        from: InvoiceStatus,
        to: InvoiceStatus,
    },
    #[error("Payment address already assigned")]
    AddressAlreadyAssigned,
    #[error("Invoice has not reached its expiry time yet")]
    NotYetExpired,
    #[error("Invoice event stream is empty or does not start with creation")]
    CorruptStream,
}

/// Parameters for creating an invoice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewInvoice {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub items: Vec<InvoiceItem>,
    #[serde(default = "default_tax")]
    pub tax: Tax,
    /// Settlement currency; only USDT is supported (1:1 with the fiat total).
    pub crypto_currency: Currency,
    /// Overrides the merchant's default tolerance when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tolerance: Option<PaymentTolerance>,
    /// Overrides the merchant's default expiry when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in_minutes: Option<u32>,
}

fn default_tax() -> Tax {
    Tax::None
}

/// Events emitted by the invoice aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InvoiceEvent {
    Created {
        invoice_id: InvoiceId,
        merchant_id: MerchantId,
        title: String,
        description: String,
        items: Vec<InvoiceItem>,
        pricing: Pricing,
        crypto_currency: Currency,
        crypto_amount: Money,
        tolerance: PaymentTolerance,
        expires_at: DateTime<Utc>,
        created_at: DateTime<Utc>,
    },
    Viewed {
        at: DateTime<Utc>,
    },
    PaymentAddressAssigned {
        address: String,
        at: DateTime<Utc>,
    },
    PartialPayment {
        payment_id: PaymentId,
        amount: Money,
        paid_amount: Money,
        remaining: Money,
        at: DateTime<Utc>,
    },
    Paid {
        payment_id: PaymentId,
        amount: Money,
        paid_amount: Money,
        at: DateTime<Utc>,
    },
    Overpaid {
        payment_id: PaymentId,
        amount: Money,
        paid_amount: Money,
        overpayment_amount: Money,
        at: DateTime<Utc>,
    },
    Expired {
        at: DateTime<Utc>,
    },
    Cancelled {
        reason: String,
        at: DateTime<Utc>,
    },
}

impl DomainEvent for InvoiceEvent {
    fn event_type(&self) -> EventType {
        match self {
            InvoiceEvent::Created { .. } => EventType::InvoiceCreated,
            InvoiceEvent::Viewed { .. } => EventType::InvoiceViewed,
            InvoiceEvent::PaymentAddressAssigned { .. } => {
                EventType::InvoicePaymentAddressAssigned
            }
            InvoiceEvent::PartialPayment { .. } => EventType::InvoicePartial,
            InvoiceEvent::Paid { .. } => EventType::InvoicePaid,
            InvoiceEvent::Overpaid { .. } => EventType::InvoiceOverpaid,
            InvoiceEvent::Expired { .. } => EventType::InvoiceExpired,
            InvoiceEvent::Cancelled { .. } => EventType::InvoiceCancelled,
        }
    }

    fn aggregate_type() -> AggregateType {
        AggregateType::Invoice
    }
}

/// The invoice aggregate, rebuilt by replaying its event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    pub id: InvoiceId,
    pub merchant_id: MerchantId,
    pub title: String,
    pub description: String,
    pub items: Vec<InvoiceItem>,
    pub pricing: Pricing,
    pub crypto_currency: Currency,
    pub crypto_amount: Money,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_address: Option<String>,
    pub status: InvoiceStatus,
    pub tolerance: PaymentTolerance,
    pub expires_at: DateTime<Utc>,
    pub paid_amount: Money,
    pub attributed_payments: Vec<PaymentId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paid_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancellation_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Invoice {
    /// Command: create an invoice for an active merchant.
    ///
    /// Subtotal is the sum of line totals; tax per [`Tax`]; the USDT amount
    /// equals the fiat total 1:1.
    pub fn create(merchant: &Merchant, new: NewInvoice) -> Result<InvoiceEvent, InvoiceError> {
        if !merchant.is_active() {
            return Err(InvoiceError::MerchantNotActive);
        }
        if new.title.trim().is_empty() {
            return Err(InvoiceError::EmptyTitle);
        }
        if new.items.is_empty() {
            return Err(InvoiceError::EmptyItems);
        }
        if new.crypto_currency != Currency::Usdt {
            return Err(InvoiceError::UnsupportedCryptoCurrency(new.crypto_currency));
        }
        let pricing = Pricing::compute(&new.items, &new.tax)?;
        let tolerance = new
            .tolerance
            .unwrap_or_else(|| merchant.settings.default_tolerance.clone());
        tolerance.validate()?;
        let crypto_amount = Money::new(pricing.total.amount(), Currency::Usdt)?;
        let created_at = Utc::now();
        let expiry_minutes = new
            .expires_in_minutes
            .unwrap_or(merchant.settings.invoice_expiry_minutes);
        let expires_at = created_at + Duration::minutes(i64::from(expiry_minutes));
        Ok(InvoiceEvent::Created {
            invoice_id: InvoiceId::generate(),
            merchant_id: merchant.id,
            title: new.title,
            description: new.description,
            items: new.items,
            pricing,
            crypto_currency: new.crypto_currency,
            crypto_amount,
            tolerance,
            expires_at,
            created_at,
        })
    }

    /// Command: first public page fetch moves `created -> pending`.
    /// Returns `None` for any later view.
    pub fn view(&self) -> Option<InvoiceEvent> {
        if self.status == InvoiceStatus::Created {
            Some(InvoiceEvent::Viewed { at: Utc::now() })
        } else {
            None
        }
    }

    /// Command: assign the unique payment address for this invoice.
    pub fn assign_payment_address(
        &self,
        address: impl Into<String>,
    ) -> Result<InvoiceEvent, InvoiceError> {
        if !self.status.is_open() {
            return Err(InvoiceError::NotOpen(self.status));
        }
        if self.payment_address.is_some() {
            return Err(InvoiceError::AddressAlreadyAssigned);
        }
        Ok(InvoiceEvent::PaymentAddressAssigned {
            address: address.into(),
            at: Utc::now(),
        })
    }

    /// Command: attribute a confirmed payment and drive the status machine.
    ///
    /// The running `paid_amount` is the sum of attributed confirmed payments;
    /// the tolerance band then decides partial/paid/overpaid.
    pub fn attribute_payment(
        &self,
        payment_id: PaymentId,
        amount: Money,
    ) -> Result<InvoiceEvent, InvoiceError> {
        if !self.status.is_open() {
            return Err(InvoiceError::NotOpen(self.status));
        }
        let paid_amount = self.paid_amount.checked_add(&amount)?;
        let at = Utc::now();
        let resolution = self
            .tolerance
            .resolve(self.crypto_amount.amount(), paid_amount.amount());
        let event = match resolution {
            PaymentResolution::Partial => InvoiceEvent::PartialPayment {
                payment_id,
                amount,
                remaining: self
                    .crypto_amount
                    .saturating_sub(&paid_amount)?,
                paid_amount,
                at,
            },
            PaymentResolution::Paid => InvoiceEvent::Paid {
                payment_id,
                amount,
                paid_amount,
                at,
            },
            PaymentResolution::Overpaid => InvoiceEvent::Overpaid {
                payment_id,
                amount,
                overpayment_amount: paid_amount.checked_sub(&self.crypto_amount)?,
                paid_amount,
                at,
            },
        };
        Ok(event)
    }

    /// Command: expire an open invoice whose deadline has passed.
    pub fn expire(&self, now: DateTime<Utc>) -> Result<InvoiceEvent, InvoiceError> {
        if !self.status.is_open() {
            return Err(InvoiceError::NotOpen(self.status));
        }
        if now <= self.expires_at {
            return Err(InvoiceError::NotYetExpired);
        }
        Ok(InvoiceEvent::Expired { at: now })
    }

    /// Command: cancel an open invoice.
    pub fn cancel(&self, reason: impl Into<String>) -> Result<InvoiceEvent, InvoiceError> {
        if !can_transition(self.status, InvoiceStatus::Cancelled) {
            return Err(InvoiceError::IllegalTransition {
                from: self.status,
                to: InvoiceStatus::Cancelled,
            });
        }
        Ok(InvoiceEvent::Cancelled {
            reason: reason.into(),
            at: Utc::now(),
        })
    }

    /// Amount still owed, clamped at zero.
    pub fn remaining(&self) -> Money {
        self.crypto_amount
            .saturating_sub(&self.paid_amount)
            .unwrap_or_else(|_| Money::zero(self.crypto_currency))
    }

    /// Rebuilds the aggregate from its ordered event stream.
    pub fn from_events<'a, I>(events: I) -> Result<Invoice, InvoiceError>
    where
        I: IntoIterator<Item = &'a InvoiceEvent>,
    {
        let mut iter = events.into_iter();
        let mut invoice = match iter.next() {
            Some(InvoiceEvent::Created {
                invoice_id,
                merchant_id,
                title,
                description,
                items,
                pricing,
                crypto_currency,
                crypto_amount,
                tolerance,
                expires_at,
                created_at,
            }) => Invoice {
                id: *invoice_id,
                merchant_id: *merchant_id,
                title: title.clone(),
                description: description.clone(),
                items: items.clone(),
                pricing: pricing.clone(),
                crypto_currency: *crypto_currency,
                crypto_amount: *crypto_amount,
                payment_address: None,
                status: InvoiceStatus::Created,
                tolerance: tolerance.clone(),
                expires_at: *expires_at,
                paid_amount: Money::zero(*crypto_currency),
                attributed_payments: Vec::new(),
                paid_at: None,
                cancellation_reason: None,
                created_at: *created_at,
                updated_at: *created_at,
            },
            _ => return Err(InvoiceError::CorruptStream),
        };
        for event in iter {
            invoice.apply(event);
        }
        Ok(invoice)
    }

    /// Applies one post-creation event.
    pub fn apply(&mut self, event: &InvoiceEvent) {
        match event {
            InvoiceEvent::Created { .. } => {}
            InvoiceEvent::Viewed { at } => {
                if self.status == InvoiceStatus::Created {
                    self.status = InvoiceStatus::Pending;
                }
                self.updated_at = *at;
            }
            InvoiceEvent::PaymentAddressAssigned { address, at } => {
                self.payment_address = Some(address.clone());
                self.updated_at = *at;
            }
            InvoiceEvent::PartialPayment {
                payment_id,
                paid_amount,
                at,
                ..
            } => {
                self.status = InvoiceStatus::Partial;
                self.paid_amount = *paid_amount;
                self.attributed_payments.push(*payment_id);
                self.updated_at = *at;
            }
            InvoiceEvent::Paid {
                payment_id,
                paid_amount,
                at,
                ..
            } => {
                self.status = InvoiceStatus::Paid;
                self.paid_amount = *paid_amount;
                self.attributed_payments.push(*payment_id);
                self.paid_at = Some(*at);
                self.updated_at = *at;
            }
            InvoiceEvent::Overpaid {
                payment_id,
                paid_amount,
                at,
                ..
            } => {
                self.status = InvoiceStatus::Overpaid;
                self.paid_amount = *paid_amount;
                self.attributed_payments.push(*payment_id);
                self.paid_at = Some(*at);
                self.updated_at = *at;
            }
            InvoiceEvent::Expired { at } => {
                self.status = InvoiceStatus::Expired;
                self.updated_at = *at;
            }
            InvoiceEvent::Cancelled { reason, at } => {
                self.status = InvoiceStatus::Cancelled;
                self.cancellation_reason = Some(reason.clone());
                self.updated_at = *at;
            }
        }
    }
}
