//! Settlement: the bookkeeping record of the platform fee deduction.
//!
//! Settlement never moves funds; it records, for a paid or overpaid invoice,
//! the gross amount (the invoice total), the platform fee at the merchant's
//! rate at the instant of settlement, and the merchant's net. Overpayment is
//! recorded separately and is not settled to the merchant.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::event::{AggregateType, DomainEvent, EventType};
use crate::id::{InvoiceId, MerchantId, PaymentId, SettlementId};
use crate::invoice::{Invoice, InvoiceStatus};
use crate::money::{Money, MoneyError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementStatus {
    Pending,
    Completed,
    Failed,
}

impl fmt::Display for SettlementStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SettlementStatus::Pending => "pending",
            SettlementStatus::Completed => "completed",
            SettlementStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum SettlementError {
    #[error("Invoice is {0}; settlement requires paid or overpaid")]
    InvoiceNotSettleable(InvoiceStatus),
    #[error("Invoice has no attributed payments")]
    NoPayments,
    #[error(transparent)]
    Money(#[from] MoneyError),
}

/// Events emitted when a settlement is recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SettlementEvent {
    Completed {
        settlement_id: SettlementId,
        invoice_id: InvoiceId,
        merchant_id: MerchantId,
        gross_amount: Money,
        platform_fee: Money,
        net_amount: Money,
        fee_rate_applied: Decimal,
        payment_ids: Vec<PaymentId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        overpayment_amount: Option<Money>,
        settled_at: DateTime<Utc>,
    },
    Failed {
        settlement_id: SettlementId,
        invoice_id: InvoiceId,
        reason: String,
        at: DateTime<Utc>,
    },
}

impl DomainEvent for SettlementEvent {
    fn event_type(&self) -> EventType {
        match self {
            SettlementEvent::Completed { .. } => EventType::SettlementCompleted,
            SettlementEvent::Failed { .. } => EventType::SettlementFailed,
        }
    }

    fn aggregate_type() -> AggregateType {
        AggregateType::Settlement
    }
}

/// The settlement record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settlement {
    pub id: SettlementId,
    pub invoice_id: InvoiceId,
    pub merchant_id: MerchantId,
    pub gross_amount: Money,
    pub platform_fee: Money,
    pub net_amount: Money,
    pub fee_rate_applied: Decimal,
    pub status: SettlementStatus,
    pub payment_ids: Vec<PaymentId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overpayment_amount: Option<Money>,
    pub settled_at: DateTime<Utc>,
}

impl Settlement {
    /// Computes the settlement for a paid or overpaid invoice.
    ///
    /// `platform_fee = round_half_away(total × fee_rate, 2)` and
    /// `net = gross − fee`, so `gross = fee + net` holds exactly. The fee
    /// rate is the merchant's rate at this instant.
    pub fn compute(invoice: &Invoice, fee_rate: Decimal) -> Result<SettlementEvent, SettlementError> {
        if !matches!(
            invoice.status,
            InvoiceStatus::Paid | InvoiceStatus::Overpaid
        ) {
            return Err(SettlementError::InvoiceNotSettleable(invoice.status));
        }
        if invoice.attributed_payments.is_empty() {
            return Err(SettlementError::NoPayments);
        }
        let gross_amount = invoice.pricing.total;
        let platform_fee = gross_amount.mul_rate(fee_rate)?.round_half_away(2);
        let net_amount = gross_amount.checked_sub(&platform_fee)?;
        let overpayment = invoice.paid_amount.saturating_sub(&invoice.crypto_amount)?;
        let overpayment_amount = if overpayment.is_zero() {
            None
        } else {
            Some(overpayment)
        };
        Ok(SettlementEvent::Completed {
            settlement_id: SettlementId::generate(),
            invoice_id: invoice.id,
            merchant_id: invoice.merchant_id,
            gross_amount,
            platform_fee,
            net_amount,
            fee_rate_applied: fee_rate,
            payment_ids: invoice.attributed_payments.clone(),
            overpayment_amount,
            settled_at: Utc::now(),
        })
    }

    /// Materializes the record from its completion event.
    pub fn from_event(event: &SettlementEvent) -> Option<Settlement> {
        match event {
            SettlementEvent::Completed {
                settlement_id,
                invoice_id,
                merchant_id,
                gross_amount,
                platform_fee,
                net_amount,
                fee_rate_applied,
                payment_ids,
                overpayment_amount,
                settled_at,
            } => Some(Settlement {
                id: *settlement_id,
                invoice_id: *invoice_id,
                merchant_id: *merchant_id,
                gross_amount: *gross_amount,
                platform_fee: *platform_fee,
                net_amount: *net_amount,
                fee_rate_applied: *fee_rate_applied,
                status: SettlementStatus::Completed,
                payment_ids: payment_ids.clone(),
                overpayment_amount: *overpayment_amount,
                settled_at: *settled_at,
            }),
            SettlementEvent::Failed { .. } => None,
        }
    }
}
