//! Payment aggregate: per-transaction lifecycle from detection to
//! confirmation.
//!
//! A payment is materialized from an externally observed transaction; the
//! transaction hash is its natural key and repeated observations are
//! idempotent. The confirmation requirement is the merchant override when
//! present, otherwise the amount-based step function declared in
//! [`CONFIRMATION_TIERS`].

use chrono::{DateTime, Duration, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::event::{AggregateType, DomainEvent, EventType};
use crate::id::{InvoiceId, PaymentId};
use crate::money::Money;

/// Amount-based confirmation requirements on the USD-equivalent value:
/// up to each bound (inclusive) the listed count applies.
pub const CONFIRMATION_TIERS: &[(Decimal, u32)] = &[
    (Decimal::from_parts(100, 0, 0, false, 0), 1),
    (Decimal::from_parts(1_000, 0, 0, false, 0), 6),
    (Decimal::from_parts(10_000, 0, 0, false, 0), 12),
];

/// Confirmations required above the last tier bound.
pub const MAX_TIER_CONFIRMATIONS: u32 = 19;

/// Resolves the confirmation requirement for a payment.
pub fn required_confirmations(usd_equivalent: Decimal, merchant_override: Option<u32>) -> u32 {
    if let Some(required) = merchant_override {
        return required;
    }
    for (bound, confirmations) in CONFIRMATION_TIERS {
        if usd_equivalent <= *bound {
            return *confirmations;
        }
    }
    MAX_TIER_CONFIRMATIONS
}

static TX_HASH_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9a-fA-F]{64}$").expect("Invalid tx hash regex"));

static TRON_ADDRESS_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^T[1-9A-HJ-NP-Za-km-z]{33}$").expect("Invalid tron address regex")
});

/// A Tron transaction hash: 64 hex characters, stored lowercase.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxHash(String);

impl TxHash {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TxHash {
    type Err = PaymentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if TX_HASH_REGEX.is_match(s) {
            Ok(TxHash(s.to_ascii_lowercase()))
        } else {
            Err(PaymentError::InvalidTxHash(s.to_string()))
        }
    }
}

/// A base58check Tron address (`T` prefix, 34 characters).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TronAddress(String);

impl TronAddress {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TronAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TronAddress {
    type Err = PaymentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if TRON_ADDRESS_REGEX.is_match(s) {
            Ok(TronAddress(s.to_string()))
        } else {
            Err(PaymentError::InvalidAddress(s.to_string()))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Detected,
    Confirming,
    Confirmed,
    Failed,
    Orphaned,
}

impl PaymentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PaymentStatus::Confirmed | PaymentStatus::Failed | PaymentStatus::Orphaned
        )
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PaymentStatus::Detected => "detected",
            PaymentStatus::Confirming => "confirming",
            PaymentStatus::Confirmed => "confirmed",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Orphaned => "orphaned",
        };
        write!(f, "{s}")
    }
}

/// Legal payment status transitions.
pub const PAYMENT_TRANSITIONS: &[(PaymentStatus, PaymentStatus)] = &[
    (PaymentStatus::Detected, PaymentStatus::Confirming),
    (PaymentStatus::Confirming, PaymentStatus::Confirmed),
    (PaymentStatus::Confirming, PaymentStatus::Failed),
    (PaymentStatus::Detected, PaymentStatus::Orphaned),
];

pub fn can_transition(from: PaymentStatus, to: PaymentStatus) -> bool {
    PAYMENT_TRANSITIONS.contains(&(from, to))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentFailureReason {
    ConfirmationTimeout,
    TransactionReverted,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum PaymentError {
    #[error("Invalid transaction hash: {0}")]
    InvalidTxHash(String),
    #[error("Invalid Tron address: {0}")]
    InvalidAddress(String),
    #[error("Illegal status transition: {from} -> {to}")]
    IllegalTransition {
        from: PaymentStatus,
        to: PaymentStatus,
    },
    #[error("Payment is already attributed to invoice {0}")]
    AlreadyAttributed(InvoiceId),
    #[error("Payment must be confirmed before attribution, is {0}")]
    NotConfirmed(PaymentStatus),
    #[error("Confirmation deadline has not passed")]
    DeadlineNotReached,
    #[error("Payment event stream is empty or does not start with detection")]
    CorruptStream,
}

/// An externally observed on-chain transaction, as submitted by the watcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentObserved {
    pub tx_hash: TxHash,
    pub from_address: TronAddress,
    pub to_address: TronAddress,
    pub amount: Money,
    pub block_number: u64,
    pub confirmations: u32,
    pub network_fee: Money,
    /// Explicit attribution hint; `to_address` remains authoritative when
    /// absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invoice_id: Option<InvoiceId>,
}

/// Events emitted by the payment aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PaymentEvent {
    Detected {
        payment_id: PaymentId,
        tx_hash: TxHash,
        from_address: TronAddress,
        to_address: TronAddress,
        amount: Money,
        block_number: u64,
        confirmations: u32,
        network_fee: Money,
        required_confirmations: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        invoice_hint: Option<InvoiceId>,
        detected_at: DateTime<Utc>,
    },
    Confirming {
        confirmations: u32,
        block_number: u64,
        at: DateTime<Utc>,
    },
    Confirmed {
        confirmations: u32,
        confirmed_at: DateTime<Utc>,
    },
    Attributed {
        invoice_id: InvoiceId,
        at: DateTime<Utc>,
    },
    Failed {
        reason: PaymentFailureReason,
        at: DateTime<Utc>,
    },
    Orphaned {
        at: DateTime<Utc>,
    },
    /// Operational record: no open invoice could be found for this payment.
    /// The payment itself keeps its state; it is surfaced, never dropped.
    Unmatched {
        reason: String,
        at: DateTime<Utc>,
    },
}

impl DomainEvent for PaymentEvent {
    fn event_type(&self) -> EventType {
        match self {
            PaymentEvent::Detected { .. } => EventType::PaymentDetected,
            PaymentEvent::Confirming { .. } => EventType::PaymentConfirming,
            PaymentEvent::Confirmed { .. } => EventType::PaymentConfirmed,
            PaymentEvent::Attributed { .. } => EventType::PaymentAttributed,
            PaymentEvent::Failed { .. } => EventType::PaymentFailed,
            PaymentEvent::Orphaned { .. } => EventType::PaymentOrphaned,
            PaymentEvent::Unmatched { .. } => EventType::PaymentUnmatched,
        }
    }

    fn aggregate_type() -> AggregateType {
        AggregateType::Payment
    }
}

/// The payment aggregate, rebuilt by replaying its event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub id: PaymentId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invoice_id: Option<InvoiceId>,
    pub tx_hash: TxHash,
    pub from_address: TronAddress,
    pub to_address: TronAddress,
    pub amount: Money,
    pub block_number: u64,
    pub confirmations: u32,
    pub required_confirmations: u32,
    pub status: PaymentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invoice_hint: Option<InvoiceId>,
    pub network_fee: Money,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<PaymentFailureReason>,
    pub detected_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmed_at: Option<DateTime<Utc>>,
}

impl Payment {
    /// Command: materialize a new payment from an observed transaction.
    ///
    /// `required` comes from [`required_confirmations`] evaluated against the
    /// owning merchant's settings.
    pub fn detect(observed: &PaymentObserved, required: u32) -> PaymentEvent {
        PaymentEvent::Detected {
            payment_id: PaymentId::generate(),
            tx_hash: observed.tx_hash.clone(),
            from_address: observed.from_address.clone(),
            to_address: observed.to_address.clone(),
            amount: observed.amount,
            block_number: observed.block_number,
            confirmations: observed.confirmations,
            network_fee: observed.network_fee,
            required_confirmations: required,
            invoice_hint: observed.invoice_id,
            detected_at: Utc::now(),
        }
    }

    /// Command: process a repeated observation of the same transaction hash.
    ///
    /// Idempotent: stale or unchanged confirmation counts produce no events;
    /// otherwise the payment advances through `confirming` and, once the
    /// requirement is met, to `confirmed`.
    pub fn update_confirmations(
        &self,
        confirmations: u32,
        block_number: u64,
    ) -> Vec<PaymentEvent> {
        if self.status.is_terminal() || confirmations == 0 {
            return Vec::new();
        }
        // A freshly detected payment may already carry confirmations from
        // its first sighting; those still need the confirming transition.
        if self.status != PaymentStatus::Detected && confirmations <= self.confirmations {
            return Vec::new();
        }
        let at = Utc::now();
        let mut events = vec![PaymentEvent::Confirming {
            confirmations,
            block_number,
            at,
        }];
        if confirmations >= self.required_confirmations {
            events.push(PaymentEvent::Confirmed {
                confirmations,
                confirmed_at: at,
            });
        }
        events
    }

    /// Command: bind this confirmed payment to an invoice.
    pub fn attribute(&self, invoice_id: InvoiceId) -> Result<PaymentEvent, PaymentError> {
        if let Some(existing) = self.invoice_id {
            return Err(PaymentError::AlreadyAttributed(existing));
        }
        if self.status != PaymentStatus::Confirmed {
            return Err(PaymentError::NotConfirmed(self.status));
        }
        Ok(PaymentEvent::Attributed {
            invoice_id,
            at: Utc::now(),
        })
    }

    /// Command: fail a payment stuck in `confirming` past the deadline.
    pub fn fail_on_timeout(
        &self,
        now: DateTime<Utc>,
        deadline: Duration,
    ) -> Result<PaymentEvent, PaymentError> {
        if self.status != PaymentStatus::Confirming {
            return Err(PaymentError::IllegalTransition {
                from: self.status,
                to: PaymentStatus::Failed,
            });
        }
        if now < self.detected_at + deadline {
            return Err(PaymentError::DeadlineNotReached);
        }
        Ok(PaymentEvent::Failed {
            reason: PaymentFailureReason::ConfirmationTimeout,
            at: now,
        })
    }

    /// Command: the containing block was reorged out before confirmations
    /// started accruing.
    pub fn orphan(&self) -> Result<PaymentEvent, PaymentError> {
        if !can_transition(self.status, PaymentStatus::Orphaned) {
            return Err(PaymentError::IllegalTransition {
                from: self.status,
                to: PaymentStatus::Orphaned,
            });
        }
        Ok(PaymentEvent::Orphaned { at: Utc::now() })
    }

    /// Rebuilds the aggregate from its ordered event stream.
    pub fn from_events<'a, I>(events: I) -> Result<Payment, PaymentError>
    where
        I: IntoIterator<Item = &'a PaymentEvent>,
    {
        let mut iter = events.into_iter();
        let mut payment = match iter.next() {
            Some(PaymentEvent::Detected {
                payment_id,
                tx_hash,
                from_address,
                to_address,
                amount,
                block_number,
                confirmations,
                network_fee,
                required_confirmations,
                invoice_hint,
                detected_at,
            }) => Payment {
                id: *payment_id,
                invoice_id: None,
                tx_hash: tx_hash.clone(),
                from_address: from_address.clone(),
                to_address: to_address.clone(),
                amount: *amount,
                block_number: *block_number,
                confirmations: *confirmations,
                required_confirmations: *required_confirmations,
                status: PaymentStatus::Detected,
                invoice_hint: *invoice_hint,
                network_fee: *network_fee,
                failure_reason: None,
                detected_at: *detected_at,
                confirmed_at: None,
            },
            _ => return Err(PaymentError::CorruptStream),
        };
        for event in iter {
            payment.apply(event);
        }
        Ok(payment)
    }

    /// Applies one post-detection event.
    pub fn apply(&mut self, event: &PaymentEvent) {
        match event {
            PaymentEvent::Detected { .. } => {}
            PaymentEvent::Confirming {
                confirmations,
                block_number,
                ..
            } => {
                self.status = PaymentStatus::Confirming;
                self.confirmations = *confirmations;
                self.block_number = *block_number;
            }
            PaymentEvent::Confirmed {
                confirmations,
                confirmed_at,
            } => {
                self.status = PaymentStatus::Confirmed;
                self.confirmations = *confirmations;
                self.confirmed_at = Some(*confirmed_at);
            }
            PaymentEvent::Attributed { invoice_id, .. } => {
                self.invoice_id = Some(*invoice_id);
            }
            PaymentEvent::Failed { reason, at: _ } => {
                self.status = PaymentStatus::Failed;
                self.failure_reason = Some(*reason);
            }
            PaymentEvent::Orphaned { .. } => {
                self.status = PaymentStatus::Orphaned;
            }
            PaymentEvent::Unmatched { .. } => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::money::Currency;
    use rust_decimal_macros::dec;

    fn usdt(amount: Decimal) -> Money {
        Money::new(amount, Currency::Usdt).unwrap()
    }

    fn observed(amount: Decimal, confirmations: u32) -> PaymentObserved {
        PaymentObserved {
            tx_hash: "ab".repeat(32).parse().unwrap(),
            from_address: "TXYZopqrstuvwxyzABCDEFGHijkmnopqrs".parse().unwrap(),
            to_address: "TAbcdefghijkmnopqrstuvwxyz12345678".parse().unwrap(),
            amount: usdt(amount),
            block_number: 100,
            confirmations,
            network_fee: usdt(dec!(0.5)),
            invoice_id: None,
        }
    }

    fn detected(amount: Decimal) -> Payment {
        let event = Payment::detect(&observed(amount, 0), required_confirmations(amount, None));
        Payment::from_events([&event]).unwrap()
    }

    #[test]
    fn test_required_confirmations_step_function() {
        assert_eq!(required_confirmations(dec!(1), None), 1);
        assert_eq!(required_confirmations(dec!(100), None), 1);
        assert_eq!(required_confirmations(dec!(100.01), None), 6);
        assert_eq!(required_confirmations(dec!(1000), None), 6);
        assert_eq!(required_confirmations(dec!(5000), None), 12);
        assert_eq!(required_confirmations(dec!(10000), None), 12);
        assert_eq!(required_confirmations(dec!(10000.01), None), 19);
    }

    #[test]
    fn test_merchant_override_wins() {
        assert_eq!(required_confirmations(dec!(1), Some(25)), 25);
        assert_eq!(required_confirmations(dec!(50000), Some(3)), 3);
    }

    #[test]
    fn test_tx_hash_normalizes_case() {
        let hash: TxHash = "AB".repeat(32).parse().unwrap();
        assert_eq!(hash.as_str(), "ab".repeat(32));
        assert!("xyz".parse::<TxHash>().is_err());
        assert!("ab".repeat(31).parse::<TxHash>().is_err());
    }

    #[test]
    fn test_tron_address_validation() {
        assert!("TAbcdefghijkmnopqrstuvwxyz12345678"
            .parse::<TronAddress>()
            .is_ok());
        // Wrong prefix, wrong length, forbidden base58 characters.
        assert!("XAbcdefghijkmnopqrstuvwxyz12345678"
            .parse::<TronAddress>()
            .is_err());
        assert!("TAbc".parse::<TronAddress>().is_err());
        assert!("TAbcdefghijklmnopqrstuvwxyz0123456"
            .parse::<TronAddress>()
            .is_err());
    }

    #[test]
    fn test_small_payment_confirms_after_one() {
        let payment = detected(dec!(9.99));
        assert_eq!(payment.required_confirmations, 1);
        let events = payment.update_confirmations(1, 101);
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], PaymentEvent::Confirming { .. }));
        assert!(matches!(events[1], PaymentEvent::Confirmed { .. }));

        let mut payment = payment;
        for event in &events {
            payment.apply(event);
        }
        assert_eq!(payment.status, PaymentStatus::Confirmed);
        assert!(payment.confirmed_at.is_some());
    }

    #[test]
    fn test_larger_payment_requires_more_confirmations() {
        let mut payment = detected(dec!(500));
        assert_eq!(payment.required_confirmations, 6);
        for event in payment.update_confirmations(3, 101) {
            payment.apply(&event);
        }
        assert_eq!(payment.status, PaymentStatus::Confirming);
        for event in payment.update_confirmations(6, 104) {
            payment.apply(&event);
        }
        assert_eq!(payment.status, PaymentStatus::Confirmed);
    }

    #[test]
    fn test_repeated_observation_is_idempotent() {
        let mut payment = detected(dec!(500));
        for event in payment.update_confirmations(3, 101) {
            payment.apply(&event);
        }
        // Same or lower confirmation count: nothing happens.
        assert!(payment.update_confirmations(3, 101).is_empty());
        assert!(payment.update_confirmations(2, 101).is_empty());

        let mut confirmed = payment.clone();
        for event in confirmed.update_confirmations(6, 104) {
            confirmed.apply(&event);
        }
        assert!(confirmed.update_confirmations(9, 107).is_empty());
    }

    #[test]
    fn test_attribution_requires_confirmed() {
        let mut payment = detected(dec!(9.99));
        let invoice_id = InvoiceId::generate();
        assert!(matches!(
            payment.attribute(invoice_id).unwrap_err(),
            PaymentError::NotConfirmed(_)
        ));
        for event in payment.update_confirmations(1, 101) {
            payment.apply(&event);
        }
        let attributed = payment.attribute(invoice_id).unwrap();
        payment.apply(&attributed);
        assert_eq!(payment.invoice_id, Some(invoice_id));
        assert!(matches!(
            payment.attribute(InvoiceId::generate()).unwrap_err(),
            PaymentError::AlreadyAttributed(_)
        ));
    }

    #[test]
    fn test_confirmation_timeout() {
        let mut payment = detected(dec!(500));
        for event in payment.update_confirmations(2, 101) {
            payment.apply(&event);
        }
        let deadline = Duration::minutes(30);
        assert_eq!(
            payment
                .fail_on_timeout(payment.detected_at + Duration::minutes(10), deadline)
                .unwrap_err(),
            PaymentError::DeadlineNotReached
        );
        let failed = payment
            .fail_on_timeout(payment.detected_at + Duration::minutes(31), deadline)
            .unwrap();
        payment.apply(&failed);
        assert_eq!(payment.status, PaymentStatus::Failed);
        assert_eq!(
            payment.failure_reason,
            Some(PaymentFailureReason::ConfirmationTimeout)
        );
    }

    #[test]
    fn test_orphan_only_from_detected() {
        let mut payment = detected(dec!(9.99));
        let orphaned = payment.orphan().unwrap();
        payment.apply(&orphaned);
        assert_eq!(payment.status, PaymentStatus::Orphaned);

        let mut confirming = detected(dec!(500));
        for event in confirming.update_confirmations(2, 101) {
            confirming.apply(&event);
        }
        assert!(confirming.orphan().is_err());
    }

    #[test]
    fn test_replay_reproduces_state() {
        let detected_event = Payment::detect(&observed(dec!(500), 0), 6);
        let mut payment = Payment::from_events([&detected_event]).unwrap();
        let mut stream = vec![detected_event];
        for event in payment.update_confirmations(6, 106) {
            payment.apply(&event);
            stream.push(event);
        }
        let replayed = Payment::from_events(stream.iter()).unwrap();
        assert_eq!(payment, replayed);
    }
}
