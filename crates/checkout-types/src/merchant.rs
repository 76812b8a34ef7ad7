//! Merchant aggregate: identity, settings, and status transitions.
//!
//! A merchant owns its API keys and webhook endpoints. Only `active`
//! merchants may create invoices and keys. Status transitions are encoded as
//! a declared table; `closed` is terminal.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::event::{AggregateType, DomainEvent, EventType};
use crate::id::MerchantId;
use crate::invoice::PaymentTolerance;
use crate::money::Currency;

/// Inclusive bounds on the platform fee rate.
pub const MIN_FEE_RATE: Decimal = Decimal::from_parts(1, 0, 0, false, 3); // 0.001
pub const MAX_FEE_RATE: Decimal = Decimal::from_parts(5, 0, 0, false, 2); // 0.05

static EMAIL_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("Invalid email regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MerchantStatus {
    PendingVerification,
    Active,
    Suspended,
    Closed,
}

impl fmt::Display for MerchantStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MerchantStatus::PendingVerification => "pending_verification",
            MerchantStatus::Active => "active",
            MerchantStatus::Suspended => "suspended",
            MerchantStatus::Closed => "closed",
        };
        write!(f, "{s}")
    }
}

/// Legal merchant status transitions.
pub const MERCHANT_TRANSITIONS: &[(MerchantStatus, MerchantStatus)] = &[
    (MerchantStatus::PendingVerification, MerchantStatus::Active),
    (MerchantStatus::Active, MerchantStatus::Suspended),
    (MerchantStatus::Suspended, MerchantStatus::Active),
    (MerchantStatus::PendingVerification, MerchantStatus::Closed),
    (MerchantStatus::Active, MerchantStatus::Closed),
    (MerchantStatus::Suspended, MerchantStatus::Closed),
];

pub fn can_transition(from: MerchantStatus, to: MerchantStatus) -> bool {
    MERCHANT_TRANSITIONS.contains(&(from, to))
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum MerchantError {
    #[error("Business name must not be empty")]
    EmptyBusinessName,
    #[error("Invalid contact email: {0}")]
    InvalidEmail(String),
    #[error("Fee rate {0} outside [{MIN_FEE_RATE}, {MAX_FEE_RATE}]")]
    FeeRateOutOfBounds(Decimal),
    #[error("Invoice expiry must be at least one minute")]
    ZeroExpiry,
    #[error("Default fiat currency {0} is not fiat")]
    NotFiat(Currency),
    #[error("Default crypto currency {0} is not crypto")]
    NotCrypto(Currency),
    #[error("Invalid default tolerance: {0}")]
    Tolerance(String),
    #[error("Illegal status transition: {from} -> {to}")]
    IllegalTransition {
        from: MerchantStatus,
        to: MerchantStatus,
    },
    #[error("Merchant event stream is empty or does not start with creation")]
    CorruptStream,
}

/// Per-merchant defaults applied to new invoices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MerchantSettings {
    pub default_fiat_currency: Currency,
    pub default_crypto_currency: Currency,
    /// Platform fee as a fraction of the invoice total.
    pub fee_rate: Decimal,
    pub invoice_expiry_minutes: u32,
    pub default_tolerance: PaymentTolerance,
    /// When set, overrides the amount-based confirmation requirement.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_confirmations: Option<u32>,
}

impl MerchantSettings {
    pub fn validate(&self) -> Result<(), MerchantError> {
        if !self.default_fiat_currency.is_fiat() {
            return Err(MerchantError::NotFiat(self.default_fiat_currency));
        }
        if !self.default_crypto_currency.is_crypto() {
            return Err(MerchantError::NotCrypto(self.default_crypto_currency));
        }
        if self.fee_rate < MIN_FEE_RATE || self.fee_rate > MAX_FEE_RATE {
            return Err(MerchantError::FeeRateOutOfBounds(self.fee_rate));
        }
        if self.invoice_expiry_minutes == 0 {
            return Err(MerchantError::ZeroExpiry);
        }
        self.default_tolerance
            .validate()
            .map_err(|e| MerchantError::Tolerance(e.to_string()))?;
        Ok(())
    }
}

impl Default for MerchantSettings {
    fn default() -> Self {
        MerchantSettings {
            default_fiat_currency: Currency::Usd,
            default_crypto_currency: Currency::Usdt,
            fee_rate: Decimal::new(1, 2), // 1%
            invoice_expiry_minutes: 30,
            default_tolerance: PaymentTolerance::default(),
            required_confirmations: None,
        }
    }
}

/// One entry of the audited fee-rate history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeeRateChange {
    pub rate: Decimal,
    pub changed_at: DateTime<Utc>,
}

/// Events emitted by the merchant aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MerchantEvent {
    Created {
        merchant_id: MerchantId,
        business_name: String,
        contact_email: String,
        settings: MerchantSettings,
        created_at: DateTime<Utc>,
    },
    Activated {
        at: DateTime<Utc>,
    },
    Suspended {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        at: DateTime<Utc>,
    },
    Reactivated {
        at: DateTime<Utc>,
    },
    Closed {
        at: DateTime<Utc>,
    },
    SettingsUpdated {
        settings: MerchantSettings,
        at: DateTime<Utc>,
    },
}

impl DomainEvent for MerchantEvent {
    fn event_type(&self) -> EventType {
        match self {
            MerchantEvent::Created { .. } => EventType::MerchantCreated,
            MerchantEvent::Activated { .. } => EventType::MerchantActivated,
            MerchantEvent::Suspended { .. } => EventType::MerchantSuspended,
            MerchantEvent::Reactivated { .. } => EventType::MerchantReactivated,
            MerchantEvent::Closed { .. } => EventType::MerchantClosed,
            MerchantEvent::SettingsUpdated { .. } => EventType::MerchantSettingsUpdated,
        }
    }

    fn aggregate_type() -> AggregateType {
        AggregateType::Merchant
    }
}

/// The merchant aggregate, rebuilt by replaying its event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Merchant {
    pub id: MerchantId,
    pub business_name: String,
    pub contact_email: String,
    pub status: MerchantStatus,
    pub settings: MerchantSettings,
    pub fee_rate_history: Vec<FeeRateChange>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Merchant {
    /// Command: create a new merchant in `pending_verification`.
    pub fn create(
        business_name: impl Into<String>,
        contact_email: impl Into<String>,
        settings: MerchantSettings,
    ) -> Result<MerchantEvent, MerchantError> {
        let business_name = business_name.into();
        let contact_email = contact_email.into();
        if business_name.trim().is_empty() {
            return Err(MerchantError::EmptyBusinessName);
        }
        if !EMAIL_REGEX.is_match(&contact_email) {
            return Err(MerchantError::InvalidEmail(contact_email));
        }
        settings.validate()?;
        Ok(MerchantEvent::Created {
            merchant_id: MerchantId::generate(),
            business_name,
            contact_email,
            settings,
            created_at: Utc::now(),
        })
    }

    /// Command: explicit activation out of `pending_verification`, or back
    /// out of `suspended`.
    pub fn activate(&self) -> Result<MerchantEvent, MerchantError> {
        if !can_transition(self.status, MerchantStatus::Active) {
            return Err(MerchantError::IllegalTransition {
                from: self.status,
                to: MerchantStatus::Active,
            });
        }
        let at = Utc::now();
        Ok(match self.status {
            MerchantStatus::Suspended => MerchantEvent::Reactivated { at },
            _ => MerchantEvent::Activated { at },
        })
    }

    /// Command: suspend an active merchant.
    pub fn suspend(&self, reason: Option<String>) -> Result<MerchantEvent, MerchantError> {
        if !can_transition(self.status, MerchantStatus::Suspended) {
            return Err(MerchantError::IllegalTransition {
                from: self.status,
                to: MerchantStatus::Suspended,
            });
        }
        Ok(MerchantEvent::Suspended {
            reason,
            at: Utc::now(),
        })
    }

    /// Command: close the merchant. Terminal.
    pub fn close(&self) -> Result<MerchantEvent, MerchantError> {
        if !can_transition(self.status, MerchantStatus::Closed) {
            return Err(MerchantError::IllegalTransition {
                from: self.status,
                to: MerchantStatus::Closed,
            });
        }
        Ok(MerchantEvent::Closed { at: Utc::now() })
    }

    /// Command: replace the settings. The fee-rate history records the change.
    pub fn update_settings(
        &self,
        settings: MerchantSettings,
    ) -> Result<MerchantEvent, MerchantError> {
        if self.status == MerchantStatus::Closed {
            return Err(MerchantError::IllegalTransition {
                from: self.status,
                to: self.status,
            });
        }
        settings.validate()?;
        Ok(MerchantEvent::SettingsUpdated {
            settings,
            at: Utc::now(),
        })
    }

    pub fn is_active(&self) -> bool {
        self.status == MerchantStatus::Active
    }

    /// Rebuilds the aggregate from its ordered event stream.
    pub fn from_events<'a, I>(events: I) -> Result<Merchant, MerchantError>
    where
        I: IntoIterator<Item = &'a MerchantEvent>,
    {
        let mut iter = events.into_iter();
        let mut merchant = match iter.next() {
            Some(MerchantEvent::Created {
                merchant_id,
                business_name,
                contact_email,
                settings,
                created_at,
            }) => Merchant {
                id: *merchant_id,
                business_name: business_name.clone(),
                contact_email: contact_email.clone(),
                status: MerchantStatus::PendingVerification,
                fee_rate_history: vec![FeeRateChange {
                    rate: settings.fee_rate,
                    changed_at: *created_at,
                }],
                settings: settings.clone(),
                created_at: *created_at,
                updated_at: *created_at,
            },
            _ => return Err(MerchantError::CorruptStream),
        };
        for event in iter {
            merchant.apply(event);
        }
        Ok(merchant)
    }

    /// Applies one post-creation event.
    pub fn apply(&mut self, event: &MerchantEvent) {
        match event {
            MerchantEvent::Created { .. } => {}
            MerchantEvent::Activated { at } | MerchantEvent::Reactivated { at } => {
                self.status = MerchantStatus::Active;
                self.updated_at = *at;
            }
            MerchantEvent::Suspended { at, .. } => {
                self.status = MerchantStatus::Suspended;
                self.updated_at = *at;
            }
            MerchantEvent::Closed { at } => {
                self.status = MerchantStatus::Closed;
                self.updated_at = *at;
            }
            MerchantEvent::SettingsUpdated { settings, at } => {
                if settings.fee_rate != self.settings.fee_rate {
                    self.fee_rate_history.push(FeeRateChange {
                        rate: settings.fee_rate,
                        changed_at: *at,
                    });
                }
                self.settings = settings.clone();
                self.updated_at = *at;
            }
        }
    }
}
