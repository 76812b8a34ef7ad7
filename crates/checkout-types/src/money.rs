//! Currency-tagged exact decimal money.
//!
//! All monetary values in the system are a pair of an exact [`Decimal`] amount
//! and a [`Currency`] tag. Arithmetic never mixes currencies and never rounds
//! implicitly; rounding happens only where a caller asks for it (fee
//! computation, tolerance comparison, display).

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Maximum number of fractional digits a monetary amount may carry.
///
/// Eight digits cover both fiat cents and USDT's six on-chain decimals.
pub const MAX_SCALE: u32 = 8;

/// ISO-style currency code, partitioned into fiat and crypto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    Usd,
    Eur,
    Usdt,
}

impl Currency {
    pub fn code(&self) -> &'static str {
        match self {
            Currency::Usd => "USD",
            Currency::Eur => "EUR",
            Currency::Usdt => "USDT",
        }
    }

    pub fn is_fiat(&self) -> bool {
        matches!(self, Currency::Usd | Currency::Eur)
    }

    pub fn is_crypto(&self) -> bool {
        matches!(self, Currency::Usdt)
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Unknown currency code: {0}")]
pub struct CurrencyParseError(String);

impl FromStr for Currency {
    type Err = CurrencyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "USD" => Ok(Currency::Usd),
            "EUR" => Ok(Currency::Eur),
            "USDT" => Ok(Currency::Usdt),
            other => Err(CurrencyParseError(other.to_string())),
        }
    }
}

/// Errors raised by [`Money`] construction and arithmetic.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MoneyError {
    #[error("Negative amount is not allowed: {0}")]
    Negative(Decimal),
    #[error("Amount must be strictly positive: {0}")]
    NotPositive(Decimal),
    #[error("Amount exceeds {MAX_SCALE} fractional digits: {0}")]
    ScaleTooLarge(Decimal),
    #[error("Currency mismatch: {left} vs {right}")]
    CurrencyMismatch { left: Currency, right: Currency },
    #[error("Subtraction would go negative: {minuend} - {subtrahend}")]
    Underflow { minuend: Decimal, subtrahend: Decimal },
}

/// An exact, non-negative monetary amount tagged with its currency.
///
/// Construction enforces the non-negative and scale invariants; arithmetic is
/// checked and returns fresh values. Cross-currency operations fail with
/// [`MoneyError::CurrencyMismatch`] instead of silently coercing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Money {
    amount: Decimal,
    currency: Currency,
}

impl<'de> Deserialize<'de> for Money {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct MoneyWire {
            amount: Decimal,
            currency: Currency,
        }
        // Wire values go through the same invariants as constructed ones.
        let wire = MoneyWire::deserialize(deserializer)?;
        Money::new(wire.amount, wire.currency).map_err(serde::de::Error::custom)
    }
}

impl Money {
    /// Creates a non-negative amount in `currency`.
    pub fn new(amount: Decimal, currency: Currency) -> Result<Self, MoneyError> {
        if amount.is_sign_negative() {
            return Err(MoneyError::Negative(amount));
        }
        if amount.scale() > MAX_SCALE {
            return Err(MoneyError::ScaleTooLarge(amount));
        }
        Ok(Money { amount, currency })
    }

    /// Creates a strictly positive amount in `currency`.
    pub fn positive(amount: Decimal, currency: Currency) -> Result<Self, MoneyError> {
        if amount.is_zero() || amount.is_sign_negative() {
            return Err(MoneyError::NotPositive(amount));
        }
        Self::new(amount, currency)
    }

    /// The zero amount in `currency`.
    pub fn zero(currency: Currency) -> Self {
        Money {
            amount: Decimal::ZERO,
            currency,
        }
    }

    pub fn amount(&self) -> Decimal {
        self.amount
    }

    pub fn currency(&self) -> Currency {
        self.currency
    }

    pub fn is_zero(&self) -> bool {
        self.amount.is_zero()
    }

    fn assert_same_currency(&self, other: &Money) -> Result<(), MoneyError> {
        if self.currency != other.currency {
            return Err(MoneyError::CurrencyMismatch {
                left: self.currency,
                right: other.currency,
            });
        }
        Ok(())
    }

    /// Checked addition; fails on currency mismatch.
    pub fn checked_add(&self, other: &Money) -> Result<Money, MoneyError> {
        self.assert_same_currency(other)?;
        Ok(Money {
            amount: self.amount + other.amount,
            currency: self.currency,
        })
    }

    /// Checked subtraction; fails on currency mismatch or a negative result.
    pub fn checked_sub(&self, other: &Money) -> Result<Money, MoneyError> {
        self.assert_same_currency(other)?;
        if other.amount > self.amount {
            return Err(MoneyError::Underflow {
                minuend: self.amount,
                subtrahend: other.amount,
            });
        }
        Ok(Money {
            amount: self.amount - other.amount,
            currency: self.currency,
        })
    }

    /// Subtraction clamped at zero; fails only on currency mismatch.
    pub fn saturating_sub(&self, other: &Money) -> Result<Money, MoneyError> {
        self.assert_same_currency(other)?;
        let amount = if other.amount >= self.amount {
            Decimal::ZERO
        } else {
            self.amount - other.amount
        };
        Ok(Money {
            amount,
            currency: self.currency,
        })
    }

    /// Multiplies by a dimensionless non-negative rate. The result keeps the
    /// currency and full precision; round explicitly afterwards.
    pub fn mul_rate(&self, rate: Decimal) -> Result<Money, MoneyError> {
        let product = self.amount * rate;
        if product.is_sign_negative() {
            return Err(MoneyError::Negative(product));
        }
        Ok(Money {
            amount: product,
            currency: self.currency,
        })
    }

    /// Rounds half-away-from-zero to `dp` fractional digits.
    ///
    /// Used at fee computation and display boundaries.
    pub fn round_half_away(&self, dp: u32) -> Money {
        Money {
            amount: self
                .amount
                .round_dp_with_strategy(dp, RoundingStrategy::MidpointAwayFromZero),
            currency: self.currency,
        }
    }

    /// Rounds with banker's rounding to `dp` fractional digits.
    ///
    /// Tolerance-band comparisons happen on values normalized this way at
    /// [`MAX_SCALE`] digits.
    pub fn round_bankers(&self, dp: u32) -> Money {
        Money {
            amount: self
                .amount
                .round_dp_with_strategy(dp, RoundingStrategy::MidpointNearestEven),
            currency: self.currency,
        }
    }

    /// Compares two same-currency amounts after banker's rounding at
    /// [`MAX_SCALE`] digits.
    pub fn cmp_rounded(&self, other: &Money) -> Result<std::cmp::Ordering, MoneyError> {
        self.assert_same_currency(other)?;
        let left = self.round_bankers(MAX_SCALE).amount;
        let right = other.round_bankers(MAX_SCALE).amount;
        Ok(left.cmp(&right))
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.amount.normalize(), self.currency)
    }
}
