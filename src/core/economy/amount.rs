// Money amounts for the ledger.
//
// Every balance and every transaction amount goes through `Amount`, so the
// non-negative and two-decimal rules live in exactly one place.

use super::economy_models::EconomyError;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Number of fractional digits every amount carries.
pub const AMOUNT_SCALE: u32 = 2;

/// A non-negative decimal quantity with at most two fractional digits.
///
/// Arithmetic is exact (`rust_decimal`), and truncation to two digits happens
/// once when the value enters the system, never in the middle of a calculation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "Decimal", into = "Decimal")]
pub struct Amount(Decimal);

impl Amount {
    pub const ZERO: Amount = Amount(Decimal::ZERO);

    /// The largest amount whose hundredths fit the `i64` storage column
    /// (92,233,720,368,547,758.07).
    pub const MAX: Amount = Amount(Decimal::from_parts(
        u32::MAX,
        i32::MAX as u32,
        0,
        false,
        AMOUNT_SCALE,
    ));

    /// Parse user input into an amount.
    ///
    /// Accepts an optional leading `+`, digits and an optional fractional part
    /// (`^[+]?(\d*\.)?\d+$`). The value is truncated toward zero to two digits,
    /// so `"12.999"` becomes `12.99`.
    pub fn parse(input: &str) -> Result<Self, EconomyError> {
        let trimmed = input.trim();
        if !is_plain_amount(trimmed) {
            return Err(EconomyError::InvalidAmount(input.to_string()));
        }

        // Drop digits past the scale as text, so `Decimal` never rounds them up.
        let unsigned = trimmed.strip_prefix('+').unwrap_or(trimmed);
        let normalized = match unsigned.split_once('.') {
            Some((whole, fraction)) => {
                let whole = if whole.is_empty() { "0" } else { whole };
                let kept = &fraction[..fraction.len().min(AMOUNT_SCALE as usize)];
                format!("{whole}.{kept}")
            }
            None => unsigned.to_string(),
        };
        let decimal = Decimal::from_str(&normalized)
            .map_err(|_| EconomyError::InvalidAmount(input.to_string()))?;

        Self::try_from(decimal)
    }

    /// Build an amount from integer hundredths (the storage representation).
    pub fn from_minor_units(units: i64) -> Result<Self, EconomyError> {
        if units < 0 {
            return Err(EconomyError::InvalidAmount(units.to_string()));
        }
        Ok(Self(Decimal::new(units, AMOUNT_SCALE)))
    }

    /// Integer hundredths, as persisted by the SQLite store.
    pub fn to_minor_units(self) -> Result<i64, EconomyError> {
        minor_units(self.0).ok_or_else(|| EconomyError::InvalidAmount(self.0.to_string()))
    }

    pub fn as_decimal(self) -> Decimal {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0.is_zero()
    }

    /// Returns `None` when the sum is above `Amount::MAX`.
    pub fn checked_add(self, rhs: Amount) -> Option<Amount> {
        self.0
            .checked_add(rhs.0)
            .filter(|sum| minor_units(*sum).is_some())
            .map(Amount)
    }

    /// Returns `None` when the result would be negative (or on overflow).
    pub fn checked_sub(self, rhs: Amount) -> Option<Amount> {
        self.0
            .checked_sub(rhs.0)
            .filter(|result| !result.is_sign_negative() || result.is_zero())
            .map(Amount)
    }
}

impl TryFrom<Decimal> for Amount {
    type Error = EconomyError;

    fn try_from(value: Decimal) -> Result<Self, Self::Error> {
        if value.is_sign_negative() && !value.is_zero() {
            return Err(EconomyError::InvalidAmount(value.to_string()));
        }

        let mut truncated = value.round_dp_with_strategy(AMOUNT_SCALE, RoundingStrategy::ToZero);
        // Normalise -0 and the scale so equal amounts print the same way.
        truncated.set_sign_positive(true);
        truncated.rescale(AMOUNT_SCALE);
        if minor_units(truncated).is_none() {
            return Err(EconomyError::InvalidAmount(value.to_string()));
        }
        Ok(Self(truncated))
    }
}

impl From<Amount> for Decimal {
    fn from(value: Amount) -> Self {
        value.0
    }
}

impl FromStr for Amount {
    type Err = EconomyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}", self.0)
    }
}

/// Hundredths as `i64`, or `None` when they don't fit.
fn minor_units(value: Decimal) -> Option<i64> {
    value
        .checked_mul(Decimal::ONE_HUNDRED)
        .and_then(|hundredths| hundredths.trunc().to_i64())
}

/// Accepts an optional `+`, then digits with an optional single `.` that
/// must be followed by at least one digit (`^[+]?(\d*\.)?\d+$`).
fn is_plain_amount(input: &str) -> bool {
    let body = input.strip_prefix('+').unwrap_or(input);
    let (whole, fraction) = match body.split_once('.') {
        Some((whole, fraction)) => (whole, fraction),
        None => ("", body),
    };

    !fraction.is_empty()
        && fraction.bytes().all(|b| b.is_ascii_digit())
        && whole.bytes().all(|b| b.is_ascii_digit())
}
