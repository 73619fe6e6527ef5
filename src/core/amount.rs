//! Conversions between exact money amounts and the `f64` domain used by
//! beliefs and utilities.

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;

/// Scale applied when converting a float back into a money amount.
pub const AMOUNT_DP: u32 = 8;

pub fn to_f64(amount: Decimal) -> f64 {
    amount.to_f64().unwrap_or(0.0)
}

/// Convert a float into an amount rounded to [`AMOUNT_DP`] places.
/// Non-finite input maps to zero.
pub fn from_f64(value: f64) -> Decimal {
    if !value.is_finite() {
        return Decimal::ZERO;
    }
    Decimal::from_f64(value)
        .unwrap_or(Decimal::ZERO)
        .round_dp(AMOUNT_DP)
}

/// Clamp to `[0, +inf)`.
pub fn non_negative(amount: Decimal) -> Decimal {
    amount.max(Decimal::ZERO)
}
