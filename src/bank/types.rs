//! Types used throughout the ledger.
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize, de, ser};

/// Number of decimals shown to users. Stored values are never rounded.
pub const DISPLAY_DECIMALS: u32 = 2;

/// Account ID type, a seven digit numeric string.
pub type AccountId = String;

/// Money type, an exact decimal currency amount.
pub type Money = Decimal;

/// Converts a floating-point currency amount to a decimal through the float's shortest
/// decimal form, so `0.1` becomes exactly `0.1`.
/// Returns `None` for non-finite input or magnitudes beyond the decimal range.
pub fn money_from_f64(value: f64) -> Option<Money> {
    if !value.is_finite() {
        return None;
    }
    value.to_string().parse().ok()
}

/// Formats an amount with two decimals, as shown to users. Halves round away from zero.
pub fn format_money(money: Money) -> String {
    let rounded =
        money.round_dp_with_strategy(DISPLAY_DECIMALS, RoundingStrategy::MidpointAwayFromZero);
    format!("{:.2}", rounded)
}

/// Persisted balances are plain floating-point numbers.
pub(crate) fn serialize_money<S>(money: &Money, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    match money.to_string().parse::<f64>() {
        Ok(value) => value.serialize(serializer),
        Err(err) => Err(ser::Error::custom(format!("balance {money}: {err}"))),
    }
}

/// Custom deserializer for persisted balances; a missing balance reads as zero.
pub(crate) fn deserialize_money<'de, D>(deserializer: D) -> Result<Money, D::Error>
where
    D: de::Deserializer<'de>,
{
    let value: Option<f64> = Option::deserialize(deserializer)?;
    match value {
        None => Ok(Money::ZERO),
        Some(v) => money_from_f64(v)
            .ok_or_else(|| de::Error::custom(format!("balance {v} is not a valid amount"))),
    }
}
