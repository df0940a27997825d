use crate::errors::{CrmError, Result};
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde::Serialize;

/// Price used when no price has ever been recorded.
pub const FALLBACK_TOKEN_PRICE: Decimal = dec!(2.80);

/// Rounds a currency amount to cents, half away from zero.
pub fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Processing fee percentage charged per payment method
pub fn fee_percentage(payment_method: &str) -> Decimal {
    match payment_method.to_ascii_lowercase().as_str() {
        "credit_card" => dec!(2.5),
        "bank_transfer" => dec!(0.5),
        "crypto" => dec!(1.0),
        "paypal" => dec!(3.0),
        _ => dec!(2.5),
    }
}

pub fn processing_fee(amount: Decimal, payment_method: &str) -> Result<Decimal> {
    amount
        .checked_mul(fee_percentage(payment_method))
        .map(|scaled| round_money(scaled / Decimal::ONE_HUNDRED))
        .ok_or_else(|| CrmError::validation("Purchase amount out of range"))
}

/// USDT value of `token_amount` at `price`, rounded to cents.
pub fn token_value(token_amount: Decimal, price: Decimal) -> Result<Decimal> {
    token_amount
        .checked_mul(price)
        .map(round_money)
        .ok_or_else(|| CrmError::validation("Conversion amount out of range"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PriceSource {
    Today,
    Latest,
    Fallback,
}

/// Today's price, else the most recent recorded price, else the fallback.
pub fn resolve_price(today: Option<Decimal>, latest: Option<Decimal>) -> (Decimal, PriceSource) {
    match (today, latest) {
        (Some(price), _) => (price, PriceSource::Today),
        (None, Some(price)) => (price, PriceSource::Latest),
        (None, None) => (FALLBACK_TOKEN_PRICE, PriceSource::Fallback),
    }
}
