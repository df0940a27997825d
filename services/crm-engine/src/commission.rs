//! Referral commission math.
//!
//! Commissions accrue into one bucket per (referrer, referred user, month, year).
//! Accrual never touches the referrer's balances; the credit happens only when
//! an admin approves the bucket.

use crate::pricing::round_money;
use chrono::{DateTime, Datelike, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

pub const COMMISSION_RATE_KEY: &str = "referral_commission_rate";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommissionPeriod {
    pub month: i32,
    pub year: i32,
}

impl CommissionPeriod {
    pub fn containing(at: DateTime<Utc>) -> Self {
        CommissionPeriod {
            month: at.month() as i32,
            year: at.year(),
        }
    }
}

/// Amount to add into a commission bucket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommissionAccrual {
    pub referrer_id: Uuid,
    pub referred_user_id: Uuid,
    pub period: CommissionPeriod,
    pub amount: Decimal,
    pub token_amount: Decimal,
    pub rate: Decimal,
}

impl CommissionAccrual {
    /// `rate` is a percentage, so 5 means 5%.
    pub fn for_purchase(
        referrer_id: Uuid,
        referred_user_id: Uuid,
        purchase_amount: Decimal,
        token_amount: Decimal,
        rate: Decimal,
        at: DateTime<Utc>,
    ) -> Self {
        let fraction = rate / Decimal::ONE_HUNDRED;
        CommissionAccrual {
            referrer_id,
            referred_user_id,
            period: CommissionPeriod::containing(at),
            amount: round_money(purchase_amount * fraction),
            token_amount: (token_amount * fraction).normalize(),
            rate,
        }
    }

    /// The zero-amount bucket opened when a referred user signs up.
    pub fn signup(referrer_id: Uuid, referred_user_id: Uuid, rate: Decimal, at: DateTime<Utc>) -> Self {
        CommissionAccrual {
            referrer_id,
            referred_user_id,
            period: CommissionPeriod::containing(at),
            amount: Decimal::ZERO,
            token_amount: Decimal::ZERO,
            rate,
        }
    }
}

pub fn valid_rate(rate: Decimal) -> bool {
    rate >= Decimal::ZERO && rate <= Decimal::ONE_HUNDRED
}
