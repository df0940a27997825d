//! Account ledger arithmetic.
//!
//! Every balance-affecting operation is expressed as a [`LedgerDelta`] applied
//! to a user's [`Balances`]. Application is all-or-nothing: either every field
//! moves or an error is returned and nothing changes. Overdrafts are
//! `InsufficientFunds`; sums outside the decimal range are `Validation`.
//!
//! Invariants held after every successful apply:
//! - `available_tokens >= 0`, `staked_tokens >= 0`, `usdt_balance >= 0`
//! - `available_tokens + staked_tokens <= total_tokens`

use crate::errors::{CrmError, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Balances {
    pub total_tokens: Decimal,
    pub available_tokens: Decimal,
    pub staked_tokens: Decimal,
    pub usdt_balance: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerDelta {
    pub total_tokens: Decimal,
    pub available_tokens: Decimal,
    pub staked_tokens: Decimal,
    pub usdt: Decimal,
}

impl LedgerDelta {
    /// Tokens bought and settled: owned and spendable.
    pub fn credit_tokens(amount: Decimal) -> Self {
        LedgerDelta {
            total_tokens: amount,
            available_tokens: amount,
            ..Default::default()
        }
    }

    pub fn stake(amount: Decimal) -> Self {
        LedgerDelta {
            available_tokens: -amount,
            staked_tokens: amount,
            ..Default::default()
        }
    }

    pub fn unstake(amount: Decimal) -> Self {
        LedgerDelta {
            available_tokens: amount,
            staked_tokens: -amount,
            ..Default::default()
        }
    }

    pub fn convert(token_amount: Decimal, usdt_amount: Decimal) -> Self {
        LedgerDelta {
            total_tokens: -token_amount,
            available_tokens: -token_amount,
            usdt: usdt_amount,
            ..Default::default()
        }
    }

    /// Moves spendable tokens out of reach while a withdrawal is reviewed.
    pub fn hold_tokens(amount: Decimal) -> Self {
        LedgerDelta {
            available_tokens: -amount,
            ..Default::default()
        }
    }

    pub fn release_tokens(amount: Decimal) -> Self {
        LedgerDelta {
            available_tokens: amount,
            ..Default::default()
        }
    }

    /// Held tokens leave the platform for good.
    pub fn settle_held_tokens(amount: Decimal) -> Self {
        LedgerDelta {
            total_tokens: -amount,
            ..Default::default()
        }
    }

    pub fn usdt(amount: Decimal) -> Self {
        LedgerDelta {
            usdt: amount,
            ..Default::default()
        }
    }

    pub fn is_zero(&self) -> bool {
        self.total_tokens.is_zero()
            && self.available_tokens.is_zero()
            && self.staked_tokens.is_zero()
            && self.usdt.is_zero()
    }
}

impl Balances {
    pub fn apply(&self, delta: &LedgerDelta) -> Result<Balances> {
        let next = Balances {
            total_tokens: checked_sum(self.total_tokens, delta.total_tokens)?,
            available_tokens: checked_sum(self.available_tokens, delta.available_tokens)?,
            staked_tokens: checked_sum(self.staked_tokens, delta.staked_tokens)?,
            usdt_balance: checked_sum(self.usdt_balance, delta.usdt)?,
        };

        if next.available_tokens < Decimal::ZERO {
            return Err(CrmError::InsufficientFunds {
                asset: "available tokens",
                required: (-delta.available_tokens).to_string(),
                available: self.available_tokens.to_string(),
            });
        }

        if next.staked_tokens < Decimal::ZERO {
            return Err(CrmError::InsufficientFunds {
                asset: "staked tokens",
                required: (-delta.staked_tokens).to_string(),
                available: self.staked_tokens.to_string(),
            });
        }

        if next.usdt_balance < Decimal::ZERO {
            return Err(CrmError::InsufficientFunds {
                asset: "USDT balance",
                required: (-delta.usdt).to_string(),
                available: self.usdt_balance.to_string(),
            });
        }

        if next.available_tokens + next.staked_tokens > next.total_tokens {
            return Err(CrmError::InsufficientFunds {
                asset: "total tokens",
                required: (next.available_tokens + next.staked_tokens).to_string(),
                available: next.total_tokens.to_string(),
            });
        }

        Ok(next)
    }
}

fn checked_sum(balance: Decimal, change: Decimal) -> Result<Decimal> {
    balance
        .checked_add(change)
        .ok_or_else(|| CrmError::validation("Amount out of range"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn funded() -> Balances {
        Balances {
            total_tokens: dec!(100),
            available_tokens: dec!(80),
            staked_tokens: dec!(20),
            usdt_balance: dec!(50),
        }
    }

    #[test]
    fn test_stake_moves_available_to_staked() {
        let next = funded().apply(&LedgerDelta::stake(dec!(30))).unwrap();
        assert_eq!(next.available_tokens, dec!(50));
        assert_eq!(next.staked_tokens, dec!(50));
        assert_eq!(next.total_tokens, dec!(100));
    }

    #[test]
    fn test_overspend_is_rejected() {
        let err = funded().apply(&LedgerDelta::stake(dec!(80.01))).unwrap_err();
        assert!(matches!(err, CrmError::InsufficientFunds { .. }));
    }

    #[test]
    fn test_conversion_burns_tokens_and_credits_usdt() {
        let next = funded()
            .apply(&LedgerDelta::convert(dec!(10), dec!(28.00)))
            .unwrap();
        assert_eq!(next.total_tokens, dec!(90));
        assert_eq!(next.available_tokens, dec!(70));
        assert_eq!(next.usdt_balance, dec!(78.00));
    }

    #[test]
    fn test_settling_held_tokens_cannot_eat_staked_balance() {
        // 80 available + 20 staked = 100 total: nothing is held, so nothing may leave.
        let err = funded()
            .apply(&LedgerDelta::settle_held_tokens(dec!(1)))
            .unwrap_err();
        assert!(matches!(err, CrmError::InsufficientFunds { .. }));

        let held = funded().apply(&LedgerDelta::hold_tokens(dec!(5))).unwrap();
        let settled = held.apply(&LedgerDelta::settle_held_tokens(dec!(5))).unwrap();
        assert_eq!(settled.total_tokens, dec!(95));
        assert_eq!(settled.available_tokens, dec!(75));
    }

    #[test]
    fn test_overflowing_credit_is_refused() {
        let full = Balances::default()
            .apply(&LedgerDelta::credit_tokens(Decimal::MAX))
            .unwrap();

        let err = full.apply(&LedgerDelta::credit_tokens(dec!(1))).unwrap_err();
        assert!(matches!(err, CrmError::Validation { .. }));
    }

    #[test]
    fn test_usdt_debit_beyond_balance_fails() {
        let err = funded().apply(&LedgerDelta::usdt(dec!(-50.01))).unwrap_err();
        assert!(matches!(err, CrmError::InsufficientFunds { asset: "USDT balance", .. }));
    }
}
