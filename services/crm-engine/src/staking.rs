use crate::errors::{CrmError, Result};
use crate::lock_gate;
use crate::models::{StakingRecord, StakingStatus, Transaction, TransactionStatus, TransactionType};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
pub struct StakingTerms {
    pub apy: Decimal,
    pub term_months: u32,
}

impl StakingTerms {
    /// New ACTIVE stake plus its ledger entry. Stakes move tokens only, so the
    /// transaction carries no currency amount.
    pub fn open(&self, user_id: Uuid, amount: Decimal, now: DateTime<Utc>) -> (StakingRecord, Transaction) {
        let record = StakingRecord {
            id: Uuid::new_v4(),
            user_id,
            amount,
            start_date: now,
            end_date: lock_gate::maturity(now, self.term_months),
            apy: self.apy,
            rewards: Decimal::ZERO,
            status: StakingStatus::Active,
            completed_at: None,
        };

        let mut transaction =
            Transaction::new(user_id, TransactionType::Stake, TransactionStatus::Completed, now);
        transaction.token_amount = amount;
        transaction.reference = Some(format!("stake:{}", record.id));

        (record, transaction)
    }
}

/// Checks a stake can release its principal back to the owner.
pub fn ensure_releasable(record: &StakingRecord, user_id: Uuid, now: DateTime<Utc>) -> Result<()> {
    if record.user_id != user_id {
        return Err(CrmError::not_found("Staking record", record.id));
    }

    if record.status == StakingStatus::Completed {
        return Err(CrmError::Conflict("Staking record already completed".to_string()));
    }

    lock_gate::ensure_unlocked(record.end_date, now)
}
