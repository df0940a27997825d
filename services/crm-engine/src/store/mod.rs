//! Persistence seam.
//!
//! Each method that changes balances is one atomic unit: the balance check,
//! the balance write and every record tied to the event commit together or not
//! at all. Implementations must re-check balance preconditions as part of the
//! write itself so concurrent requests for the same user cannot overspend.

pub mod memory;
pub mod postgres;

use crate::approval::{Approved, Rejected, Review};
use crate::commission::CommissionAccrual;
use crate::errors::Result;
use crate::ledger::LedgerDelta;
use crate::models::{
    DashboardStats, NewUser, Notification, PageRequest, ReferralCommission, ReferralTotals,
    ReviewStatus, Role, StakingRecord, Transaction, User, WithdrawalRequest,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// One balance-affecting event and the records written with it
#[derive(Debug, Clone)]
pub struct LedgerEvent {
    pub user_id: Uuid,
    pub delta: LedgerDelta,
    pub transaction: Transaction,
    pub staking: Option<StakingRecord>,
    pub withdrawal: Option<WithdrawalRequest>,
    pub at: DateTime<Utc>,
}

impl LedgerEvent {
    pub fn new(user_id: Uuid, delta: LedgerDelta, transaction: Transaction, at: DateTime<Utc>) -> Self {
        LedgerEvent {
            user_id,
            delta,
            transaction,
            staking: None,
            withdrawal: None,
            at,
        }
    }

    pub fn with_staking(mut self, record: StakingRecord) -> Self {
        self.staking = Some(record);
        self
    }

    pub fn with_withdrawal(mut self, request: WithdrawalRequest) -> Self {
        self.withdrawal = Some(request);
        self
    }
}

/// What happened to the referrer's bucket when a purchase settled
#[derive(Debug, Clone)]
pub enum CommissionOutcome {
    NotReferred,
    Accrued(ReferralCommission),
    /// The bucket had already been reviewed; it is pending again and carries
    /// the new amount as its unsettled part.
    Reopened(ReferralCommission),
}

#[async_trait]
pub trait CrmStore: Send + Sync {
    // ----- users -----

    /// Inserts the user and, for referred sign-ups, opens the referrer's
    /// commission bucket in the same unit of work.
    async fn create_user(&self, user: NewUser, referral: Option<CommissionAccrual>, now: DateTime<Utc>) -> Result<User>;
    async fn get_user(&self, id: Uuid) -> Result<Option<User>>;
    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>>;
    async fn find_user_by_referral_code(&self, code: &str) -> Result<Option<User>>;
    async fn list_users(&self, page: PageRequest) -> Result<(Vec<User>, i64)>;
    async fn set_user_active(&self, id: Uuid, is_active: bool, now: DateTime<Utc>) -> Result<User>;
    async fn set_user_role(&self, id: Uuid, role: Role, now: DateTime<Utc>) -> Result<User>;
    async fn count_referred_users(&self, referral_code: &str) -> Result<i64>;

    // ----- settings and prices -----

    async fn get_setting(&self, key: &str) -> Result<Option<String>>;
    async fn put_setting(&self, key: &str, value: &str, now: DateTime<Utc>) -> Result<()>;
    async fn price_on(&self, date: NaiveDate) -> Result<Option<Decimal>>;
    async fn latest_price(&self) -> Result<Option<Decimal>>;
    async fn put_price(&self, date: NaiveDate, price: Decimal, now: DateTime<Utc>) -> Result<()>;

    // ----- ledger and transactions -----

    /// Applies the delta under its balance guard and writes the attached
    /// records. Returns the updated user.
    async fn commit_ledger_event(&self, event: LedgerEvent) -> Result<User>;
    async fn insert_transaction(&self, transaction: Transaction) -> Result<Transaction>;
    async fn get_transaction(&self, id: Uuid) -> Result<Option<Transaction>>;
    async fn list_transactions(&self, user_id: Option<Uuid>, page: PageRequest) -> Result<(Vec<Transaction>, i64)>;
    /// Settles a pending purchase: credits the tokens and accrues the
    /// referrer's commission atomically.
    async fn complete_purchase(
        &self,
        review: Review<Approved>,
        commission: Option<CommissionAccrual>,
        now: DateTime<Utc>,
    ) -> Result<(Transaction, User, CommissionOutcome)>;
    async fn reject_transaction(&self, review: Review<Rejected>, now: DateTime<Utc>) -> Result<Transaction>;

    // ----- staking -----

    async fn get_stake(&self, id: Uuid) -> Result<Option<StakingRecord>>;
    async fn list_stakes(&self, user_id: Uuid, page: PageRequest) -> Result<(Vec<StakingRecord>, i64)>;
    /// Marks a matured stake COMPLETED and returns its principal to the
    /// available balance.
    async fn complete_stake(&self, id: Uuid, now: DateTime<Utc>) -> Result<(StakingRecord, User)>;

    // ----- withdrawals -----

    async fn get_withdrawal(&self, id: Uuid) -> Result<Option<WithdrawalRequest>>;
    async fn list_withdrawals(&self, user_id: Option<Uuid>, page: PageRequest) -> Result<(Vec<WithdrawalRequest>, i64)>;
    async fn approve_withdrawal(&self, review: Review<Approved>, now: DateTime<Utc>) -> Result<(WithdrawalRequest, User)>;
    async fn reject_withdrawal(&self, review: Review<Rejected>, now: DateTime<Utc>) -> Result<(WithdrawalRequest, User)>;

    // ----- referral commissions -----

    async fn get_commission(&self, id: Uuid) -> Result<Option<ReferralCommission>>;
    async fn list_commissions(
        &self,
        referrer_id: Option<Uuid>,
        status: Option<ReviewStatus>,
        page: PageRequest,
    ) -> Result<(Vec<ReferralCommission>, i64)>;
    async fn commission_totals(&self, referrer_id: Uuid) -> Result<ReferralTotals>;
    /// Approves a pending bucket, credits the referrer with its unsettled
    /// amount and logs a COMPLETED REFERRAL_COMMISSION transaction for it.
    async fn approve_commission(&self, review: Review<Approved>, now: DateTime<Utc>) -> Result<(ReferralCommission, User)>;
    async fn reject_commission(&self, review: Review<Rejected>, now: DateTime<Utc>) -> Result<ReferralCommission>;

    // ----- notifications -----

    async fn insert_notification(&self, notification: Notification) -> Result<Notification>;
    /// The user's own notifications plus global ones, newest first.
    async fn list_notifications(&self, user_id: Uuid, page: PageRequest) -> Result<(Vec<Notification>, i64)>;
    async fn mark_notification_read(&self, id: Uuid, user_id: Uuid) -> Result<Notification>;

    // ----- dashboard -----

    async fn dashboard_stats(&self) -> Result<DashboardStats>;

    async fn health_check(&self) -> Result<()>;
}

/// Builds the COMPLETED ledger entry for the part of `commission` an
/// approval pays out.
pub(crate) fn commission_payout(
    commission: &ReferralCommission,
    amount: Decimal,
    token_amount: Decimal,
    now: DateTime<Utc>,
) -> Transaction {
    use crate::models::{TransactionStatus, TransactionType};

    let mut transaction = Transaction::new(
        commission.referrer_id,
        TransactionType::ReferralCommission,
        TransactionStatus::Completed,
        now,
    );
    transaction.amount = amount;
    transaction.token_amount = token_amount;
    transaction.reference = Some(format!("commission:{}", commission.id));
    transaction.notes = Some(format!(
        "Referral commission {:02}/{}",
        commission.month, commission.year
    ));
    transaction
}
