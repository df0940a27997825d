//! In-process store used by tests and local runs without Postgres.
//!
//! A single async mutex serializes every operation, and each operation checks
//! all of its preconditions before the first mutation, so a failed call leaves
//! no partial writes behind.

use super::{commission_payout, CommissionOutcome, CrmStore, LedgerEvent};
use crate::approval::{already, Approved, Rejected, Review, Reviewable};
use crate::commission::CommissionAccrual;
use crate::errors::{CrmError, Result};
use crate::lock_gate;
use crate::models::{
    DashboardStats, NewUser, Notification, PageRequest, ReferralCommission, ReferralTotals,
    ReviewStatus, Role, StakingRecord, StakingStatus, Transaction, TransactionStatus, User,
    WithdrawalRequest,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct State {
    users: HashMap<Uuid, User>,
    transactions: HashMap<Uuid, Transaction>,
    commissions: HashMap<Uuid, ReferralCommission>,
    stakes: HashMap<Uuid, StakingRecord>,
    withdrawals: HashMap<Uuid, WithdrawalRequest>,
    notifications: Vec<Notification>,
    settings: HashMap<String, String>,
    prices: BTreeMap<NaiveDate, Decimal>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn paginate<T>(mut items: Vec<T>, page: PageRequest, newest_first: impl Fn(&T, &T) -> std::cmp::Ordering) -> (Vec<T>, i64) {
    items.sort_by(newest_first);
    let total = items.len() as i64;
    let items = items
        .into_iter()
        .skip(page.offset() as usize)
        .take(page.limit as usize)
        .collect();
    (items, total)
}

impl State {
    fn user_mut(&mut self, id: Uuid) -> Result<&mut User> {
        self.users
            .get_mut(&id)
            .ok_or_else(|| CrmError::not_found("User", id))
    }

    /// Validates the delta against the current balances without writing.
    fn check_delta(&self, user_id: Uuid, delta: &crate::ledger::LedgerDelta) -> Result<crate::ledger::Balances> {
        let user = self
            .users
            .get(&user_id)
            .ok_or_else(|| CrmError::not_found("User", user_id))?;
        user.balances().apply(delta)
    }

    fn set_balances(&mut self, user_id: Uuid, balances: crate::ledger::Balances, now: DateTime<Utc>) -> Result<User> {
        let user = self.user_mut(user_id)?;
        user.set_balances(balances);
        user.updated_at = now;
        Ok(user.clone())
    }

    fn accrue(&mut self, accrual: &CommissionAccrual, now: DateTime<Utc>) -> CommissionOutcome {
        let bucket = self.commissions.values_mut().find(|c| {
            c.referrer_id == accrual.referrer_id
                && c.referred_user_id == accrual.referred_user_id
                && c.month == accrual.period.month
                && c.year == accrual.period.year
        });
        if let Some(existing) = bucket {
            let reopened = existing.status != ReviewStatus::Pending;
            existing.amount += accrual.amount;
            existing.token_amount += accrual.token_amount;
            existing.commission_rate = accrual.rate;
            existing.status = ReviewStatus::Pending;
            existing.is_paid = false;
            existing.updated_at = now;
            return if reopened {
                CommissionOutcome::Reopened(existing.clone())
            } else {
                CommissionOutcome::Accrued(existing.clone())
            };
        }

        let commission = ReferralCommission {
            id: Uuid::new_v4(),
            referrer_id: accrual.referrer_id,
            referred_user_id: accrual.referred_user_id,
            month: accrual.period.month,
            year: accrual.period.year,
            amount: accrual.amount,
            token_amount: accrual.token_amount,
            commission_rate: accrual.rate,
            status: ReviewStatus::Pending,
            is_paid: false,
            paid_amount: Decimal::ZERO,
            rejected_amount: Decimal::ZERO,
            settled_token_amount: Decimal::ZERO,
            admin_notes: None,
            reviewed_by: None,
            reviewed_at: None,
            created_at: now,
            updated_at: now,
        };
        self.commissions.insert(commission.id, commission.clone());
        CommissionOutcome::Accrued(commission)
    }

    fn pending_transaction(&self, id: Uuid) -> Result<&Transaction> {
        let transaction = self
            .transactions
            .get(&id)
            .ok_or_else(|| CrmError::not_found("Transaction", id))?;
        if !transaction.status.is_pending() {
            return Err(already("Transaction", transaction.status.label()));
        }
        Ok(transaction)
    }

    fn pending_withdrawal(&self, id: Uuid) -> Result<WithdrawalRequest> {
        let withdrawal = self
            .withdrawals
            .get(&id)
            .ok_or_else(|| CrmError::not_found("Withdrawal", id))?;
        if !withdrawal.status.is_pending() {
            return Err(already("Withdrawal", withdrawal.status.label()));
        }
        Ok(withdrawal.clone())
    }

    fn pending_commission(&self, id: Uuid) -> Result<ReferralCommission> {
        let commission = self
            .commissions
            .get(&id)
            .ok_or_else(|| CrmError::not_found("Commission", id))?;
        if !commission.status.is_pending() {
            return Err(already("Commission", commission.status.label()));
        }
        Ok(commission.clone())
    }

    fn finish_transaction(&mut self, id: Uuid, status: TransactionStatus, notes: Option<&str>, now: DateTime<Utc>) {
        if let Some(transaction) = self.transactions.get_mut(&id) {
            if transaction.status == TransactionStatus::Pending {
                transaction.status = status;
                transaction.processed_at = Some(now);
                if let Some(notes) = notes {
                    transaction.notes = Some(notes.to_string());
                }
            }
        }
    }
}

#[async_trait]
impl CrmStore for MemoryStore {
    async fn create_user(&self, new_user: NewUser, referral: Option<CommissionAccrual>, now: DateTime<Utc>) -> Result<User> {
        let mut state = self.state.lock().await;

        if state
            .users
            .values()
            .any(|u| u.email.eq_ignore_ascii_case(&new_user.email))
        {
            return Err(CrmError::Conflict("Email already registered".to_string()));
        }
        if state
            .users
            .values()
            .any(|u| u.referral_code == new_user.referral_code)
        {
            return Err(CrmError::Conflict("Referral code already in use".to_string()));
        }

        let user = User {
            id: Uuid::new_v4(),
            name: new_user.name,
            email: new_user.email,
            contact_number: new_user.contact_number,
            country: new_user.country,
            state: new_user.state,
            password_hash: new_user.password_hash,
            role: new_user.role,
            is_active: true,
            referral_code: new_user.referral_code,
            referred_by: new_user.referred_by,
            total_tokens: Decimal::ZERO,
            available_tokens: Decimal::ZERO,
            staked_tokens: Decimal::ZERO,
            usdt_balance: Decimal::ZERO,
            total_earnings: Decimal::ZERO,
            referral_earnings: Decimal::ZERO,
            created_at: now,
            updated_at: now,
        };
        state.users.insert(user.id, user.clone());

        if let Some(mut accrual) = referral {
            accrual.referred_user_id = user.id;
            state.accrue(&accrual, now);
        }

        Ok(user)
    }

    async fn get_user(&self, id: Uuid) -> Result<Option<User>> {
        Ok(self.state.lock().await.users.get(&id).cloned())
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let state = self.state.lock().await;
        Ok(state
            .users
            .values()
            .find(|u| u.email.eq_ignore_ascii_case(email))
            .cloned())
    }

    async fn find_user_by_referral_code(&self, code: &str) -> Result<Option<User>> {
        let state = self.state.lock().await;
        Ok(state
            .users
            .values()
            .find(|u| u.referral_code == code)
            .cloned())
    }

    async fn list_users(&self, page: PageRequest) -> Result<(Vec<User>, i64)> {
        let state = self.state.lock().await;
        let users: Vec<User> = state.users.values().cloned().collect();
        Ok(paginate(users, page, |a, b| b.created_at.cmp(&a.created_at)))
    }

    async fn set_user_active(&self, id: Uuid, is_active: bool, now: DateTime<Utc>) -> Result<User> {
        let mut state = self.state.lock().await;
        let user = state.user_mut(id)?;
        user.is_active = is_active;
        user.updated_at = now;
        Ok(user.clone())
    }

    async fn set_user_role(&self, id: Uuid, role: Role, now: DateTime<Utc>) -> Result<User> {
        let mut state = self.state.lock().await;
        let user = state.user_mut(id)?;
        user.role = role;
        user.updated_at = now;
        Ok(user.clone())
    }

    async fn count_referred_users(&self, referral_code: &str) -> Result<i64> {
        let state = self.state.lock().await;
        Ok(state
            .users
            .values()
            .filter(|u| u.referred_by.as_deref() == Some(referral_code))
            .count() as i64)
    }

    async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        Ok(self.state.lock().await.settings.get(key).cloned())
    }

    async fn put_setting(&self, key: &str, value: &str, _now: DateTime<Utc>) -> Result<()> {
        self.state
            .lock()
            .await
            .settings
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn price_on(&self, date: NaiveDate) -> Result<Option<Decimal>> {
        Ok(self.state.lock().await.prices.get(&date).copied())
    }

    async fn latest_price(&self) -> Result<Option<Decimal>> {
        Ok(self
            .state
            .lock()
            .await
            .prices
            .iter()
            .next_back()
            .map(|(_, price)| *price))
    }

    async fn put_price(&self, date: NaiveDate, price: Decimal, _now: DateTime<Utc>) -> Result<()> {
        self.state.lock().await.prices.insert(date, price);
        Ok(())
    }

    async fn commit_ledger_event(&self, event: LedgerEvent) -> Result<User> {
        let mut state = self.state.lock().await;

        let balances = state.check_delta(event.user_id, &event.delta)?;
        let user = state.set_balances(event.user_id, balances, event.at)?;

        state
            .transactions
            .insert(event.transaction.id, event.transaction);
        if let Some(record) = event.staking {
            state.stakes.insert(record.id, record);
        }
        if let Some(request) = event.withdrawal {
            state.withdrawals.insert(request.id, request);
        }

        Ok(user)
    }

    async fn insert_transaction(&self, transaction: Transaction) -> Result<Transaction> {
        self.state
            .lock()
            .await
            .transactions
            .insert(transaction.id, transaction.clone());
        Ok(transaction)
    }

    async fn get_transaction(&self, id: Uuid) -> Result<Option<Transaction>> {
        Ok(self.state.lock().await.transactions.get(&id).cloned())
    }

    async fn list_transactions(&self, user_id: Option<Uuid>, page: PageRequest) -> Result<(Vec<Transaction>, i64)> {
        let state = self.state.lock().await;
        let items: Vec<Transaction> = state
            .transactions
            .values()
            .filter(|t| user_id.map_or(true, |id| t.user_id == id))
            .cloned()
            .collect();
        Ok(paginate(items, page, |a, b| b.created_at.cmp(&a.created_at)))
    }

    async fn complete_purchase(
        &self,
        review: Review<Approved>,
        commission: Option<CommissionAccrual>,
        now: DateTime<Utc>,
    ) -> Result<(Transaction, User, CommissionOutcome)> {
        let mut state = self.state.lock().await;

        let transaction = state.pending_transaction(review.id())?.clone();
        let delta = crate::ledger::LedgerDelta::credit_tokens(transaction.token_amount);
        let balances = state.check_delta(transaction.user_id, &delta)?;

        let user = state.set_balances(transaction.user_id, balances, now)?;
        state.finish_transaction(transaction.id, TransactionStatus::Completed, review.notes(), now);
        let outcome = match commission {
            Some(accrual) => state.accrue(&accrual, now),
            None => CommissionOutcome::NotReferred,
        };

        let transaction = state.transactions[&transaction.id].clone();
        Ok((transaction, user, outcome))
    }

    async fn reject_transaction(&self, review: Review<Rejected>, now: DateTime<Utc>) -> Result<Transaction> {
        let mut state = self.state.lock().await;
        let id = state.pending_transaction(review.id())?.id;
        state.finish_transaction(id, TransactionStatus::Rejected, review.notes(), now);
        Ok(state.transactions[&id].clone())
    }

    async fn get_stake(&self, id: Uuid) -> Result<Option<StakingRecord>> {
        Ok(self.state.lock().await.stakes.get(&id).cloned())
    }

    async fn list_stakes(&self, user_id: Uuid, page: PageRequest) -> Result<(Vec<StakingRecord>, i64)> {
        let state = self.state.lock().await;
        let items: Vec<StakingRecord> = state
            .stakes
            .values()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect();
        Ok(paginate(items, page, |a, b| b.start_date.cmp(&a.start_date)))
    }

    async fn complete_stake(&self, id: Uuid, now: DateTime<Utc>) -> Result<(StakingRecord, User)> {
        let mut state = self.state.lock().await;

        let record = state
            .stakes
            .get(&id)
            .cloned()
            .ok_or_else(|| CrmError::not_found("Staking record", id))?;
        if record.status == StakingStatus::Completed {
            return Err(CrmError::Conflict("Staking record already completed".to_string()));
        }
        lock_gate::ensure_unlocked(record.end_date, now)?;

        let balances = state.check_delta(record.user_id, &crate::ledger::LedgerDelta::unstake(record.amount))?;
        let user = state.set_balances(record.user_id, balances, now)?;

        let stored = state
            .stakes
            .get_mut(&id)
            .ok_or_else(|| CrmError::not_found("Staking record", id))?;
        stored.status = StakingStatus::Completed;
        stored.completed_at = Some(now);

        Ok((stored.clone(), user))
    }

    async fn get_withdrawal(&self, id: Uuid) -> Result<Option<WithdrawalRequest>> {
        Ok(self.state.lock().await.withdrawals.get(&id).cloned())
    }

    async fn list_withdrawals(&self, user_id: Option<Uuid>, page: PageRequest) -> Result<(Vec<WithdrawalRequest>, i64)> {
        let state = self.state.lock().await;
        let items: Vec<WithdrawalRequest> = state
            .withdrawals
            .values()
            .filter(|w| user_id.map_or(true, |id| w.user_id == id))
            .cloned()
            .collect();
        Ok(paginate(items, page, |a, b| b.created_at.cmp(&a.created_at)))
    }

    async fn approve_withdrawal(&self, review: Review<Approved>, now: DateTime<Utc>) -> Result<(WithdrawalRequest, User)> {
        let mut state = self.state.lock().await;

        let withdrawal = state.pending_withdrawal(review.id())?;
        lock_gate::ensure_unlocked(withdrawal.unlock_at, now)?;
        let balances = state.check_delta(withdrawal.user_id, &withdrawal.settle_delta())?;

        let user = state.set_balances(withdrawal.user_id, balances, now)?;
        state.finish_transaction(withdrawal.transaction_id, TransactionStatus::Completed, None, now);

        let stored = state
            .withdrawals
            .get_mut(&withdrawal.id)
            .ok_or_else(|| CrmError::not_found("Withdrawal", withdrawal.id))?;
        stored.status = ReviewStatus::Approved;
        stored.processed_at = Some(now);

        Ok((stored.clone(), user))
    }

    async fn reject_withdrawal(&self, review: Review<Rejected>, now: DateTime<Utc>) -> Result<(WithdrawalRequest, User)> {
        let mut state = self.state.lock().await;

        let withdrawal = state.pending_withdrawal(review.id())?;
        let balances = state.check_delta(withdrawal.user_id, &withdrawal.release_delta())?;

        let user = state.set_balances(withdrawal.user_id, balances, now)?;
        state.finish_transaction(withdrawal.transaction_id, TransactionStatus::Failed, review.notes(), now);

        let stored = state
            .withdrawals
            .get_mut(&withdrawal.id)
            .ok_or_else(|| CrmError::not_found("Withdrawal", withdrawal.id))?;
        stored.status = ReviewStatus::Rejected;
        stored.rejection_reason = review.notes().map(str::to_string);
        stored.processed_at = Some(now);

        Ok((stored.clone(), user))
    }

    async fn get_commission(&self, id: Uuid) -> Result<Option<ReferralCommission>> {
        Ok(self.state.lock().await.commissions.get(&id).cloned())
    }

    async fn list_commissions(
        &self,
        referrer_id: Option<Uuid>,
        status: Option<ReviewStatus>,
        page: PageRequest,
    ) -> Result<(Vec<ReferralCommission>, i64)> {
        let state = self.state.lock().await;
        let items: Vec<ReferralCommission> = state
            .commissions
            .values()
            .filter(|c| referrer_id.map_or(true, |id| c.referrer_id == id))
            .filter(|c| status.map_or(true, |s| c.status == s))
            .cloned()
            .collect();
        Ok(paginate(items, page, |a, b| {
            (b.year, b.month, b.created_at).cmp(&(a.year, a.month, a.created_at))
        }))
    }

    async fn commission_totals(&self, referrer_id: Uuid) -> Result<ReferralTotals> {
        let state = self.state.lock().await;
        let mut totals = ReferralTotals::default();
        for commission in state.commissions.values().filter(|c| c.referrer_id == referrer_id) {
            totals.pending += commission.unsettled_amount();
            totals.approved += commission.paid_amount;
            totals.rejected += commission.rejected_amount;
        }
        Ok(totals)
    }

    async fn approve_commission(&self, review: Review<Approved>, now: DateTime<Utc>) -> Result<(ReferralCommission, User)> {
        let mut state = self.state.lock().await;

        let commission = state.pending_commission(review.id())?;
        let payout_amount = commission.unsettled_amount();
        let payout_tokens = commission.unsettled_tokens();

        let referrer = state.user_mut(commission.referrer_id)?;
        referrer.referral_earnings += payout_amount;
        referrer.total_earnings += payout_amount;
        referrer.updated_at = now;
        let referrer = referrer.clone();

        let stored = state
            .commissions
            .get_mut(&commission.id)
            .ok_or_else(|| CrmError::not_found("Commission", commission.id))?;
        stored.status = ReviewStatus::Approved;
        stored.is_paid = true;
        stored.paid_amount += payout_amount;
        stored.settled_token_amount = stored.token_amount;
        stored.admin_notes = review.notes().map(str::to_string);
        stored.reviewed_by = Some(review.reviewer());
        stored.reviewed_at = Some(now);
        stored.updated_at = now;
        let approved = stored.clone();

        let payout = commission_payout(&approved, payout_amount, payout_tokens, now);
        state.transactions.insert(payout.id, payout);

        Ok((approved, referrer))
    }

    async fn reject_commission(&self, review: Review<Rejected>, now: DateTime<Utc>) -> Result<ReferralCommission> {
        let mut state = self.state.lock().await;

        let commission = state.pending_commission(review.id())?;
        let stored = state
            .commissions
            .get_mut(&commission.id)
            .ok_or_else(|| CrmError::not_found("Commission", commission.id))?;
        stored.status = ReviewStatus::Rejected;
        stored.rejected_amount += commission.unsettled_amount();
        stored.settled_token_amount = stored.token_amount;
        stored.admin_notes = review.notes().map(str::to_string);
        stored.reviewed_by = Some(review.reviewer());
        stored.reviewed_at = Some(now);
        stored.updated_at = now;

        Ok(stored.clone())
    }

    async fn insert_notification(&self, notification: Notification) -> Result<Notification> {
        self.state
            .lock()
            .await
            .notifications
            .push(notification.clone());
        Ok(notification)
    }

    async fn list_notifications(&self, user_id: Uuid, page: PageRequest) -> Result<(Vec<Notification>, i64)> {
        let state = self.state.lock().await;
        let items: Vec<Notification> = state
            .notifications
            .iter()
            .filter(|n| n.user_id.map_or(true, |id| id == user_id))
            .cloned()
            .collect();
        Ok(paginate(items, page, |a, b| b.created_at.cmp(&a.created_at)))
    }

    async fn mark_notification_read(&self, id: Uuid, user_id: Uuid) -> Result<Notification> {
        let mut state = self.state.lock().await;
        let notification = state
            .notifications
            .iter_mut()
            .find(|n| n.id == id && n.user_id == Some(user_id))
            .ok_or_else(|| CrmError::not_found("Notification", id))?;
        notification.is_read = true;
        Ok(notification.clone())
    }

    async fn dashboard_stats(&self) -> Result<DashboardStats> {
        let state = self.state.lock().await;
        let mut stats = DashboardStats {
            total_users: state.users.len() as i64,
            active_users: state.users.values().filter(|u| u.is_active).count() as i64,
            pending_transactions: state
                .transactions
                .values()
                .filter(|t| t.status == TransactionStatus::Pending)
                .count() as i64,
            pending_withdrawals: state
                .withdrawals
                .values()
                .filter(|w| w.status == ReviewStatus::Pending)
                .count() as i64,
            pending_commissions: state
                .commissions
                .values()
                .filter(|c| c.status == ReviewStatus::Pending)
                .count() as i64,
            ..Default::default()
        };
        for user in state.users.values() {
            stats.total_tokens += user.total_tokens;
            stats.staked_tokens += user.staked_tokens;
            stats.usdt_balance += user.usdt_balance;
        }
        Ok(stats)
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::LedgerDelta;
    use crate::models::TransactionType;
    use rust_decimal_macros::dec;

    fn new_user(email: &str, code: &str) -> NewUser {
        NewUser {
            name: "Test User".to_string(),
            email: email.to_string(),
            contact_number: "5550100".to_string(),
            country: "AE".to_string(),
            state: "Dubai".to_string(),
            password_hash: String::new(),
            role: Role::User,
            referral_code: code.to_string(),
            referred_by: None,
        }
    }

    #[tokio::test]
    async fn test_failed_event_leaves_no_records() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let user = store
            .create_user(new_user("a@example.com", "AAAA2222"), None, now)
            .await
            .unwrap();

        let tx = Transaction::new(user.id, TransactionType::Stake, TransactionStatus::Completed, now);
        let err = store
            .commit_ledger_event(LedgerEvent::new(user.id, LedgerDelta::stake(dec!(1)), tx.clone(), now))
            .await
            .unwrap_err();

        assert!(matches!(err, CrmError::InsufficientFunds { .. }));
        assert!(store.get_transaction(tx.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_email_is_conflict() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store
            .create_user(new_user("dup@example.com", "AAAA2222"), None, now)
            .await
            .unwrap();
        let err = store
            .create_user(new_user("DUP@example.com", "BBBB3333"), None, now)
            .await
            .unwrap_err();
        assert!(matches!(err, CrmError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_latest_price_is_most_recent_date() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let day = |d| NaiveDate::from_ymd_opt(2026, 10, d).unwrap();
        store.put_price(day(3), dec!(2.90), now).await.unwrap();
        store.put_price(day(9), dec!(3.05), now).await.unwrap();
        store.put_price(day(5), dec!(2.70), now).await.unwrap();

        assert_eq!(store.latest_price().await.unwrap(), Some(dec!(3.05)));
        assert_eq!(store.price_on(day(5)).await.unwrap(), Some(dec!(2.70)));
        assert_eq!(store.price_on(day(6)).await.unwrap(), None);
    }
}
