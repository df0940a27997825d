//! Postgres store.
//!
//! Balance writes use a single conditional UPDATE whose WHERE clause carries
//! the ledger invariants, so the check and the write are one statement and two
//! concurrent requests cannot both pass the check. Reviewable rows are locked
//! with `SELECT ... FOR UPDATE` for the duration of their transaction.

use super::{commission_payout, CommissionOutcome, CrmStore, LedgerEvent};
use crate::approval::{already, Approved, Rejected, Review, Reviewable};
use crate::commission::CommissionAccrual;
use crate::config::DatabaseConfig;
use crate::errors::{CrmError, Result};
use crate::ledger::LedgerDelta;
use crate::lock_gate;
use crate::models::{
    DashboardStats, NewUser, Notification, PageRequest, ReferralCommission, ReferralTotals,
    ReviewStatus, Role, StakingRecord, StakingStatus, Transaction, TransactionStatus, User,
    WithdrawalRequest,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .connect(&config.url)
            .await?;

        info!("Connected to Postgres (max {} connections)", config.max_connections);
        Ok(PgStore { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        PgStore { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations applied");
        Ok(())
    }
}

fn unique_violation(err: sqlx::Error, message: &str) -> CrmError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.is_unique_violation() {
            return CrmError::Conflict(message.to_string());
        }
    }
    err.into()
}

/// Applies `delta` to the user's balances only if every ledger invariant
/// still holds afterwards.
async fn apply_delta(conn: &mut PgConnection, user_id: Uuid, delta: &LedgerDelta, now: DateTime<Utc>) -> Result<User> {
    let updated = sqlx::query_as::<_, User>(
        r#"
        UPDATE users
        SET total_tokens = total_tokens + $2,
            available_tokens = available_tokens + $3,
            staked_tokens = staked_tokens + $4,
            usdt_balance = usdt_balance + $5,
            updated_at = $6
        WHERE id = $1
          AND available_tokens + $3 >= 0
          AND staked_tokens + $4 >= 0
          AND usdt_balance + $5 >= 0
          AND (available_tokens + $3) + (staked_tokens + $4) <= total_tokens + $2
        RETURNING *
        "#,
    )
    .bind(user_id)
    .bind(delta.total_tokens)
    .bind(delta.available_tokens)
    .bind(delta.staked_tokens)
    .bind(delta.usdt)
    .bind(now)
    .fetch_optional(&mut *conn)
    .await?;

    if let Some(user) = updated {
        return Ok(user);
    }

    // Nothing matched: report why using the row as it is now.
    let current = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1")
        .bind(user_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| CrmError::not_found("User", user_id))?;
    current.balances().apply(delta)?;

    Err(CrmError::Conflict(
        "Balance changed concurrently, please retry".to_string(),
    ))
}

async fn insert_transaction_row(conn: &mut PgConnection, transaction: &Transaction) -> Result<Transaction> {
    let row = sqlx::query_as::<_, Transaction>(
        r#"
        INSERT INTO transactions (
            id, user_id, tx_type, amount, token_amount, price_per_token, status,
            payment_method, processing_fee, reference, notes, created_at, processed_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        RETURNING *
        "#,
    )
    .bind(transaction.id)
    .bind(transaction.user_id)
    .bind(transaction.tx_type)
    .bind(transaction.amount)
    .bind(transaction.token_amount)
    .bind(transaction.price_per_token)
    .bind(transaction.status)
    .bind(&transaction.payment_method)
    .bind(transaction.processing_fee)
    .bind(&transaction.reference)
    .bind(&transaction.notes)
    .bind(transaction.created_at)
    .bind(transaction.processed_at)
    .fetch_one(&mut *conn)
    .await?;

    Ok(row)
}

async fn finish_transaction(
    conn: &mut PgConnection,
    id: Uuid,
    status: TransactionStatus,
    notes: Option<&str>,
    now: DateTime<Utc>,
) -> Result<Transaction> {
    let row = sqlx::query_as::<_, Transaction>(
        r#"
        UPDATE transactions
        SET status = $2, processed_at = $3, notes = COALESCE($4, notes)
        WHERE id = $1 AND status = 'PENDING'
        RETURNING *
        "#,
    )
    .bind(id)
    .bind(status)
    .bind(now)
    .bind(notes)
    .fetch_optional(&mut *conn)
    .await?;

    row.ok_or_else(|| already("Transaction", "processed"))
}

/// Adds to the bucket for the period, creating it if needed. A bucket that
/// was already reviewed goes back to PENDING with the new amount unsettled.
async fn accrue(conn: &mut PgConnection, accrual: &CommissionAccrual, now: DateTime<Utc>) -> Result<CommissionOutcome> {
    let previous = sqlx::query_scalar::<_, ReviewStatus>(
        r#"
        SELECT status FROM referral_commissions
        WHERE referrer_id = $1 AND referred_user_id = $2 AND month = $3 AND year = $4
        FOR UPDATE
        "#,
    )
    .bind(accrual.referrer_id)
    .bind(accrual.referred_user_id)
    .bind(accrual.period.month)
    .bind(accrual.period.year)
    .fetch_optional(&mut *conn)
    .await?;

    let commission = sqlx::query_as::<_, ReferralCommission>(
        r#"
        INSERT INTO referral_commissions (
            id, referrer_id, referred_user_id, month, year, amount, token_amount,
            commission_rate, status, is_paid, created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'PENDING', FALSE, $9, $9)
        ON CONFLICT (referrer_id, referred_user_id, month, year)
        DO UPDATE SET
            amount = referral_commissions.amount + EXCLUDED.amount,
            token_amount = referral_commissions.token_amount + EXCLUDED.token_amount,
            commission_rate = EXCLUDED.commission_rate,
            status = 'PENDING',
            is_paid = FALSE,
            updated_at = EXCLUDED.updated_at
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(accrual.referrer_id)
    .bind(accrual.referred_user_id)
    .bind(accrual.period.month)
    .bind(accrual.period.year)
    .bind(accrual.amount)
    .bind(accrual.token_amount)
    .bind(accrual.rate)
    .bind(now)
    .fetch_one(&mut *conn)
    .await?;

    Ok(match previous {
        Some(status) if !status.is_pending() => CommissionOutcome::Reopened(commission),
        _ => CommissionOutcome::Accrued(commission),
    })
}

async fn lock_pending_transaction(conn: &mut PgConnection, id: Uuid) -> Result<Transaction> {
    let transaction = sqlx::query_as::<_, Transaction>("SELECT * FROM transactions WHERE id = $1 FOR UPDATE")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| CrmError::not_found("Transaction", id))?;

    if !transaction.status.is_pending() {
        return Err(already("Transaction", transaction.status.label()));
    }
    Ok(transaction)
}

async fn lock_pending_withdrawal(conn: &mut PgConnection, id: Uuid) -> Result<WithdrawalRequest> {
    let withdrawal =
        sqlx::query_as::<_, WithdrawalRequest>("SELECT * FROM withdrawal_requests WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or_else(|| CrmError::not_found("Withdrawal", id))?;

    if !withdrawal.status.is_pending() {
        return Err(already("Withdrawal", withdrawal.status.label()));
    }
    Ok(withdrawal)
}

async fn lock_pending_commission(conn: &mut PgConnection, id: Uuid) -> Result<ReferralCommission> {
    let commission =
        sqlx::query_as::<_, ReferralCommission>("SELECT * FROM referral_commissions WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or_else(|| CrmError::not_found("Commission", id))?;

    if !commission.status.is_pending() {
        return Err(already("Commission", commission.status.label()));
    }
    Ok(commission)
}

#[async_trait]
impl CrmStore for PgStore {
    async fn create_user(&self, user: NewUser, referral: Option<CommissionAccrual>, now: DateTime<Utc>) -> Result<User> {
        let mut tx = self.pool.begin().await?;

        let created = sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (
                id, name, email, contact_number, country, state, password_hash, role,
                is_active, referral_code, referred_by, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, TRUE, $9, $10, $11, $11)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&user.name)
        .bind(&user.email)
        .bind(&user.contact_number)
        .bind(&user.country)
        .bind(&user.state)
        .bind(&user.password_hash)
        .bind(user.role)
        .bind(&user.referral_code)
        .bind(&user.referred_by)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| unique_violation(e, "Email or referral code already registered"))?;

        if let Some(mut accrual) = referral {
            accrual.referred_user_id = created.id;
            accrue(&mut tx, &accrual, now).await?;
        }

        tx.commit().await?;
        Ok(created)
    }

    async fn get_user(&self, id: Uuid) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE LOWER(email) = LOWER($1)")
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    async fn find_user_by_referral_code(&self, code: &str) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE referral_code = $1")
            .bind(code)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    async fn list_users(&self, page: PageRequest) -> Result<(Vec<User>, i64)> {
        let users = sqlx::query_as::<_, User>(
            "SELECT * FROM users ORDER BY created_at DESC LIMIT $1 OFFSET $2",
        )
        .bind(page.limit)
        .bind(page.offset())
        .fetch_all(&self.pool)
        .await?;

        let total = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM users")
            .fetch_one(&self.pool)
            .await?;

        Ok((users, total))
    }

    async fn set_user_active(&self, id: Uuid, is_active: bool, now: DateTime<Utc>) -> Result<User> {
        sqlx::query_as::<_, User>(
            "UPDATE users SET is_active = $2, updated_at = $3 WHERE id = $1 RETURNING *",
        )
        .bind(id)
        .bind(is_active)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| CrmError::not_found("User", id))
    }

    async fn set_user_role(&self, id: Uuid, role: Role, now: DateTime<Utc>) -> Result<User> {
        sqlx::query_as::<_, User>("UPDATE users SET role = $2, updated_at = $3 WHERE id = $1 RETURNING *")
            .bind(id)
            .bind(role)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| CrmError::not_found("User", id))
    }

    async fn count_referred_users(&self, referral_code: &str) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM users WHERE referred_by = $1")
            .bind(referral_code)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let value = sqlx::query_scalar::<_, String>("SELECT value FROM settings WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    async fn put_setting(&self, key: &str, value: &str, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO settings (key, value, updated_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn price_on(&self, date: NaiveDate) -> Result<Option<Decimal>> {
        let price = sqlx::query_scalar::<_, Decimal>("SELECT price FROM token_prices WHERE price_date = $1")
            .bind(date)
            .fetch_optional(&self.pool)
            .await?;
        Ok(price)
    }

    async fn latest_price(&self) -> Result<Option<Decimal>> {
        let price = sqlx::query_scalar::<_, Decimal>(
            "SELECT price FROM token_prices ORDER BY price_date DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(price)
    }

    async fn put_price(&self, date: NaiveDate, price: Decimal, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO token_prices (price_date, price, updated_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (price_date) DO UPDATE SET price = EXCLUDED.price, updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(date)
        .bind(price)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn commit_ledger_event(&self, event: LedgerEvent) -> Result<User> {
        let mut tx = self.pool.begin().await?;

        let user = apply_delta(&mut tx, event.user_id, &event.delta, event.at).await?;
        insert_transaction_row(&mut tx, &event.transaction).await?;

        if let Some(record) = &event.staking {
            sqlx::query(
                r#"
                INSERT INTO staking_records (id, user_id, amount, start_date, end_date, apy, rewards, status)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(record.id)
            .bind(record.user_id)
            .bind(record.amount)
            .bind(record.start_date)
            .bind(record.end_date)
            .bind(record.apy)
            .bind(record.rewards)
            .bind(record.status)
            .execute(&mut *tx)
            .await?;
        }

        if let Some(request) = &event.withdrawal {
            sqlx::query(
                r#"
                INSERT INTO withdrawal_requests (
                    id, user_id, transaction_id, asset, amount, token_amount, network,
                    wallet_address, status, created_at, unlock_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                "#,
            )
            .bind(request.id)
            .bind(request.user_id)
            .bind(request.transaction_id)
            .bind(request.asset)
            .bind(request.amount)
            .bind(request.token_amount)
            .bind(&request.network)
            .bind(&request.wallet_address)
            .bind(request.status)
            .bind(request.created_at)
            .bind(request.unlock_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(user)
    }

    async fn insert_transaction(&self, transaction: Transaction) -> Result<Transaction> {
        let mut conn = self.pool.acquire().await?;
        insert_transaction_row(&mut conn, &transaction).await
    }

    async fn get_transaction(&self, id: Uuid) -> Result<Option<Transaction>> {
        let transaction = sqlx::query_as::<_, Transaction>("SELECT * FROM transactions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(transaction)
    }

    async fn list_transactions(&self, user_id: Option<Uuid>, page: PageRequest) -> Result<(Vec<Transaction>, i64)> {
        let items = sqlx::query_as::<_, Transaction>(
            r#"
            SELECT * FROM transactions
            WHERE ($1::uuid IS NULL OR user_id = $1)
            ORDER BY created_at DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(user_id)
        .bind(page.limit)
        .bind(page.offset())
        .fetch_all(&self.pool)
        .await?;

        let total = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM transactions WHERE ($1::uuid IS NULL OR user_id = $1)",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok((items, total))
    }

    async fn complete_purchase(
        &self,
        review: Review<Approved>,
        commission: Option<CommissionAccrual>,
        now: DateTime<Utc>,
    ) -> Result<(Transaction, User, CommissionOutcome)> {
        let mut tx = self.pool.begin().await?;

        let pending = lock_pending_transaction(&mut tx, review.id()).await?;
        let user = apply_delta(
            &mut tx,
            pending.user_id,
            &LedgerDelta::credit_tokens(pending.token_amount),
            now,
        )
        .await?;
        let completed = finish_transaction(
            &mut tx,
            pending.id,
            TransactionStatus::Completed,
            review.notes(),
            now,
        )
        .await?;

        let outcome = match &commission {
            Some(accrual) => accrue(&mut tx, accrual, now).await?,
            None => CommissionOutcome::NotReferred,
        };

        tx.commit().await?;
        Ok((completed, user, outcome))
    }

    async fn reject_transaction(&self, review: Review<Rejected>, now: DateTime<Utc>) -> Result<Transaction> {
        let mut tx = self.pool.begin().await?;

        let pending = lock_pending_transaction(&mut tx, review.id()).await?;
        let rejected = finish_transaction(
            &mut tx,
            pending.id,
            TransactionStatus::Rejected,
            review.notes(),
            now,
        )
        .await?;

        tx.commit().await?;
        Ok(rejected)
    }

    async fn get_stake(&self, id: Uuid) -> Result<Option<StakingRecord>> {
        let record = sqlx::query_as::<_, StakingRecord>("SELECT * FROM staking_records WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }

    async fn list_stakes(&self, user_id: Uuid, page: PageRequest) -> Result<(Vec<StakingRecord>, i64)> {
        let items = sqlx::query_as::<_, StakingRecord>(
            "SELECT * FROM staking_records WHERE user_id = $1 ORDER BY start_date DESC LIMIT $2 OFFSET $3",
        )
        .bind(user_id)
        .bind(page.limit)
        .bind(page.offset())
        .fetch_all(&self.pool)
        .await?;

        let total = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM staking_records WHERE user_id = $1")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;

        Ok((items, total))
    }

    async fn complete_stake(&self, id: Uuid, now: DateTime<Utc>) -> Result<(StakingRecord, User)> {
        let mut tx = self.pool.begin().await?;

        let record = sqlx::query_as::<_, StakingRecord>("SELECT * FROM staking_records WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| CrmError::not_found("Staking record", id))?;
        if record.status == StakingStatus::Completed {
            return Err(CrmError::Conflict("Staking record already completed".to_string()));
        }
        lock_gate::ensure_unlocked(record.end_date, now)?;

        let user = apply_delta(&mut tx, record.user_id, &LedgerDelta::unstake(record.amount), now).await?;
        let completed = sqlx::query_as::<_, StakingRecord>(
            "UPDATE staking_records SET status = 'COMPLETED', completed_at = $2 WHERE id = $1 RETURNING *",
        )
        .bind(id)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok((completed, user))
    }

    async fn get_withdrawal(&self, id: Uuid) -> Result<Option<WithdrawalRequest>> {
        let request = sqlx::query_as::<_, WithdrawalRequest>("SELECT * FROM withdrawal_requests WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(request)
    }

    async fn list_withdrawals(&self, user_id: Option<Uuid>, page: PageRequest) -> Result<(Vec<WithdrawalRequest>, i64)> {
        let items = sqlx::query_as::<_, WithdrawalRequest>(
            r#"
            SELECT * FROM withdrawal_requests
            WHERE ($1::uuid IS NULL OR user_id = $1)
            ORDER BY created_at DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(user_id)
        .bind(page.limit)
        .bind(page.offset())
        .fetch_all(&self.pool)
        .await?;

        let total = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM withdrawal_requests WHERE ($1::uuid IS NULL OR user_id = $1)",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok((items, total))
    }

    async fn approve_withdrawal(&self, review: Review<Approved>, now: DateTime<Utc>) -> Result<(WithdrawalRequest, User)> {
        let mut tx = self.pool.begin().await?;

        let pending = lock_pending_withdrawal(&mut tx, review.id()).await?;
        lock_gate::ensure_unlocked(pending.unlock_at, now)?;

        let user = apply_delta(&mut tx, pending.user_id, &pending.settle_delta(), now).await?;
        finish_transaction(&mut tx, pending.transaction_id, TransactionStatus::Completed, None, now).await?;

        let approved = sqlx::query_as::<_, WithdrawalRequest>(
            r#"
            UPDATE withdrawal_requests
            SET status = 'APPROVED', processed_at = $2
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(pending.id)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok((approved, user))
    }

    async fn reject_withdrawal(&self, review: Review<Rejected>, now: DateTime<Utc>) -> Result<(WithdrawalRequest, User)> {
        let mut tx = self.pool.begin().await?;

        let pending = lock_pending_withdrawal(&mut tx, review.id()).await?;
        let user = apply_delta(&mut tx, pending.user_id, &pending.release_delta(), now).await?;
        finish_transaction(
            &mut tx,
            pending.transaction_id,
            TransactionStatus::Failed,
            review.notes(),
            now,
        )
        .await?;

        let rejected = sqlx::query_as::<_, WithdrawalRequest>(
            r#"
            UPDATE withdrawal_requests
            SET status = 'REJECTED', rejection_reason = $2, processed_at = $3
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(pending.id)
        .bind(review.notes())
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok((rejected, user))
    }

    async fn get_commission(&self, id: Uuid) -> Result<Option<ReferralCommission>> {
        let commission = sqlx::query_as::<_, ReferralCommission>("SELECT * FROM referral_commissions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(commission)
    }

    async fn list_commissions(
        &self,
        referrer_id: Option<Uuid>,
        status: Option<ReviewStatus>,
        page: PageRequest,
    ) -> Result<(Vec<ReferralCommission>, i64)> {
        let items = sqlx::query_as::<_, ReferralCommission>(
            r#"
            SELECT * FROM referral_commissions
            WHERE ($1::uuid IS NULL OR referrer_id = $1)
              AND ($2::review_status IS NULL OR status = $2)
            ORDER BY year DESC, month DESC, created_at DESC
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(referrer_id)
        .bind(status)
        .bind(page.limit)
        .bind(page.offset())
        .fetch_all(&self.pool)
        .await?;

        let total = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*) FROM referral_commissions
            WHERE ($1::uuid IS NULL OR referrer_id = $1)
              AND ($2::review_status IS NULL OR status = $2)
            "#,
        )
        .bind(referrer_id)
        .bind(status)
        .fetch_one(&self.pool)
        .await?;

        Ok((items, total))
    }

    async fn commission_totals(&self, referrer_id: Uuid) -> Result<ReferralTotals> {
        let (pending, approved, rejected) = sqlx::query_as::<_, (Decimal, Decimal, Decimal)>(
            r#"
            SELECT
                COALESCE(SUM(amount - paid_amount - rejected_amount), 0),
                COALESCE(SUM(paid_amount), 0),
                COALESCE(SUM(rejected_amount), 0)
            FROM referral_commissions
            WHERE referrer_id = $1
            "#,
        )
        .bind(referrer_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(ReferralTotals {
            pending,
            approved,
            rejected,
        })
    }

    async fn approve_commission(&self, review: Review<Approved>, now: DateTime<Utc>) -> Result<(ReferralCommission, User)> {
        let mut tx = self.pool.begin().await?;

        let pending = lock_pending_commission(&mut tx, review.id()).await?;

        let referrer = sqlx::query_as::<_, User>(
            r#"
            UPDATE users
            SET referral_earnings = referral_earnings + $2,
                total_earnings = total_earnings + $2,
                updated_at = $3
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(pending.referrer_id)
        .bind(pending.unsettled_amount())
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| CrmError::not_found("User", pending.referrer_id))?;

        let approved = sqlx::query_as::<_, ReferralCommission>(
            r#"
            UPDATE referral_commissions
            SET status = 'APPROVED', is_paid = TRUE,
                paid_amount = amount - rejected_amount,
                settled_token_amount = token_amount,
                admin_notes = $2, reviewed_by = $3, reviewed_at = $4, updated_at = $4
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(pending.id)
        .bind(review.notes())
        .bind(review.reviewer())
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        let payout = commission_payout(&approved, pending.unsettled_amount(), pending.unsettled_tokens(), now);
        insert_transaction_row(&mut tx, &payout).await?;

        tx.commit().await?;
        Ok((approved, referrer))
    }

    async fn reject_commission(&self, review: Review<Rejected>, now: DateTime<Utc>) -> Result<ReferralCommission> {
        let mut tx = self.pool.begin().await?;

        let pending = lock_pending_commission(&mut tx, review.id()).await?;
        let rejected = sqlx::query_as::<_, ReferralCommission>(
            r#"
            UPDATE referral_commissions
            SET status = 'REJECTED',
                rejected_amount = amount - paid_amount,
                settled_token_amount = token_amount,
                admin_notes = $2, reviewed_by = $3, reviewed_at = $4, updated_at = $4
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(pending.id)
        .bind(review.notes())
        .bind(review.reviewer())
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(rejected)
    }

    async fn insert_notification(&self, notification: Notification) -> Result<Notification> {
        let row = sqlx::query_as::<_, Notification>(
            r#"
            INSERT INTO notifications (id, user_id, kind, title, message, is_read, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING *
            "#,
        )
        .bind(notification.id)
        .bind(notification.user_id)
        .bind(notification.kind)
        .bind(&notification.title)
        .bind(&notification.message)
        .bind(notification.is_read)
        .bind(notification.created_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    async fn list_notifications(&self, user_id: Uuid, page: PageRequest) -> Result<(Vec<Notification>, i64)> {
        let items = sqlx::query_as::<_, Notification>(
            r#"
            SELECT * FROM notifications
            WHERE user_id = $1 OR user_id IS NULL
            ORDER BY created_at DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(user_id)
        .bind(page.limit)
        .bind(page.offset())
        .fetch_all(&self.pool)
        .await?;

        let total = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM notifications WHERE user_id = $1 OR user_id IS NULL",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok((items, total))
    }

    async fn mark_notification_read(&self, id: Uuid, user_id: Uuid) -> Result<Notification> {
        sqlx::query_as::<_, Notification>(
            "UPDATE notifications SET is_read = TRUE WHERE id = $1 AND user_id = $2 RETURNING *",
        )
        .bind(id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| CrmError::not_found("Notification", id))
    }

    async fn dashboard_stats(&self) -> Result<DashboardStats> {
        let stats = sqlx::query_as::<_, DashboardStats>(
            r#"
            SELECT
                (SELECT COUNT(*) FROM users) AS total_users,
                (SELECT COUNT(*) FROM users WHERE is_active) AS active_users,
                (SELECT COUNT(*) FROM transactions WHERE status = 'PENDING') AS pending_transactions,
                (SELECT COUNT(*) FROM withdrawal_requests WHERE status = 'PENDING') AS pending_withdrawals,
                (SELECT COUNT(*) FROM referral_commissions WHERE status = 'PENDING') AS pending_commissions,
                (SELECT COALESCE(SUM(total_tokens), 0) FROM users) AS total_tokens,
                (SELECT COALESCE(SUM(staked_tokens), 0) FROM users) AS staked_tokens,
                (SELECT COALESCE(SUM(usdt_balance), 0) FROM users) AS usdt_balance
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(stats)
    }

    async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
