use crate::approval::Review;
use crate::auth::{self, Capability, SessionKeys};
use crate::commission::{self, CommissionAccrual, COMMISSION_RATE_KEY};
use crate::config::BusinessConfig;
use crate::errors::{CrmError, Result};
use crate::ledger::LedgerDelta;
use crate::lock_gate;
use crate::metrics;
use crate::models::{
    AuthResponse, BroadcastRequest, CommissionFilter, CommissionRateRequest,
    CommissionReviewRequest, ConversionResponse, ConvertRequest, DashboardStats, NewUser,
    Notification, NotificationType, Page, PageQuery, PageRequest, PurchaseRequest, PurchaseResponse,
    ReferralCommission, ReferralSummary, ReviewAction, ReviewStatus, Role, SignInRequest, SignUpRequest,
    StakeRequest, StakeResponse, StakingRecord, TokenPriceRequest, TokenPriceResponse,
    TokenWithdrawRequest, Transaction, TransactionReviewRequest, TransactionStatus,
    TransactionType, UnstakeRequest, UnstakeResponse, User, UserRoleRequest, UserStatusRequest,
    UsdtWithdrawRequest, WithdrawalAsset, WithdrawalRequest, WithdrawalReviewRequest,
    WithdrawalView,
};
use crate::notifications::{self, Mailer, Notifier};
use crate::pricing;
use crate::staking::{self, StakingTerms};
use crate::store::{CommissionOutcome, CrmStore, LedgerEvent};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};
use uuid::Uuid;
use validator::Validate;

const REFERRAL_CODE_ATTEMPTS: usize = 5;
const DEFAULT_USDT_NETWORK: &str = "TRC20";

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock for exercising lock periods
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        FixedClock { now: Mutex::new(now) }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += by;
        }
    }

    pub fn set(&self, to: DateTime<Utc>) {
        if let Ok(mut now) = self.now.lock() {
            *now = to;
        }
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        match self.now.lock() {
            Ok(now) => *now,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

pub struct CrmService {
    store: Arc<dyn CrmStore>,
    notifier: Notifier,
    sessions: SessionKeys,
    business: BusinessConfig,
    clock: Arc<dyn Clock>,
}

impl CrmService {
    pub fn new(
        store: Arc<dyn CrmStore>,
        mailer: Arc<dyn Mailer>,
        sessions: SessionKeys,
        business: BusinessConfig,
        admin_address: String,
    ) -> Self {
        let notifier = Notifier::new(store.clone(), mailer, admin_address);
        CrmService {
            store,
            notifier,
            sessions,
            business,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn sessions(&self) -> &SessionKeys {
        &self.sessions
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    // ===== Accounts =====

    pub async fn sign_up(&self, request: SignUpRequest) -> Result<User> {
        request.validate()?;
        let now = self.now();
        let email = request.email.trim().to_lowercase();

        if self.store.find_user_by_email(&email).await?.is_some() {
            return Err(CrmError::Conflict("Email already registered".to_string()));
        }

        let referrer = match request
            .referral_code
            .as_deref()
            .map(|code| code.trim().to_uppercase())
            .filter(|code| !code.is_empty())
        {
            Some(code) => {
                let found = self.store.find_user_by_referral_code(&code).await?;
                if found.is_none() {
                    warn!(referral_code = %code, "Unknown referral code ignored at sign-up");
                }
                found
            }
            None => None,
        };

        let referral_code = self.unique_referral_code().await?;
        let accrual = match &referrer {
            Some(referrer) => Some(CommissionAccrual::signup(
                referrer.id,
                Uuid::nil(),
                self.commission_rate().await?,
                now,
            )),
            None => None,
        };

        let new_user = NewUser {
            name: request.name.trim().to_string(),
            email,
            contact_number: request.contact_number,
            country: request.country,
            state: request.state,
            password_hash: auth::hash_password(&request.password)?,
            role: Role::User,
            referral_code,
            referred_by: referrer.as_ref().map(|r| r.referral_code.clone()),
        };

        let user = self.store.create_user(new_user, accrual, now).await?;
        metrics::SIGN_UPS.inc();
        info!(user_id = %user.id, referred = user.referred_by.is_some(), "User signed up");

        self.notifier.email(notifications::welcome_email(&user)).await;
        self.notifier
            .notify_admins("New DiTokens registration", notifications::admin_signup_body(&user))
            .await;

        Ok(user)
    }

    async fn unique_referral_code(&self) -> Result<String> {
        for _ in 0..REFERRAL_CODE_ATTEMPTS {
            let code = auth::generate_referral_code();
            if self.store.find_user_by_referral_code(&code).await?.is_none() {
                return Ok(code);
            }
        }
        Err(CrmError::Internal(
            "could not generate a unique referral code".to_string(),
        ))
    }

    pub async fn sign_in(&self, request: SignInRequest) -> Result<AuthResponse> {
        request.validate()?;

        let user = match self.store.find_user_by_email(request.email.trim()).await? {
            Some(user) if auth::verify_password(&request.password, &user.password_hash) => user,
            _ => {
                metrics::SIGN_IN_FAILURES.inc();
                return Err(CrmError::InvalidCredentials);
            }
        };

        if !user.is_active {
            metrics::SIGN_IN_FAILURES.inc();
            return Err(CrmError::AccountDeactivated);
        }

        // Token expiry is checked against the wall clock.
        let (token, expires_at) = self.sessions.issue(&user, Utc::now())?;
        info!(user_id = %user.id, "User signed in");

        Ok(AuthResponse {
            user,
            token,
            expires_at,
        })
    }

    /// Loads the caller from storage. The persisted record, not the session
    /// token, is the source of truth for role and active state.
    pub async fn current_user(&self, user_id: Uuid) -> Result<User> {
        let user = self
            .store
            .get_user(user_id)
            .await?
            .ok_or(CrmError::Unauthorized)?;

        if !user.is_active {
            return Err(CrmError::AccountDeactivated);
        }
        Ok(user)
    }

    pub async fn authorize(&self, user_id: Uuid, capability: Capability) -> Result<User> {
        let user = self.current_user(user_id).await?;
        auth::require(&user, capability)?;
        Ok(user)
    }

    /// Makes sure the configured operator account exists with the top role.
    pub async fn bootstrap_admin(&self, email: &str, password: &str) -> Result<User> {
        let now = self.now();
        let email = email.trim().to_lowercase();

        if let Some(existing) = self.store.find_user_by_email(&email).await? {
            if existing.role == Role::SuperAdmin {
                return Ok(existing);
            }
            info!(user_id = %existing.id, "Promoting bootstrap account to SUPERADMIN");
            return self.store.set_user_role(existing.id, Role::SuperAdmin, now).await;
        }

        let new_user = NewUser {
            name: "Administrator".to_string(),
            email,
            contact_number: "-".to_string(),
            country: "-".to_string(),
            state: "-".to_string(),
            password_hash: auth::hash_password(password)?,
            role: Role::SuperAdmin,
            referral_code: self.unique_referral_code().await?,
            referred_by: None,
        };

        let admin = self.store.create_user(new_user, None, now).await?;
        info!(user_id = %admin.id, "Bootstrap SUPERADMIN created");
        Ok(admin)
    }

    // ===== Purchases =====

    pub async fn purchase(&self, user_id: Uuid, request: PurchaseRequest) -> Result<PurchaseResponse> {
        request.validate()?;
        let user = self.current_user(user_id).await?;

        if request.amount < self.business.min_purchase_amount {
            return Err(CrmError::validation(format!(
                "Minimum purchase amount is {}",
                self.business.min_purchase_amount
            )));
        }

        let now = self.now();
        let mut transaction = Transaction::new(
            user.id,
            TransactionType::Purchase,
            TransactionStatus::Pending,
            now,
        );
        transaction.amount = request.amount;
        transaction.token_amount = request.token_amount;
        transaction.price_per_token = request.current_price;
        transaction.processing_fee = pricing::processing_fee(request.amount, &request.payment_method)?;
        transaction.payment_method = Some(request.payment_method.to_lowercase());

        let transaction = self.store.insert_transaction(transaction).await?;
        metrics::LEDGER_OPERATIONS.with_label_values(&["purchase"]).inc();
        info!(
            user_id = %user.id,
            transaction_id = %transaction.id,
            "Purchase of {} tokens for {} recorded, awaiting payment approval",
            transaction.token_amount, transaction.amount
        );

        self.notifier
            .notify(
                &user,
                NotificationType::Purchase,
                "Purchase received",
                &format!(
                    "Your purchase of {} tokens for ${} is pending payment confirmation.",
                    transaction.token_amount, transaction.amount
                ),
                now,
            )
            .await;

        Ok(PurchaseResponse {
            transaction_id: transaction.id,
            amount: transaction.amount,
            token_amount: transaction.token_amount,
            processing_fee: transaction.processing_fee,
            status: transaction.status,
        })
    }

    pub async fn review_transaction(&self, admin_id: Uuid, request: TransactionReviewRequest) -> Result<Transaction> {
        let admin = self.authorize(admin_id, Capability::ReviewTransactions).await?;
        request.validate()?;

        let transaction = self
            .store
            .get_transaction(request.transaction_id)
            .await?
            .ok_or_else(|| CrmError::not_found("Transaction", request.transaction_id))?;

        if !matches!(
            transaction.tx_type,
            TransactionType::Purchase | TransactionType::Deposit
        ) {
            return Err(CrmError::validation(
                "Only purchase and deposit transactions are settled by review",
            ));
        }

        let review = Review::open(
            "Transaction",
            transaction.id,
            transaction.status,
            admin.id,
            request.reason,
        )?;
        let now = self.now();
        let owner = self.store.get_user(transaction.user_id).await?;

        match request.action {
            ReviewAction::Approve => {
                let accrual = match &owner {
                    Some(owner) => self.purchase_commission(owner, &transaction, now).await?,
                    None => None,
                };

                let (completed, owner, outcome) = self
                    .store
                    .complete_purchase(review.approve(), accrual, now)
                    .await?;
                metrics::REVIEWS.with_label_values(&["transaction", "approved"]).inc();

                match &outcome {
                    CommissionOutcome::Accrued(bucket) => info!(
                        commission_id = %bucket.id,
                        referrer_id = %bucket.referrer_id,
                        "Commission bucket {:02}/{} now {}",
                        bucket.month, bucket.year, bucket.amount
                    ),
                    CommissionOutcome::Reopened(bucket) => info!(
                        commission_id = %bucket.id,
                        referrer_id = %bucket.referrer_id,
                        "Reviewed commission bucket {:02}/{} reopened with {} unsettled",
                        bucket.month, bucket.year, bucket.unsettled_amount()
                    ),
                    CommissionOutcome::NotReferred => {}
                }

                info!(admin_id = %admin.id, transaction_id = %completed.id, "Transaction approved");
                self.notifier
                    .notify(
                        &owner,
                        NotificationType::Purchase,
                        "Purchase completed",
                        &format!(
                            "Your payment was confirmed and {} tokens were added to your balance.",
                            completed.token_amount
                        ),
                        now,
                    )
                    .await;
                Ok(completed)
            }
            ReviewAction::Reject => {
                let rejected = self.store.reject_transaction(review.reject(), now).await?;
                metrics::REVIEWS.with_label_values(&["transaction", "rejected"]).inc();
                info!(admin_id = %admin.id, transaction_id = %rejected.id, "Transaction rejected");

                if let Some(owner) = owner {
                    self.notifier
                        .notify(
                            &owner,
                            NotificationType::Purchase,
                            "Purchase rejected",
                            &format!(
                                "Your purchase of {} tokens was rejected.{}",
                                rejected.token_amount,
                                reason_suffix(rejected.notes.as_deref())
                            ),
                            now,
                        )
                        .await;
                }
                Ok(rejected)
            }
        }
    }

    /// Commission owed to the buyer's referrer, if the buyer was referred by
    /// an account that still exists.
    async fn purchase_commission(
        &self,
        buyer: &User,
        purchase: &Transaction,
        now: DateTime<Utc>,
    ) -> Result<Option<CommissionAccrual>> {
        if purchase.tx_type != TransactionType::Purchase {
            return Ok(None);
        }
        let Some(code) = buyer.referred_by.as_deref() else {
            return Ok(None);
        };

        match self.store.find_user_by_referral_code(code).await? {
            Some(referrer) if referrer.id != buyer.id => Ok(Some(CommissionAccrual::for_purchase(
                referrer.id,
                buyer.id,
                purchase.amount,
                purchase.token_amount,
                self.commission_rate().await?,
                now,
            ))),
            _ => {
                warn!(user_id = %buyer.id, referral_code = %code, "Referrer no longer exists");
                Ok(None)
            }
        }
    }

    // ===== Staking =====

    fn staking_terms(&self) -> StakingTerms {
        StakingTerms {
            apy: self.business.staking_apy,
            term_months: self.business.staking_term_months,
        }
    }

    pub async fn stake(&self, user_id: Uuid, request: StakeRequest) -> Result<StakeResponse> {
        request.validate()?;
        let user = self.current_user(user_id).await?;

        let delta = LedgerDelta::stake(request.amount);
        user.balances().apply(&delta)?;

        let now = self.now();
        let (record, transaction) = self.staking_terms().open(user.id, request.amount, now);
        let updated = self
            .store
            .commit_ledger_event(LedgerEvent::new(user.id, delta, transaction, now).with_staking(record.clone()))
            .await?;

        metrics::LEDGER_OPERATIONS.with_label_values(&["stake"]).inc();
        metrics::ACTIVE_STAKES.inc();
        info!(user_id = %user.id, staking_id = %record.id, "Staked {} tokens", record.amount);

        self.notifier
            .notify(
                &updated,
                NotificationType::Stake,
                "Tokens staked",
                &format!(
                    "You staked {} tokens at {}% APY. They unlock on {}.",
                    record.amount,
                    record.apy,
                    record.end_date.format("%Y-%m-%d")
                ),
                now,
            )
            .await;

        Ok(StakeResponse {
            staking_id: record.id,
            amount: record.amount,
            start_date: record.start_date,
            end_date: record.end_date,
            apy: record.apy,
            balances: updated.balances(),
        })
    }

    pub async fn unstake(&self, user_id: Uuid, request: UnstakeRequest) -> Result<UnstakeResponse> {
        let user = self.current_user(user_id).await?;
        let now = self.now();

        let record = self
            .store
            .get_stake(request.staking_id)
            .await?
            .ok_or_else(|| CrmError::not_found("Staking record", request.staking_id))?;
        staking::ensure_releasable(&record, user.id, now)?;

        let (completed, updated) = self.store.complete_stake(record.id, now).await?;
        metrics::LEDGER_OPERATIONS.with_label_values(&["unstake"]).inc();
        metrics::ACTIVE_STAKES.dec();
        info!(user_id = %user.id, staking_id = %completed.id, "Stake released");

        self.notifier
            .notify(
                &updated,
                NotificationType::Stake,
                "Stake matured",
                &format!("{} staked tokens are available again.", completed.amount),
                now,
            )
            .await;

        Ok(UnstakeResponse {
            staking_id: completed.id,
            amount: completed.amount,
            completed_at: completed.completed_at,
            balances: updated.balances(),
        })
    }

    pub async fn list_stakes(&self, user_id: Uuid, page: PageRequest) -> Result<Page<StakingRecord>> {
        let user = self.current_user(user_id).await?;
        let (items, total) = self.store.list_stakes(user.id, page).await?;
        Ok(Page::new(items, page, total))
    }

    // ===== Conversion and pricing =====

    pub async fn current_price(&self) -> Result<TokenPriceResponse> {
        let today = self.now().date_naive();
        let todays = self.store.price_on(today).await?;
        let latest = match todays {
            Some(_) => None,
            None => self.store.latest_price().await?,
        };

        let (price, source) = pricing::resolve_price(todays, latest);
        Ok(TokenPriceResponse { price, source })
    }

    pub async fn set_token_price(&self, admin_id: Uuid, request: TokenPriceRequest) -> Result<TokenPriceResponse> {
        let admin = self.authorize(admin_id, Capability::ManagePrices).await?;
        request.validate()?;

        let now = self.now();
        self.store.put_price(now.date_naive(), request.price, now).await?;
        info!(admin_id = %admin.id, "Token price for {} set to {}", now.date_naive(), request.price);

        self.current_price().await
    }

    pub async fn convert(&self, user_id: Uuid, request: ConvertRequest) -> Result<ConversionResponse> {
        request.validate()?;
        let user = self.current_user(user_id).await?;

        if request.token_amount < self.business.min_token_amount {
            return Err(CrmError::validation(format!(
                "Minimum conversion is {} tokens",
                self.business.min_token_amount
            )));
        }

        let price = self.current_price().await?.price;
        let usdt_amount = pricing::token_value(request.token_amount, price)?;
        let delta = LedgerDelta::convert(request.token_amount, usdt_amount);
        user.balances().apply(&delta)?;

        let now = self.now();
        let mut transaction =
            Transaction::new(user.id, TransactionType::Sale, TransactionStatus::Completed, now);
        transaction.amount = usdt_amount;
        transaction.token_amount = request.token_amount;
        transaction.price_per_token = price;
        transaction.reference = Some("internal_conversion".to_string());
        let transaction_id = transaction.id;

        let updated = self
            .store
            .commit_ledger_event(LedgerEvent::new(user.id, delta, transaction, now))
            .await?;

        metrics::LEDGER_OPERATIONS.with_label_values(&["convert"]).inc();
        info!(
            user_id = %user.id,
            "Converted {} tokens to {} USDT at {}",
            request.token_amount, usdt_amount, price
        );

        self.notifier
            .notify(
                &updated,
                NotificationType::Conversion,
                "Tokens converted",
                &format!(
                    "{} tokens were converted to {} USDT at ${} per token.",
                    request.token_amount, usdt_amount, price
                ),
                now,
            )
            .await;

        Ok(ConversionResponse {
            transaction_id,
            token_amount: request.token_amount,
            price_per_token: price,
            usdt_amount,
            balances: updated.balances(),
        })
    }

    // ===== Withdrawals =====

    pub async fn withdraw_usdt(&self, user_id: Uuid, request: UsdtWithdrawRequest) -> Result<WithdrawalView> {
        request.validate()?;
        if request.amount < self.business.min_usdt_withdrawal {
            return Err(CrmError::validation(format!(
                "Minimum USDT withdrawal is {}",
                self.business.min_usdt_withdrawal
            )));
        }

        let network = request
            .network
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_USDT_NETWORK.to_string());

        self.request_withdrawal(
            user_id,
            WithdrawalAsset::Usdt,
            request.amount,
            Decimal::ZERO,
            network,
            request.wallet_address,
        )
        .await
    }

    pub async fn withdraw_tokens(&self, user_id: Uuid, request: TokenWithdrawRequest) -> Result<WithdrawalView> {
        request.validate()?;
        if request.token_amount < self.business.min_token_amount {
            return Err(CrmError::validation(format!(
                "Minimum token withdrawal is {}",
                self.business.min_token_amount
            )));
        }

        self.request_withdrawal(
            user_id,
            WithdrawalAsset::Token,
            Decimal::ZERO,
            request.token_amount,
            request.network,
            request.wallet_address,
        )
        .await
    }

    /// Holds the funds and files a PENDING request that unlocks after the
    /// configured lock period.
    async fn request_withdrawal(
        &self,
        user_id: Uuid,
        asset: WithdrawalAsset,
        amount: Decimal,
        token_amount: Decimal,
        network: String,
        wallet_address: String,
    ) -> Result<WithdrawalView> {
        let user = self.current_user(user_id).await?;
        let now = self.now();

        let mut transaction = Transaction::new(
            user.id,
            TransactionType::Withdrawal,
            TransactionStatus::Pending,
            now,
        );
        transaction.amount = amount;
        transaction.token_amount = token_amount;

        let request = WithdrawalRequest {
            id: Uuid::new_v4(),
            user_id: user.id,
            transaction_id: transaction.id,
            asset,
            amount,
            token_amount,
            network,
            wallet_address: wallet_address.trim().to_string(),
            status: ReviewStatus::Pending,
            rejection_reason: None,
            created_at: now,
            unlock_at: lock_gate::maturity(now, self.business.withdrawal_lock_months),
            processed_at: None,
        };
        transaction.reference = Some(format!("withdrawal:{}", request.id));

        // The hold is the reverse of a release.
        let hold = match asset {
            WithdrawalAsset::Token => LedgerDelta::hold_tokens(token_amount),
            WithdrawalAsset::Usdt => LedgerDelta::usdt(-amount),
        };
        user.balances().apply(&hold)?;

        let updated = self
            .store
            .commit_ledger_event(LedgerEvent::new(user.id, hold, transaction, now).with_withdrawal(request.clone()))
            .await?;

        metrics::LEDGER_OPERATIONS.with_label_values(&["withdrawal_request"]).inc();
        info!(
            user_id = %user.id,
            withdrawal_id = %request.id,
            asset = ?asset,
            "Withdrawal requested, unlocks {}",
            request.unlock_at
        );

        self.notifier
            .notify(
                &updated,
                NotificationType::Withdrawal,
                "Withdrawal requested",
                &format!(
                    "Your withdrawal of {} to {} is pending. It can be processed from {}.",
                    describe_amount(&request),
                    request.wallet_address,
                    request.unlock_at.format("%Y-%m-%d")
                ),
                now,
            )
            .await;
        self.notifier
            .notify_admins(
                "New withdrawal request",
                format!(
                    "User {} ({}) requested a withdrawal of {} on {}.",
                    updated.name,
                    updated.email,
                    describe_amount(&request),
                    request.network
                ),
            )
            .await;

        Ok(self.view(request, now))
    }

    fn view(&self, request: WithdrawalRequest, now: DateTime<Utc>) -> WithdrawalView {
        let can_withdraw = lock_gate::is_unlocked(request.unlock_at, now);
        WithdrawalView {
            request,
            can_withdraw,
        }
    }

    pub async fn list_withdrawals(&self, user_id: Uuid, page: PageRequest) -> Result<Page<WithdrawalView>> {
        let user = self.current_user(user_id).await?;
        let (items, total) = self.store.list_withdrawals(Some(user.id), page).await?;
        let now = self.now();
        Ok(Page::new(items, page, total).map(|w| self.view(w, now)))
    }

    pub async fn admin_list_withdrawals(&self, admin_id: Uuid, page: PageRequest) -> Result<Page<WithdrawalView>> {
        self.authorize(admin_id, Capability::ReviewWithdrawals).await?;
        let (items, total) = self.store.list_withdrawals(None, page).await?;
        let now = self.now();
        Ok(Page::new(items, page, total).map(|w| self.view(w, now)))
    }

    pub async fn review_withdrawal(&self, admin_id: Uuid, request: WithdrawalReviewRequest) -> Result<WithdrawalView> {
        let admin = self.authorize(admin_id, Capability::ReviewWithdrawals).await?;
        request.validate()?;

        let withdrawal = self
            .store
            .get_withdrawal(request.withdrawal_id)
            .await?
            .ok_or_else(|| CrmError::not_found("Withdrawal", request.withdrawal_id))?;

        let review = Review::open(
            "Withdrawal",
            withdrawal.id,
            withdrawal.status,
            admin.id,
            request.reason,
        )?;
        let now = self.now();

        match request.action {
            ReviewAction::Approve => {
                if let Err(e) = lock_gate::ensure_unlocked(withdrawal.unlock_at, now) {
                    metrics::LOCKED_WITHDRAWAL_ATTEMPTS.inc();
                    warn!(
                        admin_id = %admin.id,
                        withdrawal_id = %withdrawal.id,
                        "Withdrawal approval refused, still locked until {}",
                        withdrawal.unlock_at
                    );
                    return Err(e);
                }

                let (approved, owner) = self.store.approve_withdrawal(review.approve(), now).await?;
                metrics::REVIEWS.with_label_values(&["withdrawal", "approved"]).inc();
                info!(admin_id = %admin.id, withdrawal_id = %approved.id, "Withdrawal approved");

                self.notifier
                    .notify(
                        &owner,
                        NotificationType::Withdrawal,
                        "Withdrawal approved",
                        &format!(
                            "Your withdrawal of {} to {} was approved.",
                            describe_amount(&approved),
                            approved.wallet_address
                        ),
                        now,
                    )
                    .await;
                Ok(self.view(approved, now))
            }
            ReviewAction::Reject => {
                let (rejected, owner) = self.store.reject_withdrawal(review.reject(), now).await?;
                metrics::REVIEWS.with_label_values(&["withdrawal", "rejected"]).inc();
                info!(admin_id = %admin.id, withdrawal_id = %rejected.id, "Withdrawal rejected, funds released");

                self.notifier
                    .notify(
                        &owner,
                        NotificationType::Withdrawal,
                        "Withdrawal rejected",
                        &format!(
                            "Your withdrawal of {} was rejected and the amount returned to your balance.{}",
                            describe_amount(&rejected),
                            reason_suffix(rejected.rejection_reason.as_deref())
                        ),
                        now,
                    )
                    .await;
                Ok(self.view(rejected, now))
            }
        }
    }

    // ===== Referral commissions =====

    /// Current rate in percent. A malformed stored value falls back to the
    /// configured default.
    pub async fn commission_rate(&self) -> Result<Decimal> {
        match self.store.get_setting(COMMISSION_RATE_KEY).await? {
            Some(raw) => match Decimal::from_str(raw.trim()) {
                Ok(rate) if commission::valid_rate(rate) => Ok(rate),
                _ => {
                    warn!(value = %raw, "Stored commission rate is invalid, using default");
                    Ok(self.business.default_commission_rate)
                }
            },
            None => Ok(self.business.default_commission_rate),
        }
    }

    pub async fn set_commission_rate(&self, admin_id: Uuid, request: CommissionRateRequest) -> Result<Decimal> {
        let admin = self.authorize(admin_id, Capability::ManageSettings).await?;
        request.validate()?;

        if !commission::valid_rate(request.rate) {
            return Err(CrmError::validation("Commission rate must be between 0 and 100"));
        }

        self.store
            .put_setting(COMMISSION_RATE_KEY, &request.rate.to_string(), self.now())
            .await?;
        info!(admin_id = %admin.id, "Referral commission rate set to {}%", request.rate);
        Ok(request.rate)
    }

    pub async fn referral_summary(&self, user_id: Uuid) -> Result<ReferralSummary> {
        let user = self.current_user(user_id).await?;

        Ok(ReferralSummary {
            referred_users: self.store.count_referred_users(&user.referral_code).await?,
            commissions: self.store.commission_totals(user.id).await?,
            commission_rate: self.commission_rate().await?,
            referral_earnings: user.referral_earnings,
            referral_code: user.referral_code,
        })
    }

    pub async fn list_commissions(&self, user_id: Uuid, filter: CommissionFilter) -> Result<Page<ReferralCommission>> {
        let user = self.current_user(user_id).await?;
        let page = page_of(&filter);
        let (items, total) = self
            .store
            .list_commissions(Some(user.id), filter.status, page)
            .await?;
        Ok(Page::new(items, page, total))
    }

    pub async fn admin_list_commissions(&self, admin_id: Uuid, filter: CommissionFilter) -> Result<Page<ReferralCommission>> {
        self.authorize(admin_id, Capability::ReviewCommissions).await?;
        let page = page_of(&filter);
        let (items, total) = self.store.list_commissions(None, filter.status, page).await?;
        Ok(Page::new(items, page, total))
    }

    pub async fn review_commission(&self, admin_id: Uuid, request: CommissionReviewRequest) -> Result<ReferralCommission> {
        let admin = self.authorize(admin_id, Capability::ReviewCommissions).await?;
        request.validate()?;

        let commission = self
            .store
            .get_commission(request.commission_id)
            .await?
            .ok_or_else(|| CrmError::not_found("Commission", request.commission_id))?;

        let review = Review::open(
            "Commission",
            commission.id,
            commission.status,
            admin.id,
            request.admin_notes,
        )?;
        let now = self.now();

        match request.action {
            ReviewAction::Approve => {
                let payout = commission.unsettled_amount();
                let (approved, referrer) = self.store.approve_commission(review.approve(), now).await?;
                metrics::REVIEWS.with_label_values(&["commission", "approved"]).inc();
                info!(
                    admin_id = %admin.id,
                    commission_id = %approved.id,
                    "Commission of {} approved for {}",
                    payout, approved.referrer_id
                );

                self.notifier
                    .notify(
                        &referrer,
                        NotificationType::Commission,
                        "Referral commission approved",
                        &format!(
                            "Your referral commission of ${} for {:02}/{} was approved and added to your earnings.",
                            payout, approved.month, approved.year
                        ),
                        now,
                    )
                    .await;
                Ok(approved)
            }
            ReviewAction::Reject => {
                let rejected = self.store.reject_commission(review.reject(), now).await?;
                metrics::REVIEWS.with_label_values(&["commission", "rejected"]).inc();
                info!(admin_id = %admin.id, commission_id = %rejected.id, "Commission rejected");

                if let Some(referrer) = self.store.get_user(rejected.referrer_id).await? {
                    self.notifier
                        .notify(
                            &referrer,
                            NotificationType::Commission,
                            "Referral commission rejected",
                            &format!(
                                "Your referral commission for {:02}/{} was rejected.{}",
                                rejected.month,
                                rejected.year,
                                reason_suffix(rejected.admin_notes.as_deref())
                            ),
                            now,
                        )
                        .await;
                }
                Ok(rejected)
            }
        }
    }

    // ===== Transactions =====

    pub async fn list_transactions(&self, user_id: Uuid, page: PageRequest) -> Result<Page<Transaction>> {
        let user = self.current_user(user_id).await?;
        let (items, total) = self.store.list_transactions(Some(user.id), page).await?;
        Ok(Page::new(items, page, total))
    }

    pub async fn admin_list_transactions(&self, admin_id: Uuid, page: PageRequest) -> Result<Page<Transaction>> {
        self.authorize(admin_id, Capability::ReviewTransactions).await?;
        let (items, total) = self.store.list_transactions(None, page).await?;
        Ok(Page::new(items, page, total))
    }

    // ===== Notifications =====

    pub async fn notifications(&self, user_id: Uuid, page: PageRequest) -> Result<Page<Notification>> {
        let user = self.current_user(user_id).await?;
        let (items, total) = self.store.list_notifications(user.id, page).await?;
        Ok(Page::new(items, page, total))
    }

    pub async fn mark_notification_read(&self, user_id: Uuid, notification_id: Uuid) -> Result<Notification> {
        let user = self.current_user(user_id).await?;
        self.store.mark_notification_read(notification_id, user.id).await
    }

    pub async fn broadcast(&self, admin_id: Uuid, request: BroadcastRequest) -> Result<Notification> {
        let admin = self.authorize(admin_id, Capability::Broadcast).await?;
        request.validate()?;

        let notification = self
            .notifier
            .broadcast(request.title.trim(), request.message.trim(), self.now())
            .await?;
        info!(admin_id = %admin.id, notification_id = %notification.id, "Announcement broadcast");
        Ok(notification)
    }

    // ===== Administration =====

    pub async fn list_users(&self, admin_id: Uuid, page: PageRequest) -> Result<Page<User>> {
        self.authorize(admin_id, Capability::ManageUsers).await?;
        let (items, total) = self.store.list_users(page).await?;
        Ok(Page::new(items, page, total))
    }

    pub async fn set_user_status(&self, admin_id: Uuid, user_id: Uuid, request: UserStatusRequest) -> Result<User> {
        let admin = self.authorize(admin_id, Capability::ManageUsers).await?;
        if admin.id == user_id && !request.is_active {
            return Err(CrmError::validation("Administrators cannot deactivate themselves"));
        }

        let now = self.now();
        let user = self.store.set_user_active(user_id, request.is_active, now).await?;
        info!(admin_id = %admin.id, user_id = %user.id, is_active = user.is_active, "User status changed");

        let (title, message) = if user.is_active {
            ("Account activated", "Your DiTokens account has been activated.")
        } else {
            ("Account deactivated", "Your DiTokens account has been deactivated. Contact support for details.")
        };
        self.notifier
            .notify(&user, NotificationType::Account, title, message, now)
            .await;

        Ok(user)
    }

    pub async fn set_user_role(&self, admin_id: Uuid, user_id: Uuid, request: UserRoleRequest) -> Result<User> {
        let admin = self.authorize(admin_id, Capability::AssignRoles).await?;
        if admin.id == user_id && request.role != Role::SuperAdmin {
            return Err(CrmError::validation("Administrators cannot demote themselves"));
        }

        let user = self.store.set_user_role(user_id, request.role, self.now()).await?;
        info!(admin_id = %admin.id, user_id = %user.id, role = ?user.role, "User role changed");
        Ok(user)
    }

    pub async fn dashboard(&self, admin_id: Uuid) -> Result<DashboardStats> {
        self.authorize(admin_id, Capability::ManageUsers).await?;
        self.store.dashboard_stats().await
    }

    pub async fn health_check(&self) -> Result<()> {
        self.store.health_check().await
    }
}

fn page_of(filter: &CommissionFilter) -> PageRequest {
    PageRequest::from(PageQuery {
        page: filter.page,
        limit: filter.limit,
    })
}

fn describe_amount(request: &WithdrawalRequest) -> String {
    match request.asset {
        WithdrawalAsset::Usdt => format!("{} USDT", request.amount),
        WithdrawalAsset::Token => format!("{} tokens", request.token_amount),
    }
}

fn reason_suffix(reason: Option<&str>) -> String {
    match reason.map(str::trim).filter(|r| !r.is_empty()) {
        Some(reason) => format!(" Reason: {}", reason),
        None => String::new(),
    }
}
