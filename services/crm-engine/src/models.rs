use crate::ledger::Balances;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;
use validator::{Validate, ValidationError};

/// Account role, always read from the persisted user record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "user_role", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    User,
    Admin,
    SuperAdmin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "transaction_type", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionType {
    Purchase,
    Sale,
    Stake,
    Withdrawal,
    Deposit,
    ReferralCommission,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "transaction_status", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
    Rejected,
}

/// Status of anything an admin signs off on: commissions, withdrawals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "review_status", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewStatus {
    Pending,
    Approved,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "staking_status", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StakingStatus {
    Active,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "withdrawal_asset", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WithdrawalAsset {
    Token,
    Usdt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "notification_type", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationType {
    Account,
    Purchase,
    Stake,
    Conversion,
    Withdrawal,
    Commission,
    Announcement,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub contact_number: String,
    pub country: String,
    pub state: String,
    #[serde(skip_serializing, default)]
    pub password_hash: String,
    pub role: Role,
    pub is_active: bool,
    pub referral_code: String,
    pub referred_by: Option<String>,
    pub total_tokens: Decimal,
    pub available_tokens: Decimal,
    pub staked_tokens: Decimal,
    pub usdt_balance: Decimal,
    pub total_earnings: Decimal,
    pub referral_earnings: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn balances(&self) -> Balances {
        Balances {
            total_tokens: self.total_tokens,
            available_tokens: self.available_tokens,
            staked_tokens: self.staked_tokens,
            usdt_balance: self.usdt_balance,
        }
    }

    pub fn set_balances(&mut self, balances: Balances) {
        self.total_tokens = balances.total_tokens;
        self.available_tokens = balances.available_tokens;
        self.staked_tokens = balances.staked_tokens;
        self.usdt_balance = balances.usdt_balance;
    }
}

/// Everything needed to insert a user; balances start at zero
#[derive(Debug, Clone)]
pub struct NewUser {
    pub name: String,
    pub email: String,
    pub contact_number: String,
    pub country: String,
    pub state: String,
    pub password_hash: String,
    pub role: Role,
    pub referral_code: String,
    pub referred_by: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: Uuid,
    pub user_id: Uuid,
    #[serde(rename = "type")]
    pub tx_type: TransactionType,
    pub amount: Decimal,
    pub token_amount: Decimal,
    pub price_per_token: Decimal,
    pub status: TransactionStatus,
    pub payment_method: Option<String>,
    pub processing_fee: Decimal,
    pub reference: Option<String>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl Transaction {
    pub fn new(user_id: Uuid, tx_type: TransactionType, status: TransactionStatus, now: DateTime<Utc>) -> Self {
        Transaction {
            id: Uuid::new_v4(),
            user_id,
            tx_type,
            amount: Decimal::ZERO,
            token_amount: Decimal::ZERO,
            price_per_token: Decimal::ZERO,
            status,
            payment_method: None,
            processing_fee: Decimal::ZERO,
            reference: None,
            notes: None,
            created_at: now,
            processed_at: if status == TransactionStatus::Pending {
                None
            } else {
                Some(now)
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ReferralCommission {
    pub id: Uuid,
    pub referrer_id: Uuid,
    pub referred_user_id: Uuid,
    pub month: i32,
    pub year: i32,
    pub amount: Decimal,
    pub token_amount: Decimal,
    pub commission_rate: Decimal,
    pub status: ReviewStatus,
    pub is_paid: bool,
    /// Portion of `amount` credited to the referrer by approvals so far.
    pub paid_amount: Decimal,
    /// Portion of `amount` closed by rejections so far.
    pub rejected_amount: Decimal,
    pub settled_token_amount: Decimal,
    pub admin_notes: Option<String>,
    pub reviewed_by: Option<Uuid>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ReferralCommission {
    /// Commission accrued since the bucket was last reviewed.
    pub fn unsettled_amount(&self) -> Decimal {
        self.amount - self.paid_amount - self.rejected_amount
    }

    pub fn unsettled_tokens(&self) -> Decimal {
        self.token_amount - self.settled_token_amount
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct StakingRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub amount: Decimal,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub apy: Decimal,
    pub rewards: Decimal,
    pub status: StakingStatus,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawalRequest {
    pub id: Uuid,
    pub user_id: Uuid,
    pub transaction_id: Uuid,
    pub asset: WithdrawalAsset,
    pub amount: Decimal,
    pub token_amount: Decimal,
    pub network: String,
    pub wallet_address: String,
    pub status: ReviewStatus,
    pub rejection_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub unlock_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl WithdrawalRequest {
    /// Balance movement that puts the held funds back
    pub fn release_delta(&self) -> crate::ledger::LedgerDelta {
        match self.asset {
            WithdrawalAsset::Token => crate::ledger::LedgerDelta::release_tokens(self.token_amount),
            WithdrawalAsset::Usdt => crate::ledger::LedgerDelta::usdt(self.amount),
        }
    }

    /// Balance movement applied once the withdrawal is paid out
    pub fn settle_delta(&self) -> crate::ledger::LedgerDelta {
        match self.asset {
            WithdrawalAsset::Token => {
                crate::ledger::LedgerDelta::settle_held_tokens(self.token_amount)
            }
            WithdrawalAsset::Usdt => crate::ledger::LedgerDelta::default(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawalView {
    #[serde(flatten)]
    pub request: WithdrawalRequest,
    pub can_withdraw: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    #[serde(rename = "type")]
    pub kind: NotificationType,
    pub title: String,
    pub message: String,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

// ===== Pagination =====

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PageQuery {
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: i64,
    pub limit: i64,
}

impl PageRequest {
    pub const DEFAULT_LIMIT: i64 = 20;
    pub const MAX_LIMIT: i64 = 100;

    pub fn offset(&self) -> i64 {
        (self.page - 1) * self.limit
    }
}

impl From<PageQuery> for PageRequest {
    fn from(query: PageQuery) -> Self {
        PageRequest {
            page: query.page.unwrap_or(1).max(1),
            limit: query
                .limit
                .unwrap_or(Self::DEFAULT_LIMIT)
                .clamp(1, Self::MAX_LIMIT),
        }
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        PageRequest {
            page: 1,
            limit: Self::DEFAULT_LIMIT,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Pagination {
    pub page: i64,
    pub limit: i64,
    pub total: i64,
    pub pages: i64,
}

#[derive(Debug, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub pagination: Pagination,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, request: PageRequest, total: i64) -> Self {
        Page {
            items,
            pagination: Pagination {
                page: request.page,
                limit: request.limit,
                total,
                pages: (total + request.limit - 1) / request.limit,
            },
        }
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            items: self.items.into_iter().map(f).collect(),
            pagination: self.pagination,
        }
    }
}

// ===== Requests =====

/// Largest amount a NUMERIC(28, 8) column holds.
pub const MAX_AMOUNT: Decimal = dec!(99999999999999999999.99999999);

/// Fractional digits stored for every amount.
pub const AMOUNT_SCALE: u32 = 8;

fn storable_decimal(value: &Decimal) -> Result<(), ValidationError> {
    if value.abs() > MAX_AMOUNT {
        return Err(ValidationError::new("amount_out_of_range"));
    }
    if value.normalize().scale() > AMOUNT_SCALE {
        return Err(ValidationError::new("too_many_decimal_places"));
    }
    Ok(())
}

fn positive_decimal(value: &Decimal) -> Result<(), ValidationError> {
    if *value <= Decimal::ZERO {
        return Err(ValidationError::new("must_be_positive"));
    }
    storable_decimal(value)
}

fn non_negative_decimal(value: &Decimal) -> Result<(), ValidationError> {
    if *value < Decimal::ZERO {
        return Err(ValidationError::new("must_not_be_negative"));
    }
    storable_decimal(value)
}

#[derive(Debug, Deserialize, Serialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SignUpRequest {
    #[validate(length(min = 2, max = 100))]
    pub name: String,
    #[validate(email)]
    pub email: String,
    #[validate(length(min = 5, max = 20))]
    pub contact_number: String,
    #[validate(length(min = 1, max = 100))]
    pub country: String,
    #[validate(length(min = 1, max = 100))]
    pub state: String,
    #[validate(length(min = 8, max = 128))]
    pub password: String,
    pub referral_code: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SignInRequest {
    #[validate(email)]
    pub email: String,
    #[validate(length(min = 1))]
    pub password: String,
}

#[derive(Debug, Deserialize, Serialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseRequest {
    #[validate(custom = "positive_decimal")]
    pub amount: Decimal,
    #[validate(custom = "positive_decimal")]
    pub token_amount: Decimal,
    #[validate(length(min = 1, max = 50))]
    pub payment_method: String,
    #[validate(custom = "positive_decimal")]
    pub current_price: Decimal,
}

#[derive(Debug, Deserialize, Serialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct StakeRequest {
    #[validate(custom = "positive_decimal")]
    pub amount: Decimal,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnstakeRequest {
    pub staking_id: Uuid,
}

#[derive(Debug, Deserialize, Serialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ConvertRequest {
    #[validate(custom = "positive_decimal")]
    pub token_amount: Decimal,
}

#[derive(Debug, Deserialize, Serialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct UsdtWithdrawRequest {
    #[validate(custom = "positive_decimal")]
    pub amount: Decimal,
    #[validate(length(min = 10, max = 128))]
    pub wallet_address: String,
    pub network: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct TokenWithdrawRequest {
    #[validate(custom = "positive_decimal")]
    pub token_amount: Decimal,
    #[validate(length(min = 10, max = 128))]
    pub wallet_address: String,
    #[validate(length(min = 2, max = 32))]
    pub network: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewAction {
    Approve,
    Reject,
}

#[derive(Debug, Deserialize, Serialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct TransactionReviewRequest {
    pub transaction_id: Uuid,
    pub action: ReviewAction,
    #[validate(length(max = 500))]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawalReviewRequest {
    pub withdrawal_id: Uuid,
    pub action: ReviewAction,
    #[validate(length(max = 500))]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CommissionReviewRequest {
    pub commission_id: Uuid,
    pub action: ReviewAction,
    #[validate(length(max = 500))]
    pub admin_notes: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastRequest {
    #[validate(length(min = 1, max = 200))]
    pub title: String,
    #[validate(length(min = 1, max = 5000))]
    pub message: String,
}

#[derive(Debug, Deserialize, Serialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct TokenPriceRequest {
    #[validate(custom = "positive_decimal")]
    pub price: Decimal,
}

#[derive(Debug, Deserialize, Serialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CommissionRateRequest {
    #[validate(custom = "non_negative_decimal")]
    pub rate: Decimal,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserStatusRequest {
    pub is_active: bool,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRoleRequest {
    pub role: Role,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommissionFilter {
    pub status: Option<ReviewStatus>,
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

// ===== Responses =====

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthResponse {
    pub user: User,
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseResponse {
    pub transaction_id: Uuid,
    pub amount: Decimal,
    pub token_amount: Decimal,
    pub processing_fee: Decimal,
    pub status: TransactionStatus,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StakeResponse {
    pub staking_id: Uuid,
    pub amount: Decimal,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub apy: Decimal,
    pub balances: Balances,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnstakeResponse {
    pub staking_id: Uuid,
    pub amount: Decimal,
    pub completed_at: Option<DateTime<Utc>>,
    pub balances: Balances,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversionResponse {
    pub transaction_id: Uuid,
    pub token_amount: Decimal,
    pub price_per_token: Decimal,
    pub usdt_amount: Decimal,
    pub balances: Balances,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPriceResponse {
    pub price: Decimal,
    pub source: crate::pricing::PriceSource,
}

#[derive(Debug, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReferralTotals {
    pub pending: Decimal,
    pub approved: Decimal,
    pub rejected: Decimal,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferralSummary {
    pub referral_code: String,
    pub referred_users: i64,
    pub referral_earnings: Decimal,
    pub commissions: ReferralTotals,
    pub commission_rate: Decimal,
}

#[derive(Debug, Serialize, Default, Clone, PartialEq, Eq, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct DashboardStats {
    pub total_users: i64,
    pub active_users: i64,
    pub pending_transactions: i64,
    pub pending_withdrawals: i64,
    pub pending_commissions: i64,
    pub total_tokens: Decimal,
    pub staked_tokens: Decimal,
    pub usdt_balance: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_request_clamps_input() {
        let request = PageRequest::from(PageQuery {
            page: Some(0),
            limit: Some(1000),
        });
        assert_eq!(request.page, 1);
        assert_eq!(request.limit, PageRequest::MAX_LIMIT);
        assert_eq!(request.offset(), 0);
    }

    #[test]
    fn test_page_counts_partial_last_page() {
        let page = Page::new(vec![1, 2], PageRequest { page: 3, limit: 10 }, 22);
        assert_eq!(page.pagination.pages, 3);

        let empty: Page<i32> = Page::new(vec![], PageRequest::default(), 0);
        assert_eq!(empty.pagination.pages, 0);
    }

    #[test]
    fn test_sign_up_validation_reports_fields() {
        let request = SignUpRequest {
            name: "A".to_string(),
            email: "not-an-email".to_string(),
            contact_number: "12345".to_string(),
            country: "AE".to_string(),
            state: "Dubai".to_string(),
            password: "short".to_string(),
            referral_code: None,
        };

        let errors = request.validate().unwrap_err();
        let fields = errors.field_errors();
        assert!(fields.contains_key("name"));
        assert!(fields.contains_key("email"));
        assert!(fields.contains_key("password"));
        assert!(!fields.contains_key("country"));
    }

    #[test]
    fn test_amounts_must_fit_storage() {
        let stake = |amount| StakeRequest { amount }.validate();

        assert!(stake(MAX_AMOUNT).is_ok());
        assert!(stake(dec!(0.00000001)).is_ok());
        assert!(stake(dec!(1.500000000)).is_ok());

        let too_large = stake(Decimal::MAX).unwrap_err();
        assert_eq!(too_large.field_errors()["amount"][0].code, "amount_out_of_range");
        assert!(stake(MAX_AMOUNT + dec!(0.00000001)).is_err());

        let too_precise = stake(dec!(0.000000001)).unwrap_err();
        assert_eq!(too_precise.field_errors()["amount"][0].code, "too_many_decimal_places");

        let price = TokenPriceRequest { price: dec!(2.123456789) };
        assert!(price.validate().is_err());
    }

    #[test]
    fn test_role_wire_format() {
        assert_eq!(serde_json::to_string(&Role::SuperAdmin).unwrap(), "\"SUPERADMIN\"");
        assert_eq!(
            serde_json::to_string(&TransactionType::ReferralCommission).unwrap(),
            "\"REFERRAL_COMMISSION\""
        );
    }
}
