// HTTP-level tests for the CRM engine.
// They run against the in-memory store with a manually driven clock, so no
// database is needed.

use actix_web::body::MessageBody;
use actix_web::dev::{Service, ServiceResponse};
use actix_web::http::StatusCode;
use actix_web::{test, web, App};
use chrono::{Duration, TimeZone, Utc};
use crm_engine::auth::{SessionKeys, SESSION_COOKIE};
use crm_engine::config::BusinessConfig;
use crm_engine::handlers::{self, CookiePolicy};
use crm_engine::middleware::{RateLimiter, SessionAuth};
use crm_engine::models::Role;
use crm_engine::notifications::LogMailer;
use crm_engine::services::{Clock, CrmService, FixedClock};
use crm_engine::store::{CrmStore, MemoryStore};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::{json, Value};
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

const SECRET: &str = "test-secret-test-secret-test-secret!";
const ADMIN_EMAIL: &str = "root@ditokens.test";
const ADMIN_PASSWORD: &str = "root-password";
const WALLET: &str = "TXyZ1234567890abcdefWALLET";

struct Ctx {
    service: Arc<CrmService>,
    store: Arc<MemoryStore>,
    clock: Arc<FixedClock>,
}

fn context() -> Ctx {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(FixedClock::new(
        Utc.with_ymd_and_hms(2026, 1, 15, 10, 0, 0).unwrap(),
    ));
    let service = CrmService::new(
        store.clone(),
        Arc::new(LogMailer),
        SessionKeys::new(SECRET, 24),
        BusinessConfig::defaults(),
        "ops@ditokens.test".to_string(),
    )
    .with_clock(clock.clone());

    Ctx {
        service: Arc::new(service),
        store,
        clock,
    }
}

macro_rules! test_app {
    ($ctx:expr) => {
        test::init_service(
            App::new()
                .wrap(SessionAuth::new($ctx.service.sessions().clone()))
                .app_data(web::Data::new($ctx.service.clone()))
                .configure(|cfg| {
                    handlers::configure_routes(cfg, RateLimiter::new(1_000), CookiePolicy { secure: false })
                }),
        )
        .await
    };
}

async fn send<S, R, B>(app: &S, req: R) -> (StatusCode, Value)
where
    S: Service<R, Response = ServiceResponse<B>, Error = actix_web::Error>,
    B: MessageBody,
{
    let resp = test::call_service(app, req).await;
    let status = resp.status();
    let body = test::read_body(resp).await;
    let json = serde_json::from_slice(&body).unwrap_or(Value::Null);
    (status, json)
}

fn get(uri: &str, token: &str) -> test::TestRequest {
    test::TestRequest::get()
        .uri(uri)
        .insert_header(("Authorization", format!("Bearer {}", token)))
}

fn post(uri: &str, token: &str, body: Value) -> test::TestRequest {
    test::TestRequest::post()
        .uri(uri)
        .insert_header(("Authorization", format!("Bearer {}", token)))
        .set_json(body)
}

fn dec_of(value: &Value) -> Decimal {
    match value {
        Value::String(s) => Decimal::from_str(s).unwrap(),
        Value::Number(n) => Decimal::from_str(&n.to_string()).unwrap(),
        other => panic!("not a decimal: {:?}", other),
    }
}

fn sign_up_body(email: &str, referral_code: Option<&str>) -> Value {
    json!({
        "name": "Test User",
        "email": email,
        "contactNumber": "5550100",
        "country": "AE",
        "state": "Dubai",
        "password": "password123",
        "referralCode": referral_code,
    })
}

/// Signs up and signs in, returning the user JSON and a session token.
async fn register<S, B>(app: &S, email: &str, referral_code: Option<&str>) -> (Value, String)
where
    S: Service<actix_http::Request, Response = ServiceResponse<B>, Error = actix_web::Error>,
    B: MessageBody,
{
    let (status, body) = send(
        app,
        test::TestRequest::post()
            .uri("/auth/sign-up")
            .set_json(sign_up_body(email, referral_code))
            .to_request(),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{}", body);

    let token = sign_in(app, email, "password123").await;
    (body["user"].clone(), token)
}

async fn sign_in<S, B>(app: &S, email: &str, password: &str) -> String
where
    S: Service<actix_http::Request, Response = ServiceResponse<B>, Error = actix_web::Error>,
    B: MessageBody,
{
    let (status, body) = send(
        app,
        test::TestRequest::post()
            .uri("/auth/sign-in")
            .set_json(json!({ "email": email, "password": password }))
            .to_request(),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    body["token"].as_str().unwrap().to_string()
}

async fn admin_token<S, B>(ctx: &Ctx, app: &S) -> String
where
    S: Service<actix_http::Request, Response = ServiceResponse<B>, Error = actix_web::Error>,
    B: MessageBody,
{
    ctx.service
        .bootstrap_admin(ADMIN_EMAIL, ADMIN_PASSWORD)
        .await
        .unwrap();
    sign_in(app, ADMIN_EMAIL, ADMIN_PASSWORD).await
}

/// Records a purchase and has the admin confirm the payment.
async fn buy<S, B>(app: &S, user_token: &str, admin: &str, amount: &str, tokens: &str) -> Value
where
    S: Service<actix_http::Request, Response = ServiceResponse<B>, Error = actix_web::Error>,
    B: MessageBody,
{
    let (status, purchase) = send(
        app,
        post(
            "/tokens/purchase",
            user_token,
            json!({
                "amount": amount,
                "tokenAmount": tokens,
                "paymentMethod": "credit_card",
                "currentPrice": "2.80",
            }),
        )
        .to_request(),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", purchase);
    assert_eq!(purchase["status"], "PENDING");

    let (status, approved) = send(
        app,
        post(
            "/admin/transactions/approve",
            admin,
            json!({ "transactionId": purchase["transactionId"], "action": "approve" }),
        )
        .to_request(),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", approved);
    approved
}

async fn me<S, B>(app: &S, token: &str) -> Value
where
    S: Service<actix_http::Request, Response = ServiceResponse<B>, Error = actix_web::Error>,
    B: MessageBody,
{
    let (status, body) = send(app, get("/users/me", token).to_request()).await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    body
}

#[actix_web::test]
async fn test_sign_in_sets_session_cookie() {
    let ctx = context();
    let app = test_app!(ctx);

    let (status, body) = send(
        &app,
        test::TestRequest::post()
            .uri("/auth/sign-up")
            .set_json(sign_up_body("cookie@example.com", None))
            .to_request(),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert!(body["user"].get("passwordHash").is_none());

    let resp = test::call_service(
        &app,
        test::TestRequest::post()
            .uri("/auth/sign-in")
            .set_json(json!({ "email": "cookie@example.com", "password": "password123" }))
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let cookie = resp
        .response()
        .cookies()
        .find(|c| c.name() == SESSION_COOKIE)
        .expect("session cookie")
        .into_owned();
    assert!(cookie.http_only().unwrap_or(false));

    let (status, profile) = send(
        &app,
        test::TestRequest::get()
            .uri("/users/me")
            .cookie(cookie)
            .to_request(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(profile["email"], "cookie@example.com");
}

#[actix_web::test]
async fn test_missing_or_bad_session_is_unauthorized() {
    let ctx = context();
    let app = test_app!(ctx);

    let err = test::try_call_service(&app, test::TestRequest::get().uri("/users/me").to_request())
        .await
        .err()
        .expect("request should be refused");
    assert_eq!(err.as_response_error().status_code(), StatusCode::UNAUTHORIZED);

    let err = test::try_call_service(&app, get("/tokens/transactions", "not-a-token").to_request())
        .await
        .err()
        .expect("request should be refused");
    assert_eq!(err.as_response_error().status_code(), StatusCode::UNAUTHORIZED);

    let (status, body) = send(
        &app,
        test::TestRequest::post()
            .uri("/auth/sign-in")
            .set_json(json!({ "email": "nobody@example.com", "password": "whatever1" }))
            .to_request(),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["type"], "invalid_credentials");
}

#[actix_web::test]
async fn test_purchase_approval_credits_tokens_and_accrues_commission() {
    let ctx = context();
    let app = test_app!(ctx);
    let admin = admin_token(&ctx, &app).await;

    let (referrer, referrer_token) = register(&app, "referrer@example.com", None).await;
    let code = referrer["referralCode"].as_str().unwrap().to_string();
    let (referred, referred_token) = register(&app, "referred@example.com", Some(&code)).await;
    assert_eq!(referred["referredBy"], code.as_str());

    // Pending purchases do not move balances.
    let (status, purchase) = send(
        &app,
        post(
            "/tokens/purchase",
            &referred_token,
            json!({
                "amount": "100",
                "tokenAmount": "35.71",
                "paymentMethod": "credit_card",
                "currentPrice": "2.80",
            }),
        )
        .to_request(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(dec_of(&purchase["processingFee"]), dec!(2.50));
    assert_eq!(dec_of(&me(&app, &referred_token).await["availableTokens"]), Decimal::ZERO);

    let (status, approved) = send(
        &app,
        post(
            "/admin/transactions/approve",
            &admin,
            json!({ "transactionId": purchase["transactionId"], "action": "approve" }),
        )
        .to_request(),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", approved);
    assert_eq!(approved["status"], "COMPLETED");

    let buyer = me(&app, &referred_token).await;
    assert_eq!(dec_of(&buyer["totalTokens"]), dec!(35.71));
    assert_eq!(dec_of(&buyer["availableTokens"]), dec!(35.71));

    // Accrual is two-phase: nothing reaches the referrer until approval.
    let (_, commissions) = send(&app, get("/referrals/commissions", &referrer_token).to_request()).await;
    assert_eq!(commissions["pagination"]["total"], 1);
    let bucket = &commissions["items"][0];
    assert_eq!(bucket["status"], "PENDING");
    assert_eq!(dec_of(&bucket["amount"]), dec!(5.00));
    assert_eq!(bucket["referredUserId"], referred["id"]);
    assert_eq!(dec_of(&me(&app, &referrer_token).await["referralEarnings"]), Decimal::ZERO);

    let (status, paid) = send(
        &app,
        post(
            "/admin/commissions/approve",
            &admin,
            json!({ "commissionId": bucket["id"], "action": "approve", "adminNotes": "January payout" }),
        )
        .to_request(),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", paid);
    assert_eq!(paid["status"], "APPROVED");
    assert_eq!(paid["isPaid"], true);

    let earner = me(&app, &referrer_token).await;
    assert_eq!(dec_of(&earner["referralEarnings"]), dec!(5.00));
    assert_eq!(dec_of(&earner["totalEarnings"]), dec!(5.00));

    let (_, summary) = send(&app, get("/referrals/me", &referrer_token).to_request()).await;
    assert_eq!(summary["referredUsers"], 1);
    assert_eq!(dec_of(&summary["commissions"]["approved"]), dec!(5.00));

    // Terminal states cannot be re-entered.
    let (status, body) = send(
        &app,
        post(
            "/admin/commissions/approve",
            &admin,
            json!({ "commissionId": bucket["id"], "action": "reject" }),
        )
        .to_request(),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["type"], "conflict");

    let (status, _) = send(
        &app,
        post(
            "/admin/transactions/approve",
            &admin,
            json!({ "transactionId": purchase["transactionId"], "action": "approve" }),
        )
        .to_request(),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(dec_of(&me(&app, &referred_token).await["totalTokens"]), dec!(35.71));
}

#[actix_web::test]
async fn test_purchases_in_one_month_share_a_bucket() {
    let ctx = context();
    let app = test_app!(ctx);
    let admin = admin_token(&ctx, &app).await;

    let (referrer, referrer_token) = register(&app, "r@example.com", None).await;
    let code = referrer["referralCode"].as_str().unwrap().to_string();
    let (_, buyer_token) = register(&app, "b@example.com", Some(&code)).await;

    buy(&app, &buyer_token, &admin, "100", "35").await;
    ctx.clock.advance(Duration::days(3));
    buy(&app, &buyer_token, &admin, "200", "70").await;

    let (_, commissions) = send(&app, get("/referrals/commissions", &referrer_token).to_request()).await;
    assert_eq!(commissions["pagination"]["total"], 1);
    assert_eq!(dec_of(&commissions["items"][0]["amount"]), dec!(15.00));
}

#[actix_web::test]
async fn test_purchase_after_bucket_review_is_still_paid() {
    let ctx = context();
    let app = test_app!(ctx);
    let admin = admin_token(&ctx, &app).await;

    let (referrer, referrer_token) = register(&app, "early@example.com", None).await;
    let code = referrer["referralCode"].as_str().unwrap().to_string();
    let (_, buyer_token) = register(&app, "late@example.com", Some(&code)).await;

    // The sign-up bucket is approved while still empty.
    let (_, commissions) = send(&app, get("/referrals/commissions", &referrer_token).to_request()).await;
    let bucket_id = commissions["items"][0]["id"].clone();
    let approve = json!({ "commissionId": bucket_id, "action": "approve" });
    let (status, body) = send(&app, post("/admin/commissions/approve", &admin, approve.clone()).to_request()).await;
    assert_eq!(status, StatusCode::OK, "{}", body);

    buy(&app, &buyer_token, &admin, "1000", "350").await;

    let (_, commissions) = send(&app, get("/referrals/commissions", &referrer_token).to_request()).await;
    assert_eq!(commissions["pagination"]["total"], 1);
    let bucket = &commissions["items"][0];
    assert_eq!(bucket["status"], "PENDING");
    assert_eq!(dec_of(&bucket["amount"]), dec!(50.00));
    let (_, summary) = send(&app, get("/referrals/me", &referrer_token).to_request()).await;
    assert_eq!(dec_of(&summary["commissions"]["pending"]), dec!(50.00));

    let (status, body) = send(&app, post("/admin/commissions/approve", &admin, approve).to_request()).await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(dec_of(&me(&app, &referrer_token).await["referralEarnings"]), dec!(50.00));

    let (_, history) = send(&app, get("/tokens/transactions", &referrer_token).to_request()).await;
    let payouts: Vec<&Value> = history["items"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|t| t["type"] == "REFERRAL_COMMISSION")
        .collect();
    assert_eq!(payouts.len(), 2);
    assert!(payouts.iter().any(|t| dec_of(&t["amount"]) == dec!(50.00)));
}

#[actix_web::test]
async fn test_rejected_purchase_changes_nothing() {
    let ctx = context();
    let app = test_app!(ctx);
    let admin = admin_token(&ctx, &app).await;
    let (_, token) = register(&app, "rejected@example.com", None).await;

    let (_, purchase) = send(
        &app,
        post(
            "/tokens/purchase",
            &token,
            json!({ "amount": "50", "tokenAmount": "10", "paymentMethod": "paypal", "currentPrice": "5" }),
        )
        .to_request(),
    )
    .await;

    let (status, rejected) = send(
        &app,
        post(
            "/admin/transactions/approve",
            &admin,
            json!({ "transactionId": purchase["transactionId"], "action": "reject", "reason": "Payment not received" }),
        )
        .to_request(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(rejected["status"], "REJECTED");
    assert_eq!(dec_of(&me(&app, &token).await["totalTokens"]), Decimal::ZERO);
}

#[actix_web::test]
async fn test_purchase_below_minimum_is_rejected() {
    let ctx = context();
    let app = test_app!(ctx);
    let (_, token) = register(&app, "small@example.com", None).await;

    let (status, body) = send(
        &app,
        post(
            "/tokens/purchase",
            &token,
            json!({ "amount": "5", "tokenAmount": "1", "paymentMethod": "crypto", "currentPrice": "2.80" }),
        )
        .to_request(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["type"], "validation_error");
}

#[actix_web::test]
async fn test_stake_moves_tokens_and_refuses_overdraw() {
    let ctx = context();
    let app = test_app!(ctx);
    let admin = admin_token(&ctx, &app).await;
    let (_, token) = register(&app, "staker@example.com", None).await;
    buy(&app, &token, &admin, "280", "100").await;

    let (status, body) = send(&app, post("/tokens/stake", &token, json!({ "amount": "150" })).to_request()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["type"], "insufficient_funds");

    let (status, stake) = send(&app, post("/tokens/stake", &token, json!({ "amount": "40" })).to_request()).await;
    assert_eq!(status, StatusCode::OK, "{}", stake);
    assert_eq!(dec_of(&stake["balances"]["availableTokens"]), dec!(60));
    assert_eq!(dec_of(&stake["balances"]["stakedTokens"]), dec!(40));
    assert_eq!(dec_of(&stake["balances"]["totalTokens"]), dec!(100));
    assert_eq!(dec_of(&stake["apy"]), dec!(12));

    let (_, stakes) = send(&app, get("/tokens/staking", &token).to_request()).await;
    assert_eq!(stakes["pagination"]["total"], 1);
    assert_eq!(stakes["items"][0]["status"], "ACTIVE");

    let (_, history) = send(&app, get("/tokens/transactions", &token).to_request()).await;
    let entry = history["items"]
        .as_array()
        .unwrap()
        .iter()
        .find(|t| t["type"] == "STAKE")
        .expect("stake transaction");
    assert_eq!(entry["status"], "COMPLETED");
    assert_eq!(dec_of(&entry["amount"]), Decimal::ZERO);
    assert_eq!(dec_of(&entry["tokenAmount"]), dec!(40));

    let (status, body) = send(
        &app,
        post("/tokens/unstake", &token, json!({ "stakingId": stake["stakingId"] })).to_request(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["type"], "lock_period_active");

    ctx.clock.advance(Duration::days(1100));
    let (status, released) = send(
        &app,
        post("/tokens/unstake", &token, json!({ "stakingId": stake["stakingId"] })).to_request(),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", released);
    assert_eq!(dec_of(&released["balances"]["availableTokens"]), dec!(100));
    assert_eq!(dec_of(&released["balances"]["stakedTokens"]), Decimal::ZERO);
}

#[actix_web::test]
async fn test_usdt_withdrawal_waits_for_lock_period() {
    let ctx = context();
    let app = test_app!(ctx);
    let admin = admin_token(&ctx, &app).await;
    let (_, token) = register(&app, "saver@example.com", None).await;
    buy(&app, &token, &admin, "280", "100").await;

    let (status, body) = send(
        &app,
        post("/tokens/convert-to-usdt", &token, json!({ "tokenAmount": "50" })).to_request(),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(dec_of(&body["conversion"]["usdtAmount"]), dec!(140.00));

    let (status, body) = send(
        &app,
        post("/usdt/withdraw", &token, json!({ "amount": "100", "walletAddress": WALLET })).to_request(),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    let withdrawal = body["withdrawalRequest"].clone();
    assert_eq!(withdrawal["status"], "PENDING");
    assert_eq!(withdrawal["canWithdraw"], false);
    assert_eq!(withdrawal["network"], "TRC20");
    assert_eq!(dec_of(&me(&app, &token).await["usdtBalance"]), dec!(40));

    let (status, body) = send(
        &app,
        post(
            "/admin/withdrawals/approve",
            &admin,
            json!({ "withdrawalId": withdrawal["id"], "action": "approve" }),
        )
        .to_request(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["type"], "lock_period_active");
    assert!(body["error"]["details"]["remainingDays"].as_i64().unwrap() > 0);

    ctx.clock.advance(Duration::days(1100));

    let (_, listed) = send(&app, get("/usdt/withdrawals", &token).to_request()).await;
    assert_eq!(listed["items"][0]["canWithdraw"], true);

    let (status, approved) = send(
        &app,
        post(
            "/admin/withdrawals/approve",
            &admin,
            json!({ "withdrawalId": withdrawal["id"], "action": "approve" }),
        )
        .to_request(),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", approved);
    assert_eq!(approved["status"], "APPROVED");
    assert_eq!(dec_of(&me(&app, &token).await["usdtBalance"]), dec!(40));

    let (status, _) = send(
        &app,
        post(
            "/admin/withdrawals/approve",
            &admin,
            json!({ "withdrawalId": withdrawal["id"], "action": "reject" }),
        )
        .to_request(),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[actix_web::test]
async fn test_rejected_token_withdrawal_restores_hold() {
    let ctx = context();
    let app = test_app!(ctx);
    let admin = admin_token(&ctx, &app).await;
    let (_, token) = register(&app, "holder@example.com", None).await;
    buy(&app, &token, &admin, "56", "20").await;

    let (status, body) = send(
        &app,
        post(
            "/tokens/withdraw",
            &token,
            json!({ "tokenAmount": "5", "walletAddress": WALLET, "network": "ERC20" }),
        )
        .to_request(),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    let withdrawal = body["withdrawalRequest"].clone();
    assert_eq!(withdrawal["network"], "ERC20");

    let held = me(&app, &token).await;
    assert_eq!(dec_of(&held["availableTokens"]), dec!(15));
    assert_eq!(dec_of(&held["totalTokens"]), dec!(20));

    let (status, rejected) = send(
        &app,
        post(
            "/admin/withdrawals/approve",
            &admin,
            json!({ "withdrawalId": withdrawal["id"], "action": "reject", "reason": "Wallet failed screening" }),
        )
        .to_request(),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", rejected);
    assert_eq!(rejected["status"], "REJECTED");
    assert_eq!(rejected["rejectionReason"], "Wallet failed screening");

    let restored = me(&app, &token).await;
    assert_eq!(dec_of(&restored["availableTokens"]), dec!(20));
    assert_eq!(dec_of(&restored["totalTokens"]), dec!(20));

    let (_, history) = send(&app, get("/tokens/transactions", &token).to_request()).await;
    let entry = history["items"]
        .as_array()
        .unwrap()
        .iter()
        .find(|t| t["type"] == "WITHDRAWAL")
        .expect("withdrawal transaction");
    assert_eq!(entry["status"], "FAILED");
}

#[actix_web::test]
async fn test_recorded_price_drives_conversion() {
    let ctx = context();
    let app = test_app!(ctx);
    let admin = admin_token(&ctx, &app).await;
    let (_, token) = register(&app, "trader@example.com", None).await;

    let (_, price) = send(&app, get("/tokens/price", &token).to_request()).await;
    assert_eq!(price["source"], "fallback");
    assert_eq!(dec_of(&price["price"]), dec!(2.80));

    let (status, price) = send(&app, post("/admin/token-price", &admin, json!({ "price": "3.00" })).to_request()).await;
    assert_eq!(status, StatusCode::OK, "{}", price);
    assert_eq!(price["source"], "today");

    buy(&app, &token, &admin, "30", "10").await;
    let (status, conversion) = send(
        &app,
        post("/tokens/convert-to-usdt", &token, json!({ "tokenAmount": "10" })).to_request(),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", conversion);
    assert_eq!(dec_of(&conversion["conversion"]["usdtAmount"]), dec!(30));
    assert_eq!(dec_of(&conversion["conversion"]["balances"]["totalTokens"]), Decimal::ZERO);

    // A day later there is no price for today, so the latest one is used.
    ctx.clock.advance(Duration::days(1));
    let (_, price) = send(&app, get("/tokens/price", &token).to_request()).await;
    assert_eq!(price["source"], "latest");
    assert_eq!(dec_of(&price["price"]), dec!(3.00));

    let (_, history) = send(&app, get("/tokens/transactions", &token).to_request()).await;
    let sale = history["items"]
        .as_array()
        .unwrap()
        .iter()
        .find(|t| t["type"] == "SALE")
        .expect("sale transaction");
    assert_eq!(sale["reference"], "internal_conversion");
    assert_eq!(sale["status"], "COMPLETED");
}

#[actix_web::test]
async fn test_admin_routes_use_persisted_role() {
    let ctx = context();
    let app = test_app!(ctx);
    let superadmin = admin_token(&ctx, &app).await;
    let (user, token) = register(&app, "climber@example.com", None).await;
    let user_id = Uuid::parse_str(user["id"].as_str().unwrap()).unwrap();

    let (status, body) = send(&app, get("/admin/dashboard", &token).to_request()).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["type"], "forbidden");

    // The token still says USER; the stored role decides.
    ctx.store
        .set_user_role(user_id, Role::Admin, ctx.clock.now())
        .await
        .unwrap();
    let (status, stats) = send(&app, get("/admin/dashboard", &token).to_request()).await;
    assert_eq!(status, StatusCode::OK, "{}", stats);
    assert_eq!(stats["totalUsers"], 2);

    let (status, _) = send(
        &app,
        post("/admin/settings/commission-rate", &token, json!({ "rate": "7.5" })).to_request(),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, rate) = send(
        &app,
        post("/admin/settings/commission-rate", &superadmin, json!({ "rate": "7.5" })).to_request(),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", rate);

    let (status, _) = send(
        &app,
        post(&format!("/admin/users/{}/role", user_id), &superadmin, json!({ "role": "USER" })).to_request(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(&app, get("/admin/users", &token).to_request()).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = send(
        &app,
        post(&format!("/admin/users/{}/status", user_id), &superadmin, json!({ "isActive": false })).to_request(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = send(&app, get("/users/me", &token).to_request()).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["type"], "account_deactivated");
}

#[actix_web::test]
async fn test_broadcast_and_read_state() {
    let ctx = context();
    let app = test_app!(ctx);
    let admin = admin_token(&ctx, &app).await;
    let (_, token) = register(&app, "reader@example.com", None).await;

    let (status, announcement) = send(
        &app,
        post(
            "/admin/notifications",
            &admin,
            json!({ "title": "Maintenance", "message": "Back at 10:00 UTC" }),
        )
        .to_request(),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{}", announcement);
    assert_eq!(announcement["type"], "ANNOUNCEMENT");
    assert!(announcement["userId"].is_null());

    let (_, purchase) = send(
        &app,
        post(
            "/tokens/purchase",
            &token,
            json!({ "amount": "20", "tokenAmount": "5", "paymentMethod": "bank_transfer", "currentPrice": "4" }),
        )
        .to_request(),
    )
    .await;
    assert_eq!(dec_of(&purchase["processingFee"]), dec!(0.10));

    let (_, inbox) = send(&app, get("/notifications", &token).to_request()).await;
    let items = inbox["items"].as_array().unwrap();
    assert!(items.iter().any(|n| n["type"] == "ANNOUNCEMENT"));
    let own = items
        .iter()
        .find(|n| n["type"] == "PURCHASE")
        .expect("purchase notification");

    let (status, _) = send(
        &app,
        post(&format!("/notifications/{}/read", announcement["id"].as_str().unwrap()), &token, json!({})).to_request(),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, read) = send(
        &app,
        post(&format!("/notifications/{}/read", own["id"].as_str().unwrap()), &token, json!({})).to_request(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(read["isRead"], true);

    let (status, _) = send(
        &app,
        post("/admin/notifications", &token, json!({ "title": "Hi", "message": "Spam" })).to_request(),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[actix_web::test]
async fn test_health_and_metrics_are_public() {
    let ctx = context();
    let app = test_app!(ctx);

    let (status, health) = send(&app, test::TestRequest::get().uri("/health").to_request()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "healthy");

    let resp = test::call_service(&app, test::TestRequest::get().uri("/metrics").to_request()).await;
    assert_eq!(resp.status(), StatusCode::OK);
}
