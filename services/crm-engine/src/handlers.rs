use crate::auth::SESSION_COOKIE;
use crate::errors::CrmError;
use crate::metrics;
use crate::middleware::{RateLimiter, SessionUser};
use crate::models::{
    BroadcastRequest, CommissionFilter, CommissionRateRequest, CommissionReviewRequest,
    ConvertRequest, PageQuery, PageRequest, PurchaseRequest, SignInRequest, SignUpRequest,
    StakeRequest, TokenPriceRequest, TokenWithdrawRequest, TransactionReviewRequest,
    UnstakeRequest, UserRoleRequest, UserStatusRequest, UsdtWithdrawRequest,
    WithdrawalReviewRequest,
};
use crate::services::CrmService;
use actix_web::cookie::{time, Cookie, SameSite};
use actix_web::{web, HttpResponse};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

type ServiceData = web::Data<Arc<CrmService>>;

/// How the session cookie is issued
#[derive(Debug, Clone, Copy)]
pub struct CookiePolicy {
    pub secure: bool,
}

fn session_cookie(token: String, ttl_seconds: i64, policy: CookiePolicy) -> Cookie<'static> {
    Cookie::build(SESSION_COOKIE, token)
        .path("/")
        .http_only(true)
        .secure(policy.secure)
        .same_site(SameSite::Lax)
        .max_age(time::Duration::seconds(ttl_seconds))
        .finish()
}

/// Health check endpoint
pub async fn health_check(service: ServiceData) -> HttpResponse {
    match service.health_check().await {
        Ok(()) => HttpResponse::Ok().json(json!({
            "status": "healthy",
            "service": "crm-engine",
            "version": env!("CARGO_PKG_VERSION")
        })),
        Err(e) => {
            tracing::error!("Health check failed: {}", e);
            HttpResponse::ServiceUnavailable().json(json!({
                "status": "unhealthy",
                "service": "crm-engine"
            }))
        }
    }
}

/// Prometheus metrics endpoint
pub async fn metrics_endpoint() -> HttpResponse {
    match metrics::metrics_handler() {
        Ok(body) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(body),
        Err(e) => {
            tracing::error!("Failed to gather metrics: {}", e);
            HttpResponse::InternalServerError().json(json!({
                "error": "Failed to gather metrics"
            }))
        }
    }
}

// ===== Auth =====

pub async fn sign_up(service: ServiceData, request: web::Json<SignUpRequest>) -> Result<HttpResponse, CrmError> {
    let user = service.sign_up(request.into_inner()).await?;
    Ok(HttpResponse::Created().json(json!({
        "message": "Account created",
        "user": user
    })))
}

pub async fn sign_in(
    service: ServiceData,
    policy: web::Data<CookiePolicy>,
    request: web::Json<SignInRequest>,
) -> Result<HttpResponse, CrmError> {
    let response = service.sign_in(request.into_inner()).await?;
    let cookie = session_cookie(
        response.token.clone(),
        service.sessions().ttl().num_seconds(),
        **policy,
    );
    Ok(HttpResponse::Ok().cookie(cookie).json(response))
}

pub async fn sign_out() -> HttpResponse {
    let mut cookie = Cookie::build(SESSION_COOKIE, "").path("/").finish();
    cookie.make_removal();
    HttpResponse::Ok()
        .cookie(cookie)
        .json(json!({ "message": "Signed out" }))
}

pub async fn me(service: ServiceData, caller: SessionUser) -> Result<HttpResponse, CrmError> {
    let user = service.current_user(caller.0).await?;
    Ok(HttpResponse::Ok().json(user))
}

// ===== Tokens =====

pub async fn purchase(
    service: ServiceData,
    caller: SessionUser,
    request: web::Json<PurchaseRequest>,
) -> Result<HttpResponse, CrmError> {
    let response = service.purchase(caller.0, request.into_inner()).await?;
    Ok(HttpResponse::Ok().json(response))
}

pub async fn stake(
    service: ServiceData,
    caller: SessionUser,
    request: web::Json<StakeRequest>,
) -> Result<HttpResponse, CrmError> {
    let response = service.stake(caller.0, request.into_inner()).await?;
    Ok(HttpResponse::Ok().json(response))
}

pub async fn unstake(
    service: ServiceData,
    caller: SessionUser,
    request: web::Json<UnstakeRequest>,
) -> Result<HttpResponse, CrmError> {
    let response = service.unstake(caller.0, request.into_inner()).await?;
    Ok(HttpResponse::Ok().json(response))
}

pub async fn convert_to_usdt(
    service: ServiceData,
    caller: SessionUser,
    request: web::Json<ConvertRequest>,
) -> Result<HttpResponse, CrmError> {
    let conversion = service.convert(caller.0, request.into_inner()).await?;
    Ok(HttpResponse::Ok().json(json!({ "conversion": conversion })))
}

pub async fn withdraw_tokens(
    service: ServiceData,
    caller: SessionUser,
    request: web::Json<TokenWithdrawRequest>,
) -> Result<HttpResponse, CrmError> {
    let withdrawal = service.withdraw_tokens(caller.0, request.into_inner()).await?;
    Ok(HttpResponse::Ok().json(json!({ "withdrawalRequest": withdrawal })))
}

pub async fn transactions(
    service: ServiceData,
    caller: SessionUser,
    query: web::Query<PageQuery>,
) -> Result<HttpResponse, CrmError> {
    let page = service
        .list_transactions(caller.0, PageRequest::from(query.into_inner()))
        .await?;
    Ok(HttpResponse::Ok().json(page))
}

pub async fn stakes(
    service: ServiceData,
    caller: SessionUser,
    query: web::Query<PageQuery>,
) -> Result<HttpResponse, CrmError> {
    let page = service
        .list_stakes(caller.0, PageRequest::from(query.into_inner()))
        .await?;
    Ok(HttpResponse::Ok().json(page))
}

pub async fn token_price(service: ServiceData) -> Result<HttpResponse, CrmError> {
    let price = service.current_price().await?;
    Ok(HttpResponse::Ok().json(price))
}

// ===== USDT =====

pub async fn withdraw_usdt(
    service: ServiceData,
    caller: SessionUser,
    request: web::Json<UsdtWithdrawRequest>,
) -> Result<HttpResponse, CrmError> {
    let withdrawal = service.withdraw_usdt(caller.0, request.into_inner()).await?;
    Ok(HttpResponse::Ok().json(json!({ "withdrawalRequest": withdrawal })))
}

pub async fn withdrawals(
    service: ServiceData,
    caller: SessionUser,
    query: web::Query<PageQuery>,
) -> Result<HttpResponse, CrmError> {
    let page = service
        .list_withdrawals(caller.0, PageRequest::from(query.into_inner()))
        .await?;
    Ok(HttpResponse::Ok().json(page))
}

// ===== Referrals =====

pub async fn referral_summary(service: ServiceData, caller: SessionUser) -> Result<HttpResponse, CrmError> {
    let summary = service.referral_summary(caller.0).await?;
    Ok(HttpResponse::Ok().json(summary))
}

pub async fn referral_commissions(
    service: ServiceData,
    caller: SessionUser,
    filter: web::Query<CommissionFilter>,
) -> Result<HttpResponse, CrmError> {
    let page = service.list_commissions(caller.0, filter.into_inner()).await?;
    Ok(HttpResponse::Ok().json(page))
}

// ===== Notifications =====

pub async fn notifications(
    service: ServiceData,
    caller: SessionUser,
    query: web::Query<PageQuery>,
) -> Result<HttpResponse, CrmError> {
    let page = service
        .notifications(caller.0, PageRequest::from(query.into_inner()))
        .await?;
    Ok(HttpResponse::Ok().json(page))
}

pub async fn mark_notification_read(
    service: ServiceData,
    caller: SessionUser,
    notification_id: web::Path<Uuid>,
) -> Result<HttpResponse, CrmError> {
    let notification = service
        .mark_notification_read(caller.0, notification_id.into_inner())
        .await?;
    Ok(HttpResponse::Ok().json(notification))
}

// ===== Admin =====

pub async fn review_transaction(
    service: ServiceData,
    caller: SessionUser,
    request: web::Json<TransactionReviewRequest>,
) -> Result<HttpResponse, CrmError> {
    let transaction = service.review_transaction(caller.0, request.into_inner()).await?;
    Ok(HttpResponse::Ok().json(transaction))
}

pub async fn review_withdrawal(
    service: ServiceData,
    caller: SessionUser,
    request: web::Json<WithdrawalReviewRequest>,
) -> Result<HttpResponse, CrmError> {
    let withdrawal = service.review_withdrawal(caller.0, request.into_inner()).await?;
    Ok(HttpResponse::Ok().json(withdrawal))
}

pub async fn review_commission(
    service: ServiceData,
    caller: SessionUser,
    request: web::Json<CommissionReviewRequest>,
) -> Result<HttpResponse, CrmError> {
    let commission = service.review_commission(caller.0, request.into_inner()).await?;
    Ok(HttpResponse::Ok().json(commission))
}

pub async fn admin_transactions(
    service: ServiceData,
    caller: SessionUser,
    query: web::Query<PageQuery>,
) -> Result<HttpResponse, CrmError> {
    let page = service
        .admin_list_transactions(caller.0, PageRequest::from(query.into_inner()))
        .await?;
    Ok(HttpResponse::Ok().json(page))
}

pub async fn admin_withdrawals(
    service: ServiceData,
    caller: SessionUser,
    query: web::Query<PageQuery>,
) -> Result<HttpResponse, CrmError> {
    let page = service
        .admin_list_withdrawals(caller.0, PageRequest::from(query.into_inner()))
        .await?;
    Ok(HttpResponse::Ok().json(page))
}

pub async fn admin_commissions(
    service: ServiceData,
    caller: SessionUser,
    filter: web::Query<CommissionFilter>,
) -> Result<HttpResponse, CrmError> {
    let page = service
        .admin_list_commissions(caller.0, filter.into_inner())
        .await?;
    Ok(HttpResponse::Ok().json(page))
}

pub async fn admin_users(
    service: ServiceData,
    caller: SessionUser,
    query: web::Query<PageQuery>,
) -> Result<HttpResponse, CrmError> {
    let page = service
        .list_users(caller.0, PageRequest::from(query.into_inner()))
        .await?;
    Ok(HttpResponse::Ok().json(page))
}

pub async fn set_user_status(
    service: ServiceData,
    caller: SessionUser,
    user_id: web::Path<Uuid>,
    request: web::Json<UserStatusRequest>,
) -> Result<HttpResponse, CrmError> {
    let user = service
        .set_user_status(caller.0, user_id.into_inner(), request.into_inner())
        .await?;
    Ok(HttpResponse::Ok().json(user))
}

pub async fn set_user_role(
    service: ServiceData,
    caller: SessionUser,
    user_id: web::Path<Uuid>,
    request: web::Json<UserRoleRequest>,
) -> Result<HttpResponse, CrmError> {
    let user = service
        .set_user_role(caller.0, user_id.into_inner(), request.into_inner())
        .await?;
    Ok(HttpResponse::Ok().json(user))
}

pub async fn broadcast(
    service: ServiceData,
    caller: SessionUser,
    request: web::Json<BroadcastRequest>,
) -> Result<HttpResponse, CrmError> {
    let notification = service.broadcast(caller.0, request.into_inner()).await?;
    Ok(HttpResponse::Created().json(notification))
}

pub async fn set_token_price(
    service: ServiceData,
    caller: SessionUser,
    request: web::Json<TokenPriceRequest>,
) -> Result<HttpResponse, CrmError> {
    let price = service.set_token_price(caller.0, request.into_inner()).await?;
    Ok(HttpResponse::Ok().json(price))
}

pub async fn set_commission_rate(
    service: ServiceData,
    caller: SessionUser,
    request: web::Json<CommissionRateRequest>,
) -> Result<HttpResponse, CrmError> {
    let rate = service.set_commission_rate(caller.0, request.into_inner()).await?;
    Ok(HttpResponse::Ok().json(json!({ "rate": rate })))
}

pub async fn dashboard(service: ServiceData, caller: SessionUser) -> Result<HttpResponse, CrmError> {
    let stats = service.dashboard(caller.0).await?;
    Ok(HttpResponse::Ok().json(stats))
}

/// Configure routes. Sign-up and sign-in sit behind `auth_limiter`.
pub fn configure_routes(cfg: &mut web::ServiceConfig, auth_limiter: RateLimiter, cookies: CookiePolicy) {
    cfg.app_data(web::Data::new(cookies))
        .app_data(web::JsonConfig::default().error_handler(|err, _| {
            CrmError::validation(format!("Invalid request body: {}", err)).into()
        }))
        .service(
            web::scope("/auth")
                .wrap(auth_limiter)
                .route("/sign-up", web::post().to(sign_up))
                .route("/sign-in", web::post().to(sign_in))
                .route("/sign-out", web::post().to(sign_out)),
        )
        .route("/users/me", web::get().to(me))
        .service(
            web::scope("/tokens")
                .route("/purchase", web::post().to(purchase))
                .route("/stake", web::post().to(stake))
                .route("/unstake", web::post().to(unstake))
                .route("/convert-to-usdt", web::post().to(convert_to_usdt))
                .route("/withdraw", web::post().to(withdraw_tokens))
                .route("/transactions", web::get().to(transactions))
                .route("/staking", web::get().to(stakes))
                .route("/price", web::get().to(token_price)),
        )
        .service(
            web::scope("/usdt")
                .route("/withdraw", web::post().to(withdraw_usdt))
                .route("/withdrawals", web::get().to(withdrawals)),
        )
        .service(
            web::scope("/referrals")
                .route("/me", web::get().to(referral_summary))
                .route("/commissions", web::get().to(referral_commissions)),
        )
        .route("/notifications", web::get().to(notifications))
        .route("/notifications/{id}/read", web::post().to(mark_notification_read))
        .service(
            web::scope("/admin")
                .route("/transactions", web::get().to(admin_transactions))
                .route("/transactions/approve", web::post().to(review_transaction))
                .route("/withdrawals", web::get().to(admin_withdrawals))
                .route("/withdrawals/approve", web::post().to(review_withdrawal))
                .route("/commissions", web::get().to(admin_commissions))
                .route("/commissions/approve", web::post().to(review_commission))
                .route("/users", web::get().to(admin_users))
                .route("/users/{id}/status", web::post().to(set_user_status))
                .route("/users/{id}/role", web::post().to(set_user_role))
                .route("/notifications", web::post().to(broadcast))
                .route("/token-price", web::post().to(set_token_price))
                .route("/settings/commission-rate", web::post().to(set_commission_rate))
                .route("/dashboard", web::get().to(dashboard)),
        )
        .route("/metrics", web::get().to(metrics_endpoint))
        .route("/health", web::get().to(health_check));
}
