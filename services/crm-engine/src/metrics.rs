use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

lazy_static! {
    pub static ref REGISTRY: Registry = {
        let registry = Registry::new();
        register_metrics(&registry).expect("metrics can be registered");
        registry
    };

    pub static ref SIGN_UPS: IntCounter = IntCounter::new(
        "crm_sign_ups_total",
        "Total accounts created"
    ).expect("metric can be created");

    pub static ref SIGN_IN_FAILURES: IntCounter = IntCounter::new(
        "crm_sign_in_failures_total",
        "Rejected sign-in attempts"
    ).expect("metric can be created");

    pub static ref LEDGER_OPERATIONS: IntCounterVec = IntCounterVec::new(
        Opts::new("crm_ledger_operations_total", "Balance-affecting operations by kind"),
        &["operation"]
    ).expect("metric can be created");

    pub static ref REVIEWS: IntCounterVec = IntCounterVec::new(
        Opts::new("crm_reviews_total", "Admin review decisions"),
        &["entity", "decision"]
    ).expect("metric can be created");

    pub static ref LOCKED_WITHDRAWAL_ATTEMPTS: IntCounter = IntCounter::new(
        "crm_locked_withdrawal_attempts_total",
        "Withdrawal approvals refused by the lock period"
    ).expect("metric can be created");

    pub static ref NOTIFICATION_FAILURES: IntCounterVec = IntCounterVec::new(
        Opts::new("crm_notification_failures_total", "Notification deliveries that failed"),
        &["channel"]
    ).expect("metric can be created");

    pub static ref ACTIVE_STAKES: IntGauge = IntGauge::new(
        "crm_active_stakes_opened",
        "Stakes opened minus stakes released since start"
    ).expect("metric can be created");
}

pub fn register_metrics(registry: &Registry) -> Result<(), prometheus::Error> {
    registry.register(Box::new(SIGN_UPS.clone()))?;
    registry.register(Box::new(SIGN_IN_FAILURES.clone()))?;
    registry.register(Box::new(LEDGER_OPERATIONS.clone()))?;
    registry.register(Box::new(REVIEWS.clone()))?;
    registry.register(Box::new(LOCKED_WITHDRAWAL_ATTEMPTS.clone()))?;
    registry.register(Box::new(NOTIFICATION_FAILURES.clone()))?;
    registry.register(Box::new(ACTIVE_STAKES.clone()))?;
    Ok(())
}

/// Prometheus text exposition of every registered metric
pub fn metrics_handler() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = vec![];
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}
