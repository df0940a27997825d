use config::{ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::env;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub auth: AuthConfig,
    pub email: EmailConfig,
    pub business: BusinessConfig,
    pub rate_limit: RateLimitConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub workers: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_secs: u64,
    pub run_migrations: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub session_ttl_hours: i64,
    pub cookie_secure: bool,
    pub bootstrap_admin_email: Option<String>,
    pub bootstrap_admin_password: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EmailConfig {
    /// Relay endpoint accepting JSON messages. Empty means log-only delivery.
    pub relay_url: String,
    pub api_key: Option<String>,
    pub from_address: String,
    pub admin_address: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct BusinessConfig {
    /// Percent, used until an admin stores a rate in the settings table.
    pub default_commission_rate: Decimal,
    /// Annual percentage yield recorded on new stakes.
    pub staking_apy: Decimal,
    pub staking_term_months: u32,
    pub withdrawal_lock_months: u32,
    pub min_purchase_amount: Decimal,
    pub min_usdt_withdrawal: Decimal,
    pub min_token_amount: Decimal,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RateLimitConfig {
    pub auth_requests_per_minute: u32,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    pub json: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let environment = env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string());

        let mut builder = config::Config::builder()
            // Start with default configuration
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8090)?
            .set_default("server.workers", 4)?
            .set_default("database.url", "")?
            .set_default("database.max_connections", 10)?
            .set_default("database.min_connections", 2)?
            .set_default("database.acquire_timeout_secs", 5)?
            .set_default("database.run_migrations", true)?
            .set_default("auth.jwt_secret", "")?
            .set_default("auth.session_ttl_hours", 24)?
            .set_default("auth.cookie_secure", false)?
            .set_default("email.relay_url", "")?
            .set_default("email.from_address", "no-reply@ditokens.com")?
            .set_default("email.admin_address", "admin@ditokens.com")?
            .set_default("email.timeout_secs", 10)?
            .set_default("business.default_commission_rate", "5")?
            .set_default("business.staking_apy", "12")?
            .set_default("business.staking_term_months", 36)?
            .set_default("business.withdrawal_lock_months", 36)?
            .set_default("business.min_purchase_amount", "10")?
            .set_default("business.min_usdt_withdrawal", "10")?
            .set_default("business.min_token_amount", "1")?
            .set_default("rate_limit.auth_requests_per_minute", 30)?
            .set_default("logging.json", false)?;

        // Add environment-specific config file if it exists
        if let Ok(config_file) = env::var("CONFIG_FILE") {
            builder = builder.add_source(File::with_name(&config_file).required(false));
        } else {
            builder = builder.add_source(
                File::with_name(&format!("config/{}", environment)).required(false),
            );
        }

        // Override with environment variables
        builder = builder.add_source(
            Environment::with_prefix("CRM_ENGINE")
                .separator("__")
                .list_separator(","),
        );

        // Special handling for common env vars
        if let Ok(db_url) = env::var("DATABASE_URL") {
            builder = builder.set_override("database.url", db_url)?;
        }

        if let Ok(secret) = env::var("JWT_SECRET") {
            builder = builder.set_override("auth.jwt_secret", secret)?;
        }

        if let Ok(port) = env::var("CRM_ENGINE_PORT") {
            builder = builder.set_override("server.port", port)?;
        }

        builder.build()?.try_deserialize()
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.server.port == 0 {
            return Err("Server port cannot be 0".to_string());
        }

        if self.database.url.is_empty() {
            return Err("Database URL is required".to_string());
        }

        if self.auth.jwt_secret.len() < 32 {
            return Err("JWT secret must be at least 32 characters".to_string());
        }

        if self.auth.session_ttl_hours <= 0 {
            return Err("Session TTL must be positive".to_string());
        }

        if self.business.default_commission_rate < Decimal::ZERO
            || self.business.default_commission_rate > Decimal::ONE_HUNDRED
        {
            return Err("Default commission rate must be between 0 and 100".to_string());
        }

        if self.business.staking_term_months == 0 {
            return Err("Staking term must be at least one month".to_string());
        }

        if self.rate_limit.auth_requests_per_minute == 0 {
            return Err("Auth rate limit must be positive".to_string());
        }

        Ok(())
    }
}

impl BusinessConfig {
    pub fn defaults() -> Self {
        BusinessConfig {
            default_commission_rate: Decimal::from(5),
            staking_apy: Decimal::from(12),
            staking_term_months: 36,
            withdrawal_lock_months: 36,
            min_purchase_amount: Decimal::from(10),
            min_usdt_withdrawal: Decimal::from(10),
            min_token_amount: Decimal::ONE,
        }
    }
}
