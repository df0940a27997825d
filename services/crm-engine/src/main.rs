use actix_cors::Cors;
use actix_web::{middleware::Logger, middleware::NormalizePath, web, App, HttpServer};
use anyhow::Context;
use crm_engine::{
    auth::SessionKeys,
    config::Config,
    handlers::{self, CookiePolicy},
    middleware::{RateLimiter, SessionAuth},
    notifications,
    services::CrmService,
    store::PgStore,
};
use dotenv::dotenv;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_file(true)
        .with_line_number(true)
        .with_thread_ids(true)
        .with_target(false);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    let config = Config::from_env().context("Failed to load configuration")?;
    init_tracing(config.logging.json);
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    info!("Starting CRM Engine on port {}", config.server.port);

    let store = Arc::new(
        PgStore::connect(&config.database)
            .await
            .context("Failed to connect to database")?,
    );
    if config.database.run_migrations {
        store.migrate().await.context("Failed to run migrations")?;
    }

    let mailer = notifications::mailer_from_config(&config.email)?;
    let sessions = SessionKeys::new(&config.auth.jwt_secret, config.auth.session_ttl_hours);
    let service = Arc::new(CrmService::new(
        store,
        mailer,
        sessions.clone(),
        config.business.clone(),
        config.email.admin_address.clone(),
    ));

    if let (Some(email), Some(password)) = (
        config.auth.bootstrap_admin_email.as_deref(),
        config.auth.bootstrap_admin_password.as_deref(),
    ) {
        service
            .bootstrap_admin(email, password)
            .await
            .context("Failed to bootstrap admin account")?;
    }

    let auth_limiter = RateLimiter::new(config.rate_limit.auth_requests_per_minute);
    let cookies = CookiePolicy {
        secure: config.auth.cookie_secure,
    };

    HttpServer::new(move || {
        let limiter = auth_limiter.clone();

        App::new()
            .wrap(SessionAuth::new(sessions.clone()))
            .wrap(NormalizePath::trim())
            .wrap(Logger::default())
            .wrap(Cors::permissive())
            .app_data(web::Data::new(service.clone()))
            .configure(move |cfg| handlers::configure_routes(cfg, limiter, cookies))
    })
    .workers(config.server.workers)
    .bind((config.server.host.as_str(), config.server.port))?
    .run()
    .await?;

    Ok(())
}
