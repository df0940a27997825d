pub mod approval;
pub mod auth;
pub mod commission;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod ledger;
pub mod lock_gate;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod notifications;
pub mod pricing;
pub mod services;
pub mod staking;
pub mod store;

pub use config::Config;
pub use errors::{CrmError, Result};
pub use services::CrmService;
