use actix_web::{error::ResponseError, http::StatusCode, HttpResponse};
use chrono::{DateTime, Utc};
use serde_json::json;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CrmError>;

#[derive(Error, Debug)]
pub enum CrmError {
    #[error("Validation error: {message}")]
    Validation {
        message: String,
        details: Option<serde_json::Value>,
    },

    #[error("Authentication required")]
    Unauthorized,

    #[error("Invalid email or password")]
    InvalidCredentials,

    #[error("Account is deactivated")]
    AccountDeactivated,

    #[error("Insufficient permissions")]
    Forbidden,

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("{0}")]
    Conflict(String),

    #[error("Insufficient {asset}: required {required}, available {available}")]
    InsufficientFunds {
        asset: &'static str,
        required: String,
        available: String,
    },

    #[error("Lock period active: {remaining_days} days remaining")]
    LockPeriodActive {
        remaining_days: i64,
        unlock_at: DateTime<Utc>,
    },

    #[error("Database unavailable: {0}")]
    DatabaseUnavailable(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl CrmError {
    pub fn validation(message: impl Into<String>) -> Self {
        CrmError::Validation {
            message: message.into(),
            details: None,
        }
    }

    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        CrmError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    fn error_type(&self) -> &str {
        match self {
            CrmError::Validation { .. } => "validation_error",
            CrmError::Unauthorized => "unauthorized",
            CrmError::InvalidCredentials => "invalid_credentials",
            CrmError::AccountDeactivated => "account_deactivated",
            CrmError::Forbidden => "forbidden",
            CrmError::NotFound { .. } => "not_found",
            CrmError::Conflict(_) => "conflict",
            CrmError::InsufficientFunds { .. } => "insufficient_funds",
            CrmError::LockPeriodActive { .. } => "lock_period_active",
            CrmError::DatabaseUnavailable(_) => "database_unavailable",
            CrmError::Database(_) => "database_error",
            CrmError::Internal(_) => "internal_error",
        }
    }

    /// Message safe to show to API clients. Storage and internal failures are
    /// replaced with generic text; the raw cause only goes to the logs.
    fn public_message(&self) -> String {
        match self {
            CrmError::DatabaseUnavailable(_) => {
                "Service temporarily unavailable, please try again later".to_string()
            }
            CrmError::Database(_) | CrmError::Internal(_) => {
                "An unexpected error occurred".to_string()
            }
            CrmError::Validation { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    fn details(&self) -> Option<serde_json::Value> {
        match self {
            CrmError::Validation { details, .. } => details.clone(),
            CrmError::LockPeriodActive {
                remaining_days,
                unlock_at,
            } => Some(json!({
                "remainingDays": remaining_days,
                "unlockAt": unlock_at,
            })),
            CrmError::InsufficientFunds {
                asset,
                required,
                available,
            } => Some(json!({
                "asset": asset,
                "required": required,
                "available": available,
            })),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for CrmError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::WorkerCrashed => CrmError::DatabaseUnavailable(err.to_string()),
            other => CrmError::Database(other.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for CrmError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        CrmError::Database(format!("migration failed: {}", err))
    }
}

impl From<validator::ValidationErrors> for CrmError {
    fn from(errors: validator::ValidationErrors) -> Self {
        CrmError::Validation {
            message: "Request validation failed".to_string(),
            details: serde_json::to_value(&errors).ok(),
        }
    }
}

impl From<serde_json::Error> for CrmError {
    fn from(err: serde_json::Error) -> Self {
        CrmError::Internal(format!("JSON serialization error: {}", err))
    }
}

impl ResponseError for CrmError {
    fn error_response(&self) -> HttpResponse {
        let status_code = self.status_code();

        if status_code.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }

        let mut body = json!({
            "code": status_code.as_u16(),
            "message": self.public_message(),
            "type": self.error_type(),
        });
        if let Some(details) = self.details() {
            body["details"] = details;
        }

        HttpResponse::build(status_code).json(json!({ "error": body }))
    }

    fn status_code(&self) -> StatusCode {
        match self {
            CrmError::Validation { .. } => StatusCode::BAD_REQUEST,
            CrmError::Unauthorized => StatusCode::UNAUTHORIZED,
            CrmError::InvalidCredentials => StatusCode::UNAUTHORIZED,
            CrmError::AccountDeactivated => StatusCode::UNAUTHORIZED,
            CrmError::Forbidden => StatusCode::FORBIDDEN,
            CrmError::NotFound { .. } => StatusCode::NOT_FOUND,
            CrmError::Conflict(_) => StatusCode::CONFLICT,
            CrmError::InsufficientFunds { .. } => StatusCode::BAD_REQUEST,
            CrmError::LockPeriodActive { .. } => StatusCode::BAD_REQUEST,
            CrmError::DatabaseUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            CrmError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            CrmError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::body::to_bytes;

    #[test]
    fn test_connection_errors_map_to_unavailable() {
        let err: CrmError = sqlx::Error::PoolTimedOut.into();
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);

        let err: CrmError = sqlx::Error::RowNotFound.into();
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[actix_web::test]
    async fn test_database_error_body_is_generic() {
        let err = CrmError::Database("relation \"users\" does not exist".to_string());
        let body = to_bytes(err.error_response().into_body()).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();

        assert_eq!(body["error"]["type"], "database_error");
        assert!(!body["error"]["message"]
            .as_str()
            .unwrap()
            .contains("relation"));
    }

    #[actix_web::test]
    async fn test_lock_period_reports_remaining_days() {
        let err = CrmError::LockPeriodActive {
            remaining_days: 42,
            unlock_at: Utc::now(),
        };
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);

        let body = to_bytes(err.error_response().into_body()).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["error"]["details"]["remainingDays"], 42);
    }
}
