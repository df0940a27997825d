//! In-app notification rows and transactional email.
//!
//! Everything here that runs as a side effect of another operation is best
//! effort: failures are logged and swallowed, so a balance change that already
//! committed is never reported as failed because a notice could not go out.

use crate::config::EmailConfig;
use crate::errors::{CrmError, Result};
use crate::metrics;
use crate::models::{Notification, NotificationType, User};
use crate::store::CrmStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub body: String,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, message: &EmailMessage) -> Result<()>;
}

/// Writes emails to the log instead of delivering them
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, message: &EmailMessage) -> Result<()> {
        info!(to = %message.to, subject = %message.subject, "email (log delivery)");
        Ok(())
    }
}

/// Delivers through an HTTP email relay that accepts JSON messages
pub struct HttpMailer {
    client: reqwest::Client,
    relay_url: String,
    api_key: Option<String>,
    from_address: String,
}

#[derive(Serialize)]
struct RelayPayload<'a> {
    from: &'a str,
    to: &'a str,
    subject: &'a str,
    text: &'a str,
}

impl HttpMailer {
    pub fn new(config: &EmailConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| CrmError::Internal(format!("email client: {}", e)))?;

        Ok(HttpMailer {
            client,
            relay_url: config.relay_url.clone(),
            api_key: config.api_key.clone(),
            from_address: config.from_address.clone(),
        })
    }
}

#[async_trait]
impl Mailer for HttpMailer {
    async fn send(&self, message: &EmailMessage) -> Result<()> {
        let payload = RelayPayload {
            from: &self.from_address,
            to: &message.to,
            subject: &message.subject,
            text: &message.body,
        };

        let mut request = self.client.post(&self.relay_url).json(&payload);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| CrmError::Internal(format!("email relay unreachable: {}", e)))?;

        if !response.status().is_success() {
            return Err(CrmError::Internal(format!(
                "email relay responded {}",
                response.status()
            )));
        }

        Ok(())
    }
}

/// Picks the relay when one is configured, log delivery otherwise.
pub fn mailer_from_config(config: &EmailConfig) -> Result<Arc<dyn Mailer>> {
    if config.relay_url.is_empty() {
        info!("No email relay configured, emails will be logged only");
        Ok(Arc::new(LogMailer))
    } else {
        Ok(Arc::new(HttpMailer::new(config)?))
    }
}

pub struct Notifier {
    store: Arc<dyn CrmStore>,
    mailer: Arc<dyn Mailer>,
    admin_address: String,
}

impl Notifier {
    pub fn new(store: Arc<dyn CrmStore>, mailer: Arc<dyn Mailer>, admin_address: String) -> Self {
        Notifier {
            store,
            mailer,
            admin_address,
        }
    }

    /// Notification row plus email to the user. Never fails.
    pub async fn notify(
        &self,
        user: &User,
        kind: NotificationType,
        title: &str,
        message: &str,
        now: DateTime<Utc>,
    ) {
        let notification = new_notification(Some(user.id), kind, title, message, now);
        if let Err(e) = self.store.insert_notification(notification).await {
            metrics::NOTIFICATION_FAILURES.with_label_values(&["in_app"]).inc();
            error!(user_id = %user.id, "Failed to store notification: {}", e);
        }

        self.email(EmailMessage {
            to: user.email.clone(),
            subject: title.to_string(),
            body: format!("Hello {},\n\n{}\n\nThe DiTokens Team", user.name, message),
        })
        .await;
    }

    /// Email to the operations mailbox. Never fails.
    pub async fn notify_admins(&self, subject: &str, body: String) {
        self.email(EmailMessage {
            to: self.admin_address.clone(),
            subject: subject.to_string(),
            body,
        })
        .await;
    }

    pub async fn email(&self, message: EmailMessage) {
        if let Err(e) = self.mailer.send(&message).await {
            metrics::NOTIFICATION_FAILURES.with_label_values(&["email"]).inc();
            error!(to = %message.to, subject = %message.subject, "Failed to send email: {}", e);
        }
    }

    /// Global announcement visible to every user. This is the primary effect
    /// of the request, so storage errors propagate.
    pub async fn broadcast(&self, title: &str, message: &str, now: DateTime<Utc>) -> Result<Notification> {
        let notification = new_notification(None, NotificationType::Announcement, title, message, now);
        self.store.insert_notification(notification).await
    }
}

pub fn new_notification(
    user_id: Option<Uuid>,
    kind: NotificationType,
    title: &str,
    message: &str,
    now: DateTime<Utc>,
) -> Notification {
    Notification {
        id: Uuid::new_v4(),
        user_id,
        kind,
        title: title.to_string(),
        message: message.to_string(),
        is_read: false,
        created_at: now,
    }
}

pub fn welcome_email(user: &User) -> EmailMessage {
    EmailMessage {
        to: user.email.clone(),
        subject: "Welcome to DiTokens".to_string(),
        body: format!(
            "Hello {},\n\nYour DiTokens account is ready. Share your referral code {} \
             to earn commission on purchases made by the people you invite.\n\nThe DiTokens Team",
            user.name, user.referral_code
        ),
    }
}

pub fn admin_signup_body(user: &User) -> String {
    format!(
        "New user registered\n\nName: {}\nEmail: {}\nCountry: {} / {}\nReferred by: {}",
        user.name,
        user.email,
        user.country,
        user.state,
        user.referred_by.as_deref().unwrap_or("-")
    )
}
