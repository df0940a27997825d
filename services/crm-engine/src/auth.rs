//! Passwords, session tokens and role capabilities.
//!
//! Session tokens only identify the caller. What the caller may do is decided
//! from the role stored on the user record, re-read on every request.

use crate::errors::{CrmError, Result};
use crate::models::{Role, User};
use argon2::password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const SESSION_COOKIE: &str = "ditokens_session";

const REFERRAL_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
const REFERRAL_CODE_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    ReviewTransactions,
    ReviewWithdrawals,
    ReviewCommissions,
    ManageUsers,
    Broadcast,
    ManagePrices,
    ManageSettings,
    AssignRoles,
}

impl Role {
    pub fn grants(&self, capability: Capability) -> bool {
        match self {
            Role::User => false,
            Role::Admin => !matches!(
                capability,
                Capability::ManageSettings | Capability::AssignRoles
            ),
            Role::SuperAdmin => true,
        }
    }
}

/// Fails unless the persisted user is active and holds `capability`.
pub fn require(user: &User, capability: Capability) -> Result<()> {
    if !user.is_active {
        return Err(CrmError::AccountDeactivated);
    }

    if user.role.grants(capability) {
        Ok(())
    } else {
        tracing::warn!(user_id = %user.id, ?capability, "capability denied");
        Err(CrmError::Forbidden)
    }
}

pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| CrmError::Internal(format!("password hashing failed: {}", e)))
}

pub fn verify_password(password: &str, password_hash: &str) -> bool {
    match PasswordHash::new(password_hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

pub fn generate_referral_code() -> String {
    let mut rng = rand::thread_rng();
    (0..REFERRAL_CODE_LEN)
        .map(|_| REFERRAL_ALPHABET[rng.gen_range(0..REFERRAL_ALPHABET.len())] as char)
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub role: Role,
    pub iat: usize,
    pub exp: usize,
}

#[derive(Clone)]
pub struct SessionKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: Duration,
}

impl SessionKeys {
    pub fn new(secret: &str, ttl_hours: i64) -> Self {
        SessionKeys {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            ttl: Duration::hours(ttl_hours),
        }
    }

    pub fn issue(&self, user: &User, now: DateTime<Utc>) -> Result<(String, DateTime<Utc>)> {
        let expires_at = now + self.ttl;
        let claims = Claims {
            sub: user.id,
            role: user.role,
            iat: now.timestamp() as usize,
            exp: expires_at.timestamp() as usize,
        };

        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| CrmError::Internal(format!("session token encoding failed: {}", e)))?;

        Ok((token, expires_at))
    }

    pub fn verify(&self, token: &str) -> Result<Claims> {
        decode::<Claims>(token, &self.decoding, &Validation::new(Algorithm::HS256))
            .map(|data| data.claims)
            .map_err(|err| {
                tracing::debug!("session token rejected: {:?}", err);
                CrmError::Unauthorized
            })
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}
