//! Data models for users and e-mail verification

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Verification links are valid for this long
pub const VERIFY_EMAIL_TTL_MINUTES: i64 = 15;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct User {
    pub username: String,
    /// Already hashed by the credential layer
    #[serde(skip_serializing)]
    pub hashed_password: String,
    pub full_name: String,
    pub email: String,
    pub is_email_verified: bool,
    pub password_changed_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct VerifyEmail {
    pub id: i64,
    pub username: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub secret_code: String,
    pub is_used: bool,
    pub created_at: DateTime<Utc>,
    pub expired_at: DateTime<Utc>,
}

impl VerifyEmail {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expired_at
    }
}

#[derive(Debug, Clone)]
pub struct CreateUserParams {
    pub username: String,
    pub hashed_password: String,
    pub full_name: String,
    pub email: String,
}

/// `None` fields are left unchanged
#[derive(Debug, Clone, Default)]
pub struct UpdateUserParams {
    pub username: String,
    pub hashed_password: Option<String>,
    pub password_changed_at: Option<DateTime<Utc>>,
    pub full_name: Option<String>,
    pub email: Option<String>,
    pub is_email_verified: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct CreateVerifyEmailParams {
    pub username: String,
    pub email: String,
    pub secret_code: String,
}

#[derive(Debug, Clone)]
pub struct UpdateVerifyEmailParams {
    pub id: i64,
    pub secret_code: String,
}
