//! Business owner, admin and login code models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A business owner account
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: String,
    pub phone: String,
    pub name: String,
    pub business_name: String,
    pub slug: String,
    pub sms_balance: i64,
    pub plan_id: Option<String>,
    pub plan_expires_at: Option<String>,
    pub reminder_minutes: i64,
    pub is_active: i32,
    pub created_at: String,
    pub updated_at: String,
}

impl User {
    pub fn is_active(&self) -> bool {
        self.is_active != 0
    }

    /// Whether the subscription is still running at `now` (canonical timestamp)
    pub fn has_active_plan(&self, now: &str) -> bool {
        match (&self.plan_id, &self.plan_expires_at) {
            (Some(_), Some(expires_at)) => expires_at.as_str() > now,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserResponse {
    pub id: String,
    pub phone: String,
    pub name: String,
    pub business_name: String,
    pub slug: String,
    pub sms_balance: i64,
    pub plan_id: Option<String>,
    pub plan_expires_at: Option<String>,
    pub reminder_minutes: i64,
    pub is_active: bool,
    pub created_at: String,
}

impl From<User> for UserResponse {
    fn from(user: User) -> Self {
        Self {
            is_active: user.is_active(),
            id: user.id,
            phone: user.phone,
            name: user.name,
            business_name: user.business_name,
            slug: user.slug,
            sms_balance: user.sms_balance,
            plan_id: user.plan_id,
            plan_expires_at: user.plan_expires_at,
            reminder_minutes: user.reminder_minutes,
            created_at: user.created_at,
        }
    }
}

/// Business profile settings editable by the owner
#[derive(Debug, Deserialize)]
pub struct UpdateSettingsRequest {
    pub name: Option<String>,
    pub business_name: Option<String>,
    pub slug: Option<String>,
    pub reminder_minutes: Option<i64>,
}

/// Platform administrator
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Admin {
    pub id: String,
    pub username: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub created_at: String,
}

#[derive(Debug, Deserialize)]
pub struct AdminLoginRequest {
    pub username: String,
    pub password: String,
}

/// A pending phone login code; only the hash of the code is stored
#[derive(Debug, Clone, FromRow)]
pub struct OtpCode {
    pub id: String,
    pub phone: String,
    pub code_hash: String,
    pub expires_at: String,
    pub attempts: i64,
    pub consumed: i32,
    pub created_at: String,
}

#[derive(Debug, Deserialize)]
pub struct OtpRequest {
    pub phone: String,
}

#[derive(Debug, Deserialize)]
pub struct OtpVerifyRequest {
    pub phone: String,
    pub code: String,
    /// Display name used when the phone registers for the first time
    pub name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub user: UserResponse,
    pub is_new: bool,
}
