//! SMS templates, delivery logs and queue rows.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Delivery state of one outgoing message
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SmsLogStatus {
    Queued,
    Sent,
    Failed,
    Cancelled,
}

impl SmsLogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Sent => "sent",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::str::FromStr for SmsLogStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "queued" => Ok(Self::Queued),
            "sent" => Ok(Self::Sent),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Unknown SMS status: {}", s)),
        }
    }
}

/// Why a message was sent
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SmsKind {
    Otp,
    Confirmation,
    Reminder,
    Cancellation,
    Manual,
}

impl SmsKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Otp => "otp",
            Self::Confirmation => "confirmation",
            Self::Reminder => "reminder",
            Self::Cancellation => "cancellation",
            Self::Manual => "manual",
        }
    }
}

impl std::fmt::Display for SmsKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SmsTemplate {
    pub id: String,
    #[serde(skip_serializing)]
    pub user_id: String,
    pub name: String,
    pub body: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateSmsTemplateRequest {
    pub name: String,
    pub body: String,
}

#[derive(Debug, Deserialize)]
pub struct UpdateSmsTemplateRequest {
    pub name: Option<String>,
    pub body: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SmsLog {
    pub id: String,
    #[serde(skip_serializing)]
    pub user_id: Option<String>,
    pub booking_id: Option<String>,
    pub phone: String,
    pub content: String,
    pub parts: i64,
    pub kind: String,
    pub status: String,
    pub gateway_message_id: Option<String>,
    pub error_message: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Row of the `sms_jobs` queue table
#[derive(Debug, Clone, FromRow)]
pub struct SmsJob {
    pub id: String,
    pub log_id: String,
    pub booking_id: Option<String>,
    /// JSON encoded `SmsPayload`
    pub payload: String,
    /// queued, processing, done, failed or cancelled
    pub status: String,
    pub attempts: i64,
    pub max_attempts: i64,
    pub run_at: String,
    pub locked_at: Option<String>,
    pub last_error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Recipients of a manual send: saved clients and/or raw numbers
#[derive(Debug, Deserialize)]
pub struct SendSmsRequest {
    #[serde(default)]
    pub client_ids: Vec<String>,
    #[serde(default)]
    pub phones: Vec<String>,
    /// Free text; ignored when `template_id` is set
    pub message: Option<String>,
    pub template_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SendSmsResponse {
    pub queued: usize,
    pub parts: i64,
    pub balance: i64,
}

#[derive(Debug, Deserialize)]
pub struct SmsLogQuery {
    pub page: Option<i64>,
    pub per_page: Option<i64>,
    pub status: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SmsLogPage {
    pub items: Vec<SmsLog>,
    pub page: i64,
    pub per_page: i64,
    pub total: i64,
}

#[derive(Debug, Serialize)]
pub struct SmsBalanceResponse {
    pub sms_balance: i64,
    pub queued: i64,
}
