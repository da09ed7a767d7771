//! Subscription plans, SMS packs and purchases.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Plan {
    pub id: String,
    pub name: String,
    pub price: i64,
    pub duration_days: i64,
    pub monthly_sms: i64,
    pub is_active: i32,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SmsPack {
    pub id: String,
    pub name: String,
    pub price: i64,
    pub sms_count: i64,
    pub is_active: i32,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Deserialize)]
pub struct CreatePlanRequest {
    pub name: String,
    pub price: i64,
    pub duration_days: i64,
    pub monthly_sms: i64,
}

#[derive(Debug, Deserialize)]
pub struct UpdatePlanRequest {
    pub name: Option<String>,
    pub price: Option<i64>,
    pub duration_days: Option<i64>,
    pub monthly_sms: Option<i64>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct CreateSmsPackRequest {
    pub name: String,
    pub price: i64,
    pub sms_count: i64,
}

#[derive(Debug, Deserialize)]
pub struct UpdateSmsPackRequest {
    pub name: Option<String>,
    pub price: Option<i64>,
    pub sms_count: Option<i64>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PurchaseKind {
    Plan,
    SmsPack,
}

impl PurchaseKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plan => "plan",
            Self::SmsPack => "sms_pack",
        }
    }
}

impl std::str::FromStr for PurchaseKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plan" => Ok(Self::Plan),
            "sms_pack" => Ok(Self::SmsPack),
            _ => Err(format!("Unknown purchase kind: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Purchase {
    pub id: String,
    #[serde(skip_serializing)]
    pub user_id: String,
    pub kind: String,
    pub item_id: String,
    pub amount: i64,
    pub authority: Option<String>,
    pub ref_id: Option<String>,
    /// pending, paid or failed
    pub status: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Deserialize)]
pub struct BuyPlanRequest {
    pub plan_id: String,
}

#[derive(Debug, Deserialize)]
pub struct BuySmsPackRequest {
    pub pack_id: String,
}

#[derive(Debug, Serialize)]
pub struct PaymentStartResponse {
    pub purchase_id: String,
    pub payment_url: String,
}

/// Query string the payment gateway appends to the callback URL
#[derive(Debug, Deserialize)]
pub struct PaymentCallbackQuery {
    #[serde(rename = "Authority")]
    pub authority: String,
    #[serde(rename = "Status")]
    pub status: String,
}
