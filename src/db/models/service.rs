//! Offered service models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A service a business offers (haircut, consultation, ...)
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Service {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub duration_minutes: i64,
    pub price: i64,
    pub is_active: i32,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceResponse {
    pub id: String,
    pub name: String,
    pub duration_minutes: i64,
    pub price: i64,
    pub is_active: bool,
    pub created_at: String,
    pub updated_at: String,
}

impl From<Service> for ServiceResponse {
    fn from(service: Service) -> Self {
        Self {
            id: service.id,
            name: service.name,
            duration_minutes: service.duration_minutes,
            price: service.price,
            is_active: service.is_active != 0,
            created_at: service.created_at,
            updated_at: service.updated_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateServiceRequest {
    pub name: String,
    pub duration_minutes: i64,
    #[serde(default)]
    pub price: i64,
}

#[derive(Debug, Deserialize)]
pub struct UpdateServiceRequest {
    pub name: Option<String>,
    pub duration_minutes: Option<i64>,
    pub price: Option<i64>,
    pub is_active: Option<bool>,
}
